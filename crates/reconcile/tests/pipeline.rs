use std::sync::Arc;
use std::time::Duration;

use agentop_core::builder::{node, AgentDeploymentBuilder, AgentProfileBuilder};
use agentop_core::condition::{self, ConditionStatus};
use agentop_core::crd::ComponentOverride;
use agentop_core::names::{self, containers};
use agentop_core::{AgentDeployment, AgentProfile, ComponentName, Error};
use agentop_feature::{env, env_value, FeatureOptions, InstallInfo};
use agentop_kubehub::{Fault, MemStore, ObjectKey, ObjectKind, ObjectStore, Op};
use agentop_reconcile::{Outcome, Reconciler, ReconcilerOptions, DEFAULT_REQUEUE, STATUS_CONFLICT_REQUEUE};
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Node, PodTemplateSpec};
use k8s_openapi::api::rbac::v1::ClusterRole;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;

const APPARMOR_ANNOTATION: &str = "container.apparmor.security.beta.kubernetes.io/system-probe";

fn now() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

fn options() -> ReconcilerOptions {
    ReconcilerOptions {
        features: FeatureOptions {
            install: InstallInfo { id: "install-1".into(), time: 1_700_000_000, type_: "k8s_manual".into() },
            generate_token: || "generated".to_string(),
        },
        ..Default::default()
    }
}

fn base() -> AgentDeploymentBuilder {
    AgentDeploymentBuilder::new("ns", "dd").with_credentials("api", "app")
}

fn setup(inst: AgentDeployment, opts: ReconcilerOptions) -> (Arc<MemStore>, Reconciler) {
    let store = Arc::new(MemStore::new());
    store.seed(ObjectKind::AgentDeployment, &inst).unwrap();
    let r = Reconciler::new(store.clone(), opts);
    (store, r)
}

fn key() -> ObjectKey {
    ObjectKey::namespaced(ObjectKind::AgentDeployment, "ns", "dd")
}

fn ns_key(kind: ObjectKind, name: &str) -> ObjectKey {
    ObjectKey::namespaced(kind, "ns", name)
}

async fn pass(r: &Reconciler) -> agentop_core::Result<Outcome> {
    r.reconcile("ns", "dd", now()).await
}

fn instance(store: &MemStore) -> AgentDeployment {
    store.typed(&key()).unwrap()
}

fn reseed(store: &MemStore, f: impl FnOnce(&mut AgentDeployment)) {
    let mut inst = instance(store);
    f(&mut inst);
    store.seed(ObjectKind::AgentDeployment, &inst).unwrap();
}

fn template_of(store: &MemStore, name: &str) -> PodTemplateSpec {
    let d: Deployment = store.typed(&ns_key(ObjectKind::Deployment, name)).unwrap();
    d.spec.unwrap().template
}

fn node_template(store: &MemStore, name: &str) -> PodTemplateSpec {
    let ds: DaemonSet = store.typed(&ns_key(ObjectKind::DaemonSet, name)).unwrap();
    ds.spec.unwrap().template
}

fn container_names(t: &PodTemplateSpec) -> Vec<String> {
    t.spec.as_ref().map(|s| s.containers.iter().map(|c| c.name.clone()).collect()).unwrap_or_default()
}

/// Node names the DaemonSet keeps off through `metadata.name NotIn`.
fn excluded_nodes(store: &MemStore, name: &str) -> Vec<String> {
    let terms = node_template(store, name)
        .spec
        .and_then(|s| s.affinity)
        .and_then(|a| a.node_affinity)
        .and_then(|na| na.required_during_scheduling_ignored_during_execution)
        .map(|sel| sel.node_selector_terms)
        .unwrap_or_default();
    terms
        .into_iter()
        .flat_map(|t| t.match_fields.unwrap_or_default())
        .filter(|f| f.key == "metadata.name" && f.operator == "NotIn")
        .flat_map(|f| f.values.unwrap_or_default())
        .collect()
}

#[tokio::test]
async fn first_pass_converges_and_second_pass_writes_nothing() {
    let (store, r) = setup(base().build(), options());

    let out = pass(&r).await.unwrap();
    assert_eq!(out, Outcome::requeue(DEFAULT_REQUEUE));
    assert!(store.contains(&ns_key(ObjectKind::Deployment, "dd-cluster-agent")));
    assert!(store.contains(&ns_key(ObjectKind::DaemonSet, "dd-agent")));
    assert!(store.contains(&ns_key(ObjectKind::Secret, "dd-token")));
    assert!(!store.contains(&ns_key(ObjectKind::Deployment, "dd-cluster-checks-runner")));

    let inst = instance(&store);
    assert!(inst.finalizers().iter().any(|f| f == names::FINALIZER));
    let st = inst.status.unwrap();
    assert_eq!(st.generated_token(), Some("generated"));
    let err = condition::find(&st.conditions, condition::RECONCILE_ERROR).unwrap();
    assert_eq!(err.status, ConditionStatus::False);
    assert!(condition::is_true(&st.conditions, condition::CLUSTER_AGENT_RECONCILED));
    assert!(condition::is_true(&st.conditions, condition::NODE_AGENT_RECONCILED));
    assert_eq!(st.agent.unwrap().names, vec!["dd-agent"]);

    store.clear_writes();
    let again = pass(&r).await.unwrap();
    assert_eq!(again, Outcome::requeue(DEFAULT_REQUEUE));
    assert_eq!(store.writes(), vec![]);
}

#[tokio::test]
async fn missing_credentials_publish_error_and_touch_no_workload() {
    let (store, r) = setup(AgentDeploymentBuilder::new("ns", "dd").build(), options());

    let err = pass(&r).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "err={}", err);
    assert_eq!(store.count(Op::Create), 0);
    assert!(store.keys(ObjectKind::Deployment).is_empty());
    assert!(store.keys(ObjectKind::DaemonSet).is_empty());

    let st = instance(&store).status.unwrap();
    let c = condition::find(&st.conditions, condition::RECONCILE_ERROR).unwrap();
    assert_eq!(c.status, ConditionStatus::True);
    assert!(c.message.as_deref().unwrap_or_default().contains("credentials"));
}

#[tokio::test]
async fn status_conflict_requeues_after_one_second() {
    let (store, r) = setup(base().build(), options());
    store.inject(Op::UpdateStatus, ObjectKind::AgentDeployment, Fault::Conflict, 1);

    let out = pass(&r).await.unwrap();
    assert_eq!(out, Outcome::requeue(STATUS_CONFLICT_REQUEUE));
    assert_eq!(store.count(Op::UpdateStatus), 0);
    assert!(instance(&store).status.is_none());

    let out = pass(&r).await.unwrap();
    assert_eq!(out, Outcome::requeue(DEFAULT_REQUEUE));
    assert_eq!(store.count(Op::UpdateStatus), 1);
    assert_eq!(instance(&store).status.unwrap().generated_token(), Some("generated"));
}

#[tokio::test]
async fn toggling_instrumentation_adds_then_removes_cluster_agent_env() {
    let (store, r) = setup(base().build(), options());
    pass(&r).await.unwrap();
    let t = template_of(&store, "dd-cluster-agent");
    assert!(env_value(&t, containers::CLUSTER_AGENT, env::INSTRUMENTATION_ENABLED).is_none());

    reseed(&store, |i| *i = AgentDeploymentBuilder::from(i.clone()).with_instrumentation(true).build());
    pass(&r).await.unwrap();
    let t = template_of(&store, "dd-cluster-agent");
    assert_eq!(env_value(&t, containers::CLUSTER_AGENT, env::INSTRUMENTATION_ENABLED), Some("true"));
    assert_eq!(env_value(&t, containers::CLUSTER_AGENT, env::INSTRUMENTATION_WEBHOOK), Some("dd-webhook"));
    let ds: DaemonSet = store.typed(&ns_key(ObjectKind::DaemonSet, "dd-agent")).unwrap();
    let nt = ds.spec.unwrap().template;
    assert_eq!(env_value(&nt, containers::TRACE_AGENT, env::INSTALL_ID), Some("install-1"));

    reseed(&store, |i| {
        if let Some(apm) = i.spec.features.as_mut().and_then(|f| f.apm.as_mut()) {
            apm.enabled = Some(false);
            apm.instrumentation = None;
        }
    });
    pass(&r).await.unwrap();
    let t = template_of(&store, "dd-cluster-agent");
    assert!(env_value(&t, containers::CLUSTER_AGENT, env::INSTRUMENTATION_ENABLED).is_none());
    assert!(env_value(&t, containers::CLUSTER_AGENT, env::INSTRUMENTATION_WEBHOOK).is_none());
    let ds: DaemonSet = store.typed(&ns_key(ObjectKind::DaemonSet, "dd-agent")).unwrap();
    let names: Vec<String> = ds.spec.unwrap().template.spec.unwrap().containers.into_iter().map(|c| c.name).collect();
    assert!(!names.iter().any(|n| n == containers::TRACE_AGENT));
    assert_eq!(names[0], containers::AGENT);
}

#[tokio::test]
async fn disabling_cluster_agent_deletes_its_deployment() {
    let (store, r) = setup(base().build(), options());
    pass(&r).await.unwrap();
    let dca = ns_key(ObjectKind::Deployment, "dd-cluster-agent");
    assert!(store.contains(&dca));

    reseed(&store, |i| {
        i.spec.overrides.insert(
            ComponentName::ClusterAgent,
            ComponentOverride { disabled: Some(true), ..Default::default() },
        );
    });
    store.clear_writes();
    pass(&r).await.unwrap();
    assert!(!store.contains(&dca));
    assert!(store.writes().contains(&(Op::Delete, dca)));
    assert!(!store.contains(&ns_key(ObjectKind::Service, "dd-cluster-agent")));
    assert!(!store.contains(&ObjectKey::cluster(ObjectKind::ClusterRole, "dd-cluster-agent")));

    let st = instance(&store).status.unwrap();
    let dca_status = st.cluster_agent.unwrap();
    assert_eq!(dca_status.generated_token.as_deref(), Some("generated"));
    assert!(dca_status.names.is_empty());
    assert!(condition::find(&st.conditions, condition::CLUSTER_AGENT_RECONCILED).is_none());
}

#[tokio::test]
async fn dropped_feature_dependencies_are_cleaned_up() {
    let (store, r) = setup(base().build(), options());
    pass(&r).await.unwrap();
    let ksm = ns_key(ObjectKind::ConfigMap, "dd-kube-state-metrics-core-config");
    assert!(store.contains(&ksm));

    reseed(&store, |i| *i = AgentDeploymentBuilder::from(i.clone()).with_kube_state_metrics_core(false).build());
    pass(&r).await.unwrap();
    assert!(!store.contains(&ksm));
    assert!(!store.contains(&ObjectKey::cluster(ObjectKind::ClusterRole, "dd-ksm-core")));
}

#[tokio::test]
async fn dependency_failure_is_published_then_recovers() {
    let (store, r) = setup(base().build(), options());
    store.inject(Op::Create, ObjectKind::ConfigMap, Fault::Internal("boom".into()), 1);

    let err = pass(&r).await.unwrap_err();
    assert_eq!(err.count(), 1);
    let st = instance(&store).status.unwrap();
    let c = condition::find(&st.conditions, condition::RECONCILE_ERROR).unwrap();
    assert_eq!(c.status, ConditionStatus::True);
    assert!(c.message.as_deref().unwrap_or_default().contains("boom"));
    // Workloads still converge; only the failed dependency is missing.
    assert!(store.contains(&ns_key(ObjectKind::DaemonSet, "dd-agent")));

    pass(&r).await.unwrap();
    let st = instance(&store).status.unwrap();
    assert_eq!(condition::find(&st.conditions, condition::RECONCILE_ERROR).unwrap().status, ConditionStatus::False);
    assert_eq!(store.keys(ObjectKind::ConfigMap).len(), 2);
    let _: ConfigMap = store.typed(&ns_key(ObjectKind::ConfigMap, "dd-install-info")).unwrap();
}

#[tokio::test]
async fn profiles_split_node_agents_and_leave_nodes_untouched() {
    let opts = ReconcilerOptions { profiles_enabled: true, ..options() };
    let (store, r) = setup(base().build(), opts);
    for n in [node("a1", &[("pool", "a")]), node("b1", &[("pool", "b")])] {
        store.seed(ObjectKind::Node, &n).unwrap();
    }
    let profile = AgentProfileBuilder::new("ns", "gpu")
        .created_at(Utc.timestamp_opt(1, 0).unwrap())
        .selector("pool", "In", &["a"])
        .container_env(containers::AGENT, "AGENT_LOG_LEVEL", "debug")
        .build();
    store.seed(ObjectKind::AgentProfile, &profile).unwrap();

    pass(&r).await.unwrap();

    let gpu: DaemonSet = store.typed(&ns_key(ObjectKind::DaemonSet, "dd-agent-profile-ns-gpu")).unwrap();
    let gt = gpu.spec.unwrap().template;
    assert_eq!(env_value(&gt, containers::AGENT, "AGENT_LOG_LEVEL"), Some("debug"));
    let default: DaemonSet = store.typed(&ns_key(ObjectKind::DaemonSet, "dd-agent")).unwrap();
    let dt = default.spec.unwrap().template;
    assert!(env_value(&dt, containers::AGENT, "AGENT_LOG_LEVEL").is_none());

    assert_eq!(excluded_nodes(&store, "dd-agent"), vec!["a1"]);
    assert!(store.writes().iter().all(|(_, k)| k.kind != ObjectKind::Node));
    let a1: Node = store.typed(&ObjectKey::cluster(ObjectKind::Node, "a1")).unwrap();
    assert!(a1.labels().get(names::LABEL_PROFILE).is_none());

    let stored: AgentProfile = store.typed(&ns_key(ObjectKind::AgentProfile, "gpu")).unwrap();
    let ps = stored.status.unwrap();
    assert!(condition::is_true(&ps.conditions, condition::PROFILE_APPLIED));
    assert_eq!(ps.covered_nodes, vec!["a1"]);

    let st = instance(&store).status.unwrap();
    assert_eq!(st.agent.unwrap().names, vec!["dd-agent", "dd-agent-profile-ns-gpu"]);

    store.clear_writes();
    pass(&r).await.unwrap();
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn removed_profile_drops_its_daemon_set_and_node_exclusion() {
    let opts = ReconcilerOptions { profiles_enabled: true, ..options() };
    let (store, r) = setup(base().build(), opts);
    store.seed(ObjectKind::Node, &node("a1", &[("pool", "a")])).unwrap();
    let profile = AgentProfileBuilder::new("ns", "gpu").selector("pool", "In", &["a"]).build();
    store.seed(ObjectKind::AgentProfile, &profile).unwrap();
    pass(&r).await.unwrap();
    let gpu = ns_key(ObjectKind::DaemonSet, "dd-agent-profile-ns-gpu");
    assert!(store.contains(&gpu));
    assert_eq!(excluded_nodes(&store, "dd-agent"), vec!["a1"]);

    store.delete(&ns_key(ObjectKind::AgentProfile, "gpu")).await.unwrap();
    pass(&r).await.unwrap();
    assert!(!store.contains(&gpu));
    // The default agent must cover a1 again.
    assert!(excluded_nodes(&store, "dd-agent").is_empty());
}

#[tokio::test]
async fn disabling_npm_strips_system_probe_and_its_annotation() {
    let (store, r) = setup(base().with_npm(true).build(), options());
    pass(&r).await.unwrap();
    let t = node_template(&store, "dd-agent");
    assert!(container_names(&t).iter().any(|n| n == containers::SYSTEM_PROBE));
    assert!(t.metadata.as_ref().and_then(|m| m.annotations.as_ref()).is_some_and(|a| a.contains_key(APPARMOR_ANNOTATION)));

    reseed(&store, |i| *i = AgentDeploymentBuilder::from(i.clone()).with_npm(false).build());
    pass(&r).await.unwrap();
    let t = node_template(&store, "dd-agent");
    assert!(!container_names(&t).iter().any(|n| n == containers::SYSTEM_PROBE));
    let annotations = t.metadata.and_then(|m| m.annotations).unwrap_or_default();
    assert!(!annotations.contains_key(APPARMOR_ANNOTATION), "annotations={:?}", annotations);
    let volumes = t.spec.unwrap().volumes.unwrap_or_default();
    assert!(!volumes.iter().any(|v| v.name == "debugfs"));
}

#[tokio::test]
async fn introspection_splits_node_agents_per_provider() {
    let opts = ReconcilerOptions { introspection_enabled: true, ..options() };
    let (store, r) = setup(base().with_log_collection(true).build(), opts);
    store.seed(ObjectKind::Node, &node("cos", &[(names::providers::GKE_OS_LABEL, "cos")])).unwrap();
    store.seed(ObjectKind::Node, &node("plain", &[])).unwrap();

    pass(&r).await.unwrap();
    assert!(!store.contains(&ns_key(ObjectKind::DaemonSet, "dd-agent")));
    let cos: DaemonSet = store.typed(&ns_key(ObjectKind::DaemonSet, "dd-agent-gke-cos")).unwrap();
    let plain: DaemonSet = store.typed(&ns_key(ObjectKind::DaemonSet, "dd-agent-default")).unwrap();
    let vols = |ds: DaemonSet| -> Vec<String> {
        ds.spec.unwrap().template.spec.unwrap().volumes.unwrap_or_default().into_iter().map(|v| v.name).collect()
    };
    assert!(!vols(cos).iter().any(|v| v == "logdockercontainerpath"));
    assert!(vols(plain).iter().any(|v| v == "logdockercontainerpath"));
}

#[tokio::test]
async fn deletion_cleans_cluster_scoped_objects_then_releases_finalizer() {
    let (store, r) = setup(base().build(), options());
    pass(&r).await.unwrap();
    let role = ObjectKey::cluster(ObjectKind::ClusterRole, "dd-agent");
    let _: ClusterRole = store.typed(&role).unwrap();

    store.delete(&key()).await.unwrap();
    assert!(store.contains(&key()));

    let out = pass(&r).await.unwrap();
    assert_eq!(out, Outcome::done());
    assert!(!store.contains(&role));
    assert!(store.keys(ObjectKind::ClusterRoleBinding).is_empty());
    assert!(!store.contains(&key()));
}

#[tokio::test]
async fn missing_instance_is_done() {
    let store = Arc::new(MemStore::new());
    let r = Reconciler::new(store.clone(), options());
    assert_eq!(pass(&r).await.unwrap(), Outcome::done());
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn cancelled_pass_writes_nothing() {
    let (store, r) = setup(base().build(), options());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = r.reconcile_until("ns", "dd", now(), &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(store.write_count(), 0);

    let live = CancellationToken::new();
    let out = r.reconcile_until("ns", "dd", now(), &live).await.unwrap();
    assert_eq!(out.requeue_after, Some(Duration::from_secs(15)));
}
