//! Kubernetes state metrics core check, run by the cluster agent (or a runner when cluster checks use runners).

use std::collections::BTreeMap;

use agentop_apply::ResourceManagers;
use agentop_core::crd::enabled;
use agentop_core::names::{self, containers};
use agentop_core::{AgentDeployment, ComponentName, Result};
use k8s_openapi::api::core::v1::{ConfigMapVolumeSource, Volume, VolumeMount};
use k8s_openapi::api::rbac::v1::PolicyRule;
use kube::ResourceExt;

use crate::{collect, env, Capability, Feature, FeatureId, FeatureOptions, RequiredComponent, RequiredComponents, Scope};

pub const CONFIG_KEY: &str = "kubernetes_state_core.yaml";
const CONFIG_VOLUME: &str = "ksm-core-config";
const CONFIG_PATH: &str = "/etc/agentop/conf.d/kubernetes_state_core.d";

#[derive(Debug, Clone)]
pub struct KubeStateMetricsCore {
    owner: String,
    cluster_check: bool,
}

pub fn config_map_name(owner: &str) -> String {
    format!("{}-kube-state-metrics-core-config", owner)
}

pub fn rbac_name(owner: &str) -> String {
    format!("{}-ksm-core", owner)
}

pub(crate) fn build(instance: &AgentDeployment, _: &FeatureOptions) -> Option<Feature> {
    let f = instance.features();
    if !enabled(f.kube_state_metrics_core.and_then(|t| t.enabled)) {
        return None;
    }
    let cluster_check = f
        .cluster_checks
        .map(|c| enabled(c.enabled) && enabled(c.use_cluster_checks_runners))
        .unwrap_or(false);
    Some(Feature::KubeStateMetricsCore(KubeStateMetricsCore { owner: instance.name_any(), cluster_check }))
}

fn config(cluster_check: bool) -> String {
    format!(
        "cluster_check: {}\ninit_config:\ninstances:\n  - collectors:\n    - pods\n    - replicationcontrollers\n    - statefulsets\n    - nodes\n    - cronjobs\n    - jobs\n    - replicasets\n    - deployments\n    - configmaps\n    - services\n    - endpoints\n    - daemonsets\n    - horizontalpodautoscalers\n    - limitranges\n    - resourcequotas\n    - secrets\n    - namespaces\n    - persistentvolumeclaims\n    - persistentvolumes\n    telemetry: true\n    skip_leader_election: {}\n",
        cluster_check, cluster_check
    )
}

fn rules() -> Vec<PolicyRule> {
    let list_watch = vec!["list".to_string(), "watch".to_string()];
    let group = |g: &str, rs: &[&str]| PolicyRule {
        api_groups: Some(vec![g.to_string()]),
        resources: Some(rs.iter().map(|s| s.to_string()).collect()),
        verbs: list_watch.clone(),
        ..Default::default()
    };
    vec![
        group(
            "",
            &[
                "configmaps", "endpoints", "events", "limitranges", "namespaces", "nodes", "persistentvolumeclaims",
                "persistentvolumes", "pods", "replicationcontrollers", "resourcequotas", "secrets", "services",
            ],
        ),
        group("apps", &["daemonsets", "deployments", "replicasets", "statefulsets"]),
        group("batch", &["cronjobs", "jobs"]),
        group("autoscaling", &["horizontalpodautoscalers"]),
    ]
}

impl KubeStateMetricsCore {
    fn runs_on(&self) -> ComponentName {
        if self.cluster_check {
            ComponentName::ClusterChecksRunner
        } else {
            ComponentName::ClusterAgent
        }
    }
}

impl Capability for KubeStateMetricsCore {
    fn id(&self) -> FeatureId {
        FeatureId::KubeStateMetricsCore
    }

    fn requirements(&self) -> RequiredComponents {
        RequiredComponents { cluster_agent: RequiredComponent::yes(), ..Default::default() }
    }

    fn manage_dependencies(&self, managers: &mut ResourceManagers, required: &RequiredComponents) -> Result<()> {
        let ns = managers.owner().namespace.clone();
        let mut errs = Vec::new();
        let data = BTreeMap::from([(CONFIG_KEY.to_string(), config(self.cluster_check))]);
        errs.extend(managers.config_map(&ns, &config_map_name(&self.owner), data).err());

        let runner = self.runs_on();
        if required.is_enabled(runner) {
            let name = rbac_name(&self.owner);
            let sa = names::component(&self.owner, runner);
            errs.extend(managers.cluster_role_rules(&name, rules()).err());
            errs.extend(managers.cluster_role_binding(&name, &name, &ns, &sa).err());
        }
        collect(errs)
    }

    fn configure(&self, component: ComponentName, template: &mut Scope<'_>, _: &str) {
        if component != ComponentName::ClusterAgent {
            return;
        }
        let c = containers::CLUSTER_AGENT;
        template.add_env(c, env::KSM_CORE_ENABLED, "true");
        template.add_env(c, env::KSM_CORE_CONFIGMAP, config_map_name(&self.owner));
        template.add_volume(Volume {
            name: CONFIG_VOLUME.into(),
            config_map: Some(ConfigMapVolumeSource { name: Some(config_map_name(&self.owner)), ..Default::default() }),
            ..Default::default()
        });
        template.add_volume_mount(
            c,
            VolumeMount { name: CONFIG_VOLUME.into(), mount_path: CONFIG_PATH.into(), read_only: Some(true), ..Default::default() },
        );
    }
}
