//! agentop features: optional capabilities turned into dependencies and pod-template mutations.
//!
//! The candidate table is static and ordered; [`build_features`] walks it, keeps
//! the features whose toggles are on and folds their component requirements.
//! Order matters: later features may read values earlier ones derive
//! (instrumentation reads the admission webhook name).

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use agentop_apply::ResourceManagers;
use agentop_core::{AgentDeployment, ComponentName, Error, Result};
use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, ObjectFieldSelector, SecretKeySelector};
use tracing::{debug, warn};

pub mod admission;
mod apm;
mod asm;
mod cluster_checks;
mod defaults;
mod instrumentation;
mod ksm;
mod logs;
pub mod manager;
mod npm;
mod orchestrator;

pub use manager::{env_value, KeyOwner, PodTemplateManager, Scope};

/// Stable capability ids, in activation priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeatureId {
    Defaults,
    AdmissionController,
    Asm,
    Instrumentation,
    Apm,
    LogCollection,
    Npm,
    OrchestratorExplorer,
    KubeStateMetricsCore,
    ClusterChecks,
}

impl FeatureId {
    pub const ALL: [FeatureId; 10] = [
        FeatureId::Defaults,
        FeatureId::AdmissionController,
        FeatureId::Asm,
        FeatureId::Instrumentation,
        FeatureId::Apm,
        FeatureId::LogCollection,
        FeatureId::Npm,
        FeatureId::OrchestratorExplorer,
        FeatureId::KubeStateMetricsCore,
        FeatureId::ClusterChecks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureId::Defaults => "default",
            FeatureId::AdmissionController => "admission_controller",
            FeatureId::Asm => "asm",
            FeatureId::Instrumentation => "instrumentation",
            FeatureId::Apm => "apm",
            FeatureId::LogCollection => "log_collection",
            FeatureId::Npm => "npm",
            FeatureId::OrchestratorExplorer => "orchestrator_explorer",
            FeatureId::KubeStateMetricsCore => "kubernetes_state_core",
            FeatureId::ClusterChecks => "cluster_checks",
        }
    }
}

impl std::fmt::Display for FeatureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Installation identity reported by the node agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallInfo {
    pub id: String,
    /// Unix seconds.
    pub time: i64,
    pub type_: String,
}

impl Default for InstallInfo {
    fn default() -> Self {
        Self { id: String::new(), time: 0, type_: "k8s_manual".into() }
    }
}

#[derive(Debug, Clone)]
pub struct FeatureOptions {
    pub install: InstallInfo,
    /// Source of new cluster-agent tokens when none is known yet.
    pub generate_token: fn() -> String,
}

pub fn random_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl Default for FeatureOptions {
    fn default() -> Self {
        Self { install: InstallInfo::default(), generate_token: random_token }
    }
}

/// Tri-state requirement for one component plus the node containers it needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequiredComponent {
    pub required: Option<bool>,
    pub containers: BTreeSet<&'static str>,
}

impl RequiredComponent {
    pub fn yes() -> Self {
        Self { required: Some(true), containers: BTreeSet::new() }
    }

    pub fn with_containers(containers: &[&'static str]) -> Self {
        Self { required: Some(true), containers: containers.iter().copied().collect() }
    }

    /// Reconciled only when some feature asked for it and none vetoed it.
    pub fn is_enabled(&self) -> bool {
        self.required == Some(true)
    }

    /// Unset + x = x; an explicit `false` wins; otherwise `true`.
    pub fn merge(&mut self, other: &RequiredComponent) {
        self.required = match (self.required, other.required) {
            (None, x) | (x, None) => x,
            (Some(false), _) | (_, Some(false)) => Some(false),
            _ => Some(true),
        };
        self.containers.extend(other.containers.iter().copied());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequiredComponents {
    pub node_agent: RequiredComponent,
    pub cluster_agent: RequiredComponent,
    pub checks_runner: RequiredComponent,
}

impl RequiredComponents {
    pub fn get(&self, c: ComponentName) -> &RequiredComponent {
        match c {
            ComponentName::NodeAgent => &self.node_agent,
            ComponentName::ClusterAgent => &self.cluster_agent,
            ComponentName::ClusterChecksRunner => &self.checks_runner,
        }
    }

    fn get_mut(&mut self, c: ComponentName) -> &mut RequiredComponent {
        match c {
            ComponentName::NodeAgent => &mut self.node_agent,
            ComponentName::ClusterAgent => &mut self.cluster_agent,
            ComponentName::ClusterChecksRunner => &mut self.checks_runner,
        }
    }

    pub fn merge(&mut self, other: &RequiredComponents) {
        for c in ComponentName::ALL {
            self.get_mut(c).merge(other.get(c));
        }
    }

    pub fn is_enabled(&self, c: ComponentName) -> bool {
        self.get(c).is_enabled()
    }

    pub fn enabled(&self) -> Vec<ComponentName> {
        ComponentName::ALL.into_iter().filter(|c| self.is_enabled(*c)).collect()
    }
}

/// What every feature variant implements.
trait Capability {
    fn id(&self) -> FeatureId;
    fn requirements(&self) -> RequiredComponents;
    fn manage_dependencies(&self, managers: &mut ResourceManagers, required: &RequiredComponents) -> Result<()>;
    fn configure(&self, component: ComponentName, template: &mut Scope<'_>, provider: &str);
}

/// One active capability. Rebuilt from the spec every pass.
#[derive(Debug, Clone)]
pub enum Feature {
    Defaults(defaults::Defaults),
    AdmissionController(admission::AdmissionController),
    Asm(asm::Asm),
    Instrumentation(instrumentation::Instrumentation),
    Apm(apm::Apm),
    LogCollection(logs::LogCollection),
    Npm(npm::Npm),
    OrchestratorExplorer(orchestrator::OrchestratorExplorer),
    KubeStateMetricsCore(ksm::KubeStateMetricsCore),
    ClusterChecks(cluster_checks::ClusterChecks),
}

impl Feature {
    fn inner(&self) -> &dyn Capability {
        match self {
            Feature::Defaults(f) => f,
            Feature::AdmissionController(f) => f,
            Feature::Asm(f) => f,
            Feature::Instrumentation(f) => f,
            Feature::Apm(f) => f,
            Feature::LogCollection(f) => f,
            Feature::Npm(f) => f,
            Feature::OrchestratorExplorer(f) => f,
            Feature::KubeStateMetricsCore(f) => f,
            Feature::ClusterChecks(f) => f,
        }
    }

    pub fn id(&self) -> FeatureId {
        self.inner().id()
    }

    pub fn requirements(&self) -> RequiredComponents {
        self.inner().requirements()
    }

    pub fn manage_dependencies(&self, managers: &mut ResourceManagers, required: &RequiredComponents) -> Result<()> {
        self.inner().manage_dependencies(managers, required)
    }

    /// Mutate `template` (a pod template of `component`) through this feature's scope.
    pub fn configure(&self, component: ComponentName, template: &mut PodTemplateManager, provider: &str) {
        let mut scope = template.feature(self.id());
        self.inner().configure(component, &mut scope, provider);
    }
}

type Constructor = fn(&AgentDeployment, &FeatureOptions) -> Option<Feature>;

const CANDIDATES: [(FeatureId, Constructor); 10] = [
    (FeatureId::Defaults, defaults::build),
    (FeatureId::AdmissionController, admission::build),
    (FeatureId::Asm, asm::build),
    (FeatureId::Instrumentation, instrumentation::build),
    (FeatureId::Apm, apm::build),
    (FeatureId::LogCollection, logs::build),
    (FeatureId::Npm, npm::build),
    (FeatureId::OrchestratorExplorer, orchestrator::build),
    (FeatureId::KubeStateMetricsCore, ksm::build),
    (FeatureId::ClusterChecks, cluster_checks::build),
];

/// Active features in priority order plus the folded component requirements.
///
/// `instance` is expected to be defaulted already.
pub fn build_features(instance: &AgentDeployment, options: &FeatureOptions) -> (Vec<Feature>, RequiredComponents) {
    let mut features = Vec::new();
    let mut required = RequiredComponents::default();
    for (id, ctor) in CANDIDATES.iter() {
        if let Some(f) = ctor(instance, options) {
            debug_assert_eq!(f.id(), *id);
            required.merge(&f.requirements());
            features.push(f);
        }
    }
    for c in ComponentName::ALL {
        if instance.is_disabled(c) {
            required.get_mut(c).merge(&RequiredComponent { required: Some(false), containers: BTreeSet::new() });
        }
    }
    debug!(
        features = ?features.iter().map(|f| f.id().as_str()).collect::<Vec<_>>(),
        enabled = ?required.enabled(),
        "features built"
    );
    (features, required)
}

/// Run every feature's dependency step; all failures are returned, none short-circuits.
pub fn manage_all_dependencies(
    features: &[Feature],
    managers: &mut ResourceManagers,
    required: &RequiredComponents,
) -> Vec<Error> {
    let mut errs = Vec::new();
    for f in features {
        if let Err(e) = f.manage_dependencies(managers, required) {
            warn!(feature = %f.id(), error = %e, "feature dependencies failed");
            errs.push(e);
        }
    }
    errs
}

/// Let every feature configure one pod template.
pub fn configure_all(features: &[Feature], component: ComponentName, template: &mut PodTemplateManager, provider: &str) {
    for f in features {
        f.configure(component, template, provider);
    }
}

pub(crate) fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector { name: Some(secret.to_string()), key: key.to_string(), optional: None }),
            ..Default::default()
        }),
    }
}

pub(crate) fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector { api_version: None, field_path: path.to_string() }),
            ..Default::default()
        }),
    }
}

/// Collapse several independent failures of one feature.
pub(crate) fn collect(errs: Vec<Error>) -> Result<()> {
    Error::aggregate(errs)
}

/// Env var names shared by features and workload builders.
pub mod env {
    pub const API_KEY: &str = "AGENT_API_KEY";
    pub const APP_KEY: &str = "AGENT_APP_KEY";
    pub const SITE: &str = "AGENT_SITE";
    pub const CLUSTER_NAME: &str = "AGENT_CLUSTER_NAME";
    pub const KUBELET_HOST: &str = "AGENT_KUBERNETES_KUBELET_HOST";
    pub const CLUSTER_AGENT_ENABLED: &str = "AGENT_CLUSTER_AGENT_ENABLED";
    pub const CLUSTER_AGENT_AUTH_TOKEN: &str = "AGENT_CLUSTER_AGENT_AUTH_TOKEN";
    pub const CLUSTER_AGENT_SERVICE: &str = "AGENT_CLUSTER_AGENT_KUBERNETES_SERVICE_NAME";
    pub const LEADER_ELECTION: &str = "AGENT_LEADER_ELECTION";
    pub const LEADER_LEASE_NAME: &str = "AGENT_LEADER_LEASE_NAME";

    pub const ADMISSION_ENABLED: &str = "AGENT_ADMISSION_CONTROLLER_ENABLED";
    pub const ADMISSION_MUTATE_UNLABELLED: &str = "AGENT_ADMISSION_CONTROLLER_MUTATE_UNLABELLED";
    pub const ADMISSION_SERVICE_NAME: &str = "AGENT_ADMISSION_CONTROLLER_SERVICE_NAME";
    pub const ADMISSION_WEBHOOK_NAME: &str = "AGENT_ADMISSION_CONTROLLER_WEBHOOK_NAME";

    pub const APPSEC_ENABLED: &str = "AGENT_ADMISSION_CONTROLLER_APPSEC_ENABLED";
    pub const APPSEC_SCA_ENABLED: &str = "AGENT_ADMISSION_CONTROLLER_APPSEC_SCA_ENABLED";
    pub const IAST_ENABLED: &str = "AGENT_ADMISSION_CONTROLLER_IAST_ENABLED";

    pub const INSTALL_ID: &str = "AGENT_INSTRUMENTATION_INSTALL_ID";
    pub const INSTALL_TIME: &str = "AGENT_INSTRUMENTATION_INSTALL_TIME";
    pub const INSTALL_TYPE: &str = "AGENT_INSTRUMENTATION_INSTALL_TYPE";
    pub const INSTRUMENTATION_ENABLED: &str = "AGENT_APM_INSTRUMENTATION_ENABLED";
    pub const INSTRUMENTATION_ENABLED_NAMESPACES: &str = "AGENT_APM_INSTRUMENTATION_ENABLED_NAMESPACES";
    pub const INSTRUMENTATION_DISABLED_NAMESPACES: &str = "AGENT_APM_INSTRUMENTATION_DISABLED_NAMESPACES";
    pub const INSTRUMENTATION_WEBHOOK: &str = "AGENT_APM_INSTRUMENTATION_WEBHOOK_NAME";

    pub const APM_ENABLED: &str = "AGENT_APM_ENABLED";
    pub const APM_RECEIVER_PORT: &str = "AGENT_APM_RECEIVER_PORT";
    pub const APM_NON_LOCAL_TRAFFIC: &str = "AGENT_APM_NON_LOCAL_TRAFFIC";

    pub const LOGS_ENABLED: &str = "AGENT_LOGS_ENABLED";
    pub const LOGS_CONTAINER_COLLECT_ALL: &str = "AGENT_LOGS_CONFIG_CONTAINER_COLLECT_ALL";

    pub const NETWORK_ENABLED: &str = "AGENT_NETWORK_CONFIG_ENABLED";
    pub const CONNTRACK_ENABLED: &str = "AGENT_SYSTEM_PROBE_CONNTRACK_ENABLED";
    pub const SYSPROBE_SOCKET: &str = "AGENT_SYSPROBE_SOCKET";

    pub const ORCHESTRATOR_ENABLED: &str = "AGENT_ORCHESTRATOR_EXPLORER_ENABLED";
    pub const ORCHESTRATOR_SCRUBBING: &str = "AGENT_ORCHESTRATOR_EXPLORER_CONTAINER_SCRUBBING_ENABLED";

    pub const KSM_CORE_ENABLED: &str = "AGENT_KUBE_STATE_METRICS_CORE_ENABLED";
    pub const KSM_CORE_CONFIGMAP: &str = "AGENT_KUBE_STATE_METRICS_CORE_CONFIGMAP_NAME";

    pub const CLUSTER_CHECKS_ENABLED: &str = "AGENT_CLUSTER_CHECKS_ENABLED";
    pub const EXTRA_CONFIG_PROVIDERS: &str = "AGENT_EXTRA_CONFIG_PROVIDERS";
    pub const METADATA_COLLECTION: &str = "AGENT_ENABLE_METADATA_COLLECTION";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_table_covers_every_id_in_order() {
        let ids: Vec<FeatureId> = CANDIDATES.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, FeatureId::ALL.to_vec());
    }

    #[test]
    fn required_component_fold() {
        let none = RequiredComponent::default();
        let yes = RequiredComponent::yes();
        let no = RequiredComponent { required: Some(false), containers: BTreeSet::new() };

        let mut a = none.clone();
        a.merge(&yes);
        assert_eq!(a.required, Some(true));

        let mut b = yes.clone();
        b.merge(&none);
        assert_eq!(b.required, Some(true));

        let mut c = yes.clone();
        c.merge(&no);
        c.merge(&yes);
        assert_eq!(c.required, Some(false));

        let mut d = none.clone();
        d.merge(&none);
        assert!(!d.is_enabled());
    }

    #[test]
    fn containers_union_on_merge() {
        let mut a = RequiredComponent::with_containers(&["agent"]);
        a.merge(&RequiredComponent::with_containers(&["trace-agent", "agent"]));
        assert_eq!(a.containers.into_iter().collect::<Vec<_>>(), vec!["agent", "trace-agent"]);
    }
}
