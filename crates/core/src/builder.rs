//! Fluent builders for AgentDeployment / AgentProfile / Node fixtures.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{EnvVar, Node, NodeSelectorRequirement};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

use crate::crd::{
    AdmissionControllerFeatureConfig, AgentDeployment, AgentDeploymentSpec, AgentProfile,
    AgentProfileSpec, ApmFeatureConfig, AsmFeatureConfig, ClusterChecksFeatureConfig,
    ComponentName, ComponentOverride, ContainerOverride, Credentials, DependencyOverride,
    FeaturesConfig, GlobalConfig, InstrumentationConfig, LogCollectionFeatureConfig,
    NetworkPolicyConfig, NpmFeatureConfig, OrchestratorExplorerFeatureConfig, ProfileAffinity,
    ProfileConfig, ProfileOverride, Toggle,
};

pub struct AgentDeploymentBuilder {
    inner: AgentDeployment,
}

impl AgentDeploymentBuilder {
    pub fn new(namespace: &str, name: &str) -> Self {
        let mut inner = AgentDeployment::new(name, AgentDeploymentSpec::default());
        inner.metadata.namespace = Some(namespace.to_string());
        Self { inner }
    }

    fn global(&mut self) -> &mut GlobalConfig {
        self.inner.spec.global.get_or_insert_with(Default::default)
    }

    fn features(&mut self) -> &mut FeaturesConfig {
        self.inner.spec.features.get_or_insert_with(Default::default)
    }

    pub fn with_uid(mut self, uid: &str) -> Self {
        self.inner.metadata.uid = Some(uid.to_string());
        self
    }

    pub fn with_credentials(mut self, api_key: &str, app_key: &str) -> Self {
        self.global().credentials = Some(Credentials {
            api_key: Some(api_key.to_string()),
            app_key: Some(app_key.to_string()),
            ..Default::default()
        });
        self
    }

    pub fn with_cluster_name(mut self, name: &str) -> Self {
        self.global().cluster_name = Some(name.to_string());
        self
    }

    pub fn with_cluster_agent_token(mut self, token: &str) -> Self {
        self.global().cluster_agent_token = Some(token.to_string());
        self
    }

    pub fn with_network_policy(mut self, create: bool) -> Self {
        self.global().network_policy = Some(NetworkPolicyConfig { create: Some(create) });
        self
    }

    pub fn with_admission_controller(mut self, enabled: bool) -> Self {
        self.features().admission_controller =
            Some(AdmissionControllerFeatureConfig { enabled: Some(enabled), ..Default::default() });
        self
    }

    pub fn with_asm(mut self, threats: bool, sca: bool, iast: bool) -> Self {
        let t = |b: bool| Some(Toggle { enabled: Some(b) });
        self.features().asm = Some(AsmFeatureConfig { threats: t(threats), sca: t(sca), iast: t(iast) });
        self
    }

    pub fn with_apm(mut self, enabled: bool) -> Self {
        let apm = self.features().apm.get_or_insert_with(ApmFeatureConfig::default);
        apm.enabled = Some(enabled);
        self
    }

    /// Toggles single-step instrumentation; enabling it also enables APM.
    pub fn with_instrumentation(mut self, enabled: bool) -> Self {
        let apm = self.features().apm.get_or_insert_with(ApmFeatureConfig::default);
        if enabled {
            apm.enabled = Some(true);
        }
        apm.instrumentation = Some(InstrumentationConfig { enabled: Some(enabled), ..Default::default() });
        self
    }

    pub fn with_log_collection(mut self, enabled: bool) -> Self {
        self.features().log_collection =
            Some(LogCollectionFeatureConfig { enabled: Some(enabled), container_collect_all: Some(true) });
        self
    }

    pub fn with_npm(mut self, enabled: bool) -> Self {
        self.features().npm = Some(NpmFeatureConfig { enabled: Some(enabled), enable_conntrack: None });
        self
    }

    pub fn with_orchestrator_explorer(mut self, enabled: bool) -> Self {
        self.features().orchestrator_explorer =
            Some(OrchestratorExplorerFeatureConfig { enabled: Some(enabled), scrubbing: None });
        self
    }

    pub fn with_kube_state_metrics_core(mut self, enabled: bool) -> Self {
        self.features().kube_state_metrics_core = Some(Toggle { enabled: Some(enabled) });
        self
    }

    pub fn with_cluster_checks(mut self, enabled: bool, use_runners: bool) -> Self {
        self.features().cluster_checks = Some(ClusterChecksFeatureConfig {
            enabled: Some(enabled),
            use_cluster_checks_runners: Some(use_runners),
        });
        self
    }

    pub fn with_override(mut self, component: ComponentName, ov: ComponentOverride) -> Self {
        self.inner.spec.overrides.insert(component, ov);
        self
    }

    pub fn with_dependency_override(mut self, ov: DependencyOverride) -> Self {
        self.inner.spec.dependency_overrides.push(ov);
        self
    }

    pub fn build(self) -> AgentDeployment {
        self.inner
    }
}

impl From<AgentDeployment> for AgentDeploymentBuilder {
    fn from(inner: AgentDeployment) -> Self {
        Self { inner }
    }
}

pub struct AgentProfileBuilder {
    inner: AgentProfile,
}

impl AgentProfileBuilder {
    pub fn new(namespace: &str, name: &str) -> Self {
        let mut inner = AgentProfile::new(name, AgentProfileSpec::default());
        inner.metadata.namespace = Some(namespace.to_string());
        Self { inner }
    }

    pub fn created_at(mut self, ts: DateTime<Utc>) -> Self {
        self.inner.metadata.creation_timestamp = Some(Time(ts));
        self
    }

    /// Adds one ANDed selector requirement (`In`, `NotIn`, `Exists`, ...).
    pub fn selector(mut self, key: &str, operator: &str, values: &[&str]) -> Self {
        let aff = self.inner.spec.profile_affinity.get_or_insert_with(ProfileAffinity::default);
        aff.profile_node_affinity.push(NodeSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: if values.is_empty() { None } else { Some(values.iter().map(|v| v.to_string()).collect()) },
        });
        self
    }

    fn node_agent(&mut self) -> &mut ProfileOverride {
        let cfg = self.inner.spec.config.get_or_insert_with(ProfileConfig::default);
        cfg.overrides.entry(ComponentName::NodeAgent).or_default()
    }

    pub fn container_env(mut self, container: &str, name: &str, value: &str) -> Self {
        let c: &mut ContainerOverride = self.node_agent().containers.entry(container.to_string()).or_default();
        c.env.push(EnvVar { name: name.to_string(), value: Some(value.to_string()), ..Default::default() });
        self
    }

    pub fn priority_class(mut self, name: &str) -> Self {
        self.node_agent().priority_class_name = Some(name.to_string());
        self
    }

    /// Adds an override for a component other than the node agent (invalid on purpose).
    pub fn component_override(mut self, component: ComponentName) -> Self {
        let cfg = self.inner.spec.config.get_or_insert_with(ProfileConfig::default);
        cfg.overrides.entry(component).or_default();
        self
    }

    pub fn build(self) -> AgentProfile {
        self.inner
    }
}

pub fn node(name: &str, labels: &[(&str, &str)]) -> Node {
    let labels: BTreeMap<String, String> = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: if labels.is_empty() { None } else { Some(labels) },
            ..Default::default()
        },
        ..Default::default()
    }
}
