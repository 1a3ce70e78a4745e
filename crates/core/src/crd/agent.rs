use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{ComponentName, ComponentOverride, SecretRef};
use crate::condition::Condition;

/// AgentDeployment declares which agent capabilities should run in the cluster.
///
/// The operator derives a node-agent DaemonSet (one per profile and provider),
/// a cluster-agent Deployment, an optional checks-runner Deployment and their
/// supporting objects from it.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "agentop.dev",
    version = "v1alpha1",
    kind = "AgentDeployment",
    plural = "agentdeployments",
    shortname = "agd",
    namespaced,
    status = "AgentDeploymentStatus",
    printcolumn = r#"{"name":"Agent", "type":"string", "jsonPath":".status.agent.status"}"#,
    printcolumn = r#"{"name":"Cluster-Agent", "type":"string", "jsonPath":".status.clusterAgent.status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AgentDeploymentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<GlobalConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<FeaturesConfig>,

    /// Per-component overrides.
    #[serde(default, rename = "override", skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<ComponentName, ComponentOverride>,

    /// Field-level patches applied to generated dependencies before they are written.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependency_overrides: Vec<DependencyOverride>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    /// Image registry prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    /// Literal cluster-agent token; takes precedence over a generated one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_agent_token: Option<String>,
    /// Existing secret holding the cluster-agent token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_agent_token_secret: Option<SecretRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_policy: Option<NetworkPolicyConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<SecretRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_secret: Option<SecretRef>,
}

impl Credentials {
    /// True when an API key is reachable either literally or through a secret.
    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().map(|k| !k.is_empty()).unwrap_or(false) || self.api_secret.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Toggle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeaturesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission_controller: Option<AdmissionControllerFeatureConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asm: Option<AsmFeatureConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apm: Option<ApmFeatureConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_collection: Option<LogCollectionFeatureConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub npm: Option<NpmFeatureConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator_explorer: Option<OrchestratorExplorerFeatureConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_state_metrics_core: Option<Toggle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_checks: Option<ClusterChecksFeatureConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionControllerFeatureConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Mutate pods without the opt-in label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutate_unlabelled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AsmFeatureConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threats: Option<Toggle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sca: Option<Toggle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iast: Option<Toggle>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApmFeatureConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrumentation: Option<InstrumentationConfig>,
}

/// Automatic library injection through the admission controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled_namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled_namespaces: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogCollectionFeatureConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_collect_all: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NpmFeatureConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_conntrack: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorExplorerFeatureConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrubbing: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterChecksFeatureConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_cluster_checks_runners: Option<bool>,
}

/// JSON merge patch targeting one generated dependency.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DependencyOverride {
    /// Object kind, e.g. `ConfigMap` or `ClusterRole`.
    pub kind: String,
    pub name: String,
    /// Defaults to the AgentDeployment namespace for namespaced kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub patch: serde_json::Value,
}

fn preserve_unknown_fields(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    use schemars::schema::{InstanceType, Schema, SchemaObject};
    let mut obj = SchemaObject { instance_type: Some(InstanceType::Object.into()), ..Default::default() };
    obj.extensions.insert("x-kubernetes-preserve-unknown-fields".into(), serde_json::Value::Bool(true));
    Schema::Object(obj)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentDeploymentStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<WorkloadStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_agent: Option<WorkloadStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_checks_runner: Option<WorkloadStatus>,
}

impl AgentDeploymentStatus {
    pub fn generated_token(&self) -> Option<&str> {
        self.cluster_agent
            .as_ref()
            .and_then(|s| s.generated_token.as_deref())
            .filter(|t| !t.is_empty())
    }
}

/// Observed replica counts for one workload kind (summed across instances for the node agent).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    pub desired: i32,
    pub current: i32,
    pub ready: i32,
    pub available: i32,
    pub up_to_date: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Human summary, e.g. `Running (3/3/3)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Workload object names this status covers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_token: Option<String>,
}

impl AgentDeployment {
    pub fn global(&self) -> GlobalConfig {
        self.spec.global.clone().unwrap_or_default()
    }

    pub fn features(&self) -> FeaturesConfig {
        self.spec.features.clone().unwrap_or_default()
    }

    pub fn component_override(&self, component: ComponentName) -> Option<&ComponentOverride> {
        self.spec.overrides.get(&component)
    }

    /// `override.<component>.disabled` is set.
    pub fn is_disabled(&self, component: ComponentName) -> bool {
        self.component_override(component).and_then(|o| o.disabled).unwrap_or(false)
    }

    /// Account a component runs as: the override when set, else the generated one.
    pub fn service_account_name(&self, component: ComponentName) -> String {
        self.component_override(component)
            .and_then(|o| o.service_account_name.clone())
            .unwrap_or_else(|| crate::names::component(&self.name_any(), component))
    }

    pub fn status_or_default(&self) -> AgentDeploymentStatus {
        self.status.clone().unwrap_or_default()
    }
}
