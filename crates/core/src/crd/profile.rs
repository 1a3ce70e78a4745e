use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::NodeSelectorRequirement;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{ComponentName, ContainerOverride};
use crate::condition::Condition;

/// AgentProfile overrides node-agent settings on the nodes its selector matches.
///
/// Older profiles win contested nodes; equal creation times fall back to name order.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "agentop.dev",
    version = "v1alpha1",
    kind = "AgentProfile",
    plural = "agentprofiles",
    shortname = "agp",
    namespaced,
    status = "AgentProfileStatus",
    printcolumn = r#"{"name":"Valid", "type":"string", "jsonPath":".status.valid"}"#,
    printcolumn = r#"{"name":"Applied", "type":"string", "jsonPath":".status.applied"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfileSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_affinity: Option<ProfileAffinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ProfileConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProfileAffinity {
    /// Requirements are ANDed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profile_node_affinity: Vec<NodeSelectorRequirement>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProfileConfig {
    #[serde(default, rename = "override", skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<ComponentName, ProfileOverride>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProfileOverride {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub containers: BTreeMap<String, ContainerOverride>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfileStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied: Option<String>,
    /// Nodes this profile governed during the last pass.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub covered_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl AgentProfile {
    pub fn node_requirements(&self) -> &[NodeSelectorRequirement] {
        self.spec
            .profile_affinity
            .as_ref()
            .map(|a| a.profile_node_affinity.as_slice())
            .unwrap_or(&[])
    }

    pub fn node_agent_override(&self) -> Option<&ProfileOverride> {
        self.spec.config.as_ref().and_then(|c| c.overrides.get(&ComponentName::NodeAgent))
    }
}
