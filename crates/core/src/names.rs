//! Object names, label keys and container names shared across crates.

use std::collections::BTreeMap;

use crate::crd::ComponentName;

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_PROFILE: &str = "agentop.dev/profile";
pub const LABEL_PROVIDER: &str = "agentop.dev/provider";

pub const MANAGED_BY: &str = "agentop";
pub const FIELD_MANAGER: &str = "agentop";
pub const FINALIZER: &str = "agentop.dev/finalizer";

pub const TOKEN_KEY: &str = "token";
pub const API_KEY_KEY: &str = "api_key";
pub const APP_KEY_KEY: &str = "app_key";
pub const CLUSTER_AGENT_PORT: i32 = 5005;

pub mod containers {
    pub const AGENT: &str = "agent";
    pub const TRACE_AGENT: &str = "trace-agent";
    pub const PROCESS_AGENT: &str = "process-agent";
    pub const SYSTEM_PROBE: &str = "system-probe";
    pub const CLUSTER_AGENT: &str = "cluster-agent";
    pub const CHECKS_RUNNER: &str = "cluster-checks-runner";
}

/// Node providers a node-agent DaemonSet can be specialised for.
pub mod providers {
    /// Single provider used when introspection is off.
    pub const LEGACY: &str = "";
    pub const DEFAULT: &str = "default";
    pub const GKE_COS: &str = "gke-cos";
    pub const GKE_OS_LABEL: &str = "cloud.google.com/gke-os-distribution";
    pub const GKE_COS_VALUE: &str = "cos";
}

/// Value of the `part-of` label tying an object to its AgentDeployment.
pub fn part_of(namespace: &str, name: &str) -> String {
    format!("{}-{}", namespace, name)
}

/// `<owner>-<component suffix>`; used for workloads, service accounts and base RBAC.
pub fn component(owner: &str, component: ComponentName) -> String {
    format!("{}-{}", owner, component.suffix())
}

pub fn credentials_secret(owner: &str) -> String {
    format!("{}-secret", owner)
}

pub fn token_secret(owner: &str) -> String {
    format!("{}-token", owner)
}

pub fn cluster_agent_service(owner: &str) -> String {
    component(owner, ComponentName::ClusterAgent)
}

pub fn install_info_config_map(owner: &str) -> String {
    format!("{}-install-info", owner)
}

pub fn extra_confd_config_map(owner: &str, component: ComponentName) -> String {
    format!("{}-{}-extra-confd", owner, component.suffix())
}

/// Labels selecting the pods of one component.
pub fn selector_labels(owner: &str, component: ComponentName) -> BTreeMap<String, String> {
    let mut l = BTreeMap::new();
    l.insert(LABEL_INSTANCE.to_string(), self::component(owner, component));
    l.insert(LABEL_COMPONENT.to_string(), component.suffix().to_string());
    l
}
