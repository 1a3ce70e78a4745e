//! agentop core types: CRDs, status conditions, spec defaulting and the shared error type.

#![forbid(unsafe_code)]

pub mod builder;
pub mod condition;
pub mod crd;
pub mod defaults;
pub mod error;
pub mod names;

pub use condition::{Condition, ConditionStatus};
pub use crd::{
    AgentDeployment, AgentDeploymentSpec, AgentDeploymentStatus, AgentProfile, AgentProfileSpec,
    AgentProfileStatus, ComponentName, WorkloadStatus,
};
pub use error::{Error, Result};

pub mod prelude {
    pub use super::{
        AgentDeployment, AgentDeploymentSpec, AgentDeploymentStatus, AgentProfile, ComponentName,
        Condition, ConditionStatus, Error, Result,
    };
}

/// Namespace of a namespaced custom resource, failing validation when unset.
pub fn namespace_of<K: kube::ResourceExt>(obj: &K) -> Result<String> {
    obj.namespace()
        .ok_or_else(|| Error::Validation(format!("{} has no namespace", obj.name_any())))
}
