//! Custom resources owned by the operator.
//!
//! - [`AgentDeployment`]: user intent for the node agent, cluster agent and checks runner
//! - [`AgentProfile`]: node-scoped override policy for the node agent

mod agent;
mod common;
mod profile;

pub use agent::{
    AdmissionControllerFeatureConfig, AgentDeployment, AgentDeploymentSpec, AgentDeploymentStatus,
    ApmFeatureConfig, AsmFeatureConfig, ClusterChecksFeatureConfig, Credentials,
    DependencyOverride, FeaturesConfig, GlobalConfig, InstrumentationConfig,
    LogCollectionFeatureConfig, NetworkPolicyConfig, NpmFeatureConfig,
    OrchestratorExplorerFeatureConfig, Toggle, WorkloadStatus,
};
pub use common::{ComponentName, ComponentOverride, ContainerOverride, ImageConfig, SecretRef};
pub use profile::{AgentProfile, AgentProfileSpec, AgentProfileStatus, ProfileAffinity, ProfileConfig, ProfileOverride};

/// `Some(true)` only; an absent toggle is off.
pub fn enabled(flag: Option<bool>) -> bool {
    flag.unwrap_or(false)
}
