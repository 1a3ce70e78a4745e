//! Cluster-level checks dispatched by the cluster agent, optionally to dedicated runners.

use agentop_apply::ResourceManagers;
use agentop_core::crd::enabled;
use agentop_core::names::containers;
use agentop_core::{AgentDeployment, ComponentName, Result};

use crate::{env, Capability, Feature, FeatureId, FeatureOptions, RequiredComponent, RequiredComponents, Scope};

#[derive(Debug, Clone)]
pub struct ClusterChecks {
    use_runners: bool,
}

pub(crate) fn build(instance: &AgentDeployment, _: &FeatureOptions) -> Option<Feature> {
    let cc = instance.features().cluster_checks?;
    if !enabled(cc.enabled) {
        return None;
    }
    Some(Feature::ClusterChecks(ClusterChecks { use_runners: enabled(cc.use_cluster_checks_runners) }))
}

impl Capability for ClusterChecks {
    fn id(&self) -> FeatureId {
        FeatureId::ClusterChecks
    }

    fn requirements(&self) -> RequiredComponents {
        RequiredComponents {
            cluster_agent: RequiredComponent::yes(),
            checks_runner: if self.use_runners { RequiredComponent::yes() } else { RequiredComponent::default() },
            ..Default::default()
        }
    }

    fn manage_dependencies(&self, _: &mut ResourceManagers, _: &RequiredComponents) -> Result<()> {
        Ok(())
    }

    fn configure(&self, component: ComponentName, template: &mut Scope<'_>, _: &str) {
        match component {
            ComponentName::ClusterAgent => {
                template.add_env(containers::CLUSTER_AGENT, env::CLUSTER_CHECKS_ENABLED, "true");
                template.add_env(containers::CLUSTER_AGENT, env::EXTRA_CONFIG_PROVIDERS, "kube_endpoints kube_services");
            }
            ComponentName::NodeAgent if !self.use_runners => {
                template.add_env(containers::AGENT, env::EXTRA_CONFIG_PROVIDERS, "clusterchecks endpointschecks");
            }
            ComponentName::NodeAgent => {
                template.add_env(containers::AGENT, env::EXTRA_CONFIG_PROVIDERS, "endpointschecks");
            }
            ComponentName::ClusterChecksRunner => {
                let c = containers::CHECKS_RUNNER;
                template.add_env(c, env::EXTRA_CONFIG_PROVIDERS, "clusterchecks");
                template.add_env(c, env::METADATA_COLLECTION, "false");
            }
        }
    }
}
