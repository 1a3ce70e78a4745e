//! APM library auto-injection. Needs APM on and a running admission controller.

use agentop_apply::ResourceManagers;
use agentop_core::crd::enabled;
use agentop_core::names::containers;
use agentop_core::{AgentDeployment, ComponentName, Result};

use crate::{admission, env, Capability, Feature, FeatureId, FeatureOptions, InstallInfo};
use crate::{RequiredComponent, RequiredComponents, Scope};

#[derive(Debug, Clone)]
pub struct Instrumentation {
    install: InstallInfo,
    enabled_namespaces: Vec<String>,
    disabled_namespaces: Vec<String>,
    webhook: String,
}

pub(crate) fn build(instance: &AgentDeployment, options: &FeatureOptions) -> Option<Feature> {
    let apm = instance.features().apm?;
    let instr = apm.instrumentation.clone()?;
    if !enabled(apm.enabled) || !enabled(instr.enabled) || !admission::is_enabled(instance) {
        return None;
    }
    Some(Feature::Instrumentation(Instrumentation {
        install: options.install.clone(),
        enabled_namespaces: instr.enabled_namespaces,
        disabled_namespaces: instr.disabled_namespaces,
        webhook: admission::webhook_name(instance),
    }))
}

impl Capability for Instrumentation {
    fn id(&self) -> FeatureId {
        FeatureId::Instrumentation
    }

    fn requirements(&self) -> RequiredComponents {
        RequiredComponents {
            node_agent: RequiredComponent::with_containers(&[containers::TRACE_AGENT]),
            cluster_agent: RequiredComponent::yes(),
            ..Default::default()
        }
    }

    fn manage_dependencies(&self, _: &mut ResourceManagers, _: &RequiredComponents) -> Result<()> {
        Ok(())
    }

    fn configure(&self, component: ComponentName, template: &mut Scope<'_>, _: &str) {
        match component {
            ComponentName::NodeAgent => {
                for c in [containers::AGENT, containers::TRACE_AGENT] {
                    template.add_env(c, env::INSTALL_ID, self.install.id.clone());
                    template.add_env(c, env::INSTALL_TIME, self.install.time.to_string());
                    template.add_env(c, env::INSTALL_TYPE, self.install.type_.clone());
                }
            }
            ComponentName::ClusterAgent => {
                let c = containers::CLUSTER_AGENT;
                template.add_env(c, env::INSTRUMENTATION_ENABLED, "true");
                if !self.enabled_namespaces.is_empty() {
                    template.add_env(c, env::INSTRUMENTATION_ENABLED_NAMESPACES, self.enabled_namespaces.join(","));
                }
                if !self.disabled_namespaces.is_empty() {
                    template.add_env(c, env::INSTRUMENTATION_DISABLED_NAMESPACES, self.disabled_namespaces.join(","));
                }
                template.add_env(c, env::INSTRUMENTATION_WEBHOOK, self.webhook.clone());
            }
            ComponentName::ClusterChecksRunner => {}
        }
    }
}
