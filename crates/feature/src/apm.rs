use agentop_apply::ResourceManagers;
use agentop_core::crd::enabled;
use agentop_core::defaults::DEFAULT_APM_PORT;
use agentop_core::names::containers;
use agentop_core::{AgentDeployment, ComponentName, Result};
use k8s_openapi::api::core::v1::ContainerPort;

use crate::{env, Capability, Feature, FeatureId, FeatureOptions, RequiredComponent, RequiredComponents, Scope};

#[derive(Debug, Clone)]
pub struct Apm {
    host_port: i32,
}

pub(crate) fn build(instance: &AgentDeployment, _: &FeatureOptions) -> Option<Feature> {
    let apm = instance.features().apm?;
    if !enabled(apm.enabled) {
        return None;
    }
    Some(Feature::Apm(Apm { host_port: apm.host_port.unwrap_or(DEFAULT_APM_PORT) }))
}

impl Capability for Apm {
    fn id(&self) -> FeatureId {
        FeatureId::Apm
    }

    fn requirements(&self) -> RequiredComponents {
        RequiredComponents {
            node_agent: RequiredComponent::with_containers(&[containers::AGENT, containers::TRACE_AGENT]),
            ..Default::default()
        }
    }

    fn manage_dependencies(&self, _: &mut ResourceManagers, _: &RequiredComponents) -> Result<()> {
        Ok(())
    }

    fn configure(&self, component: ComponentName, template: &mut Scope<'_>, _: &str) {
        if component != ComponentName::NodeAgent {
            return;
        }
        let c = containers::TRACE_AGENT;
        template.add_env(c, env::APM_ENABLED, "true");
        template.add_env(c, env::APM_RECEIVER_PORT, self.host_port.to_string());
        template.add_env(c, env::APM_NON_LOCAL_TRAFFIC, "true");
        template.add_port(
            c,
            ContainerPort {
                name: Some("traceport".into()),
                container_port: self.host_port,
                host_port: Some(self.host_port),
                protocol: Some("TCP".into()),
                ..Default::default()
            },
        );
    }
}
