//! Application security toggles, delivered through the admission controller.

use agentop_apply::ResourceManagers;
use agentop_core::crd::{enabled, Toggle};
use agentop_core::names::containers;
use agentop_core::{AgentDeployment, ComponentName, Result};

use crate::{admission, env, Capability, Feature, FeatureId, FeatureOptions, RequiredComponent, RequiredComponents, Scope};

#[derive(Debug, Clone)]
pub struct Asm {
    threats: bool,
    sca: bool,
    iast: bool,
}

fn on(t: &Option<Toggle>) -> bool {
    enabled(t.as_ref().and_then(|t| t.enabled))
}

pub(crate) fn build(instance: &AgentDeployment, _: &FeatureOptions) -> Option<Feature> {
    let cfg = instance.features().asm?;
    let f = Asm { threats: on(&cfg.threats), sca: on(&cfg.sca), iast: on(&cfg.iast) };
    if !(f.threats || f.sca || f.iast) || !admission::is_enabled(instance) {
        return None;
    }
    Some(Feature::Asm(f))
}

impl Capability for Asm {
    fn id(&self) -> FeatureId {
        FeatureId::Asm
    }

    fn requirements(&self) -> RequiredComponents {
        RequiredComponents { cluster_agent: RequiredComponent::yes(), ..Default::default() }
    }

    fn manage_dependencies(&self, _: &mut ResourceManagers, _: &RequiredComponents) -> Result<()> {
        Ok(())
    }

    fn configure(&self, component: ComponentName, template: &mut Scope<'_>, _: &str) {
        if component != ComponentName::ClusterAgent {
            return;
        }
        let c = containers::CLUSTER_AGENT;
        if self.threats {
            template.add_env(c, env::APPSEC_ENABLED, "true");
        }
        if self.sca {
            template.add_env(c, env::APPSEC_SCA_ENABLED, "true");
        }
        if self.iast {
            template.add_env(c, env::IAST_ENABLED, "true");
        }
    }
}
