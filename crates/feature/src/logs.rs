use agentop_apply::ResourceManagers;
use agentop_core::crd::enabled;
use agentop_core::names::{containers, providers};
use agentop_core::{AgentDeployment, ComponentName, Result};
use k8s_openapi::api::core::v1::{HostPathVolumeSource, Volume, VolumeMount};

use crate::{env, Capability, Feature, FeatureId, FeatureOptions, RequiredComponent, RequiredComponents, Scope};

pub const POINTER_DIR: &str = "/opt/agentop/run";

#[derive(Debug, Clone)]
pub struct LogCollection {
    container_collect_all: bool,
}

pub(crate) fn build(instance: &AgentDeployment, _: &FeatureOptions) -> Option<Feature> {
    let logs = instance.features().log_collection?;
    if !enabled(logs.enabled) {
        return None;
    }
    Some(Feature::LogCollection(LogCollection { container_collect_all: enabled(logs.container_collect_all) }))
}

fn host_path(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource { path: path.to_string(), type_: None }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount { name: name.to_string(), mount_path: path.to_string(), read_only: Some(read_only), ..Default::default() }
}

impl Capability for LogCollection {
    fn id(&self) -> FeatureId {
        FeatureId::LogCollection
    }

    fn requirements(&self) -> RequiredComponents {
        RequiredComponents {
            node_agent: RequiredComponent::with_containers(&[containers::AGENT]),
            ..Default::default()
        }
    }

    fn manage_dependencies(&self, _: &mut ResourceManagers, _: &RequiredComponents) -> Result<()> {
        Ok(())
    }

    fn configure(&self, component: ComponentName, template: &mut Scope<'_>, provider: &str) {
        if component != ComponentName::NodeAgent {
            return;
        }
        let c = containers::AGENT;
        template.add_env(c, env::LOGS_ENABLED, "true");
        template.add_env(c, env::LOGS_CONTAINER_COLLECT_ALL, self.container_collect_all.to_string());

        let mut paths = vec![
            ("pointerdir", POINTER_DIR, false),
            ("logpodpath", "/var/log/pods", true),
            ("logcontainerpath", "/var/log/containers", true),
        ];
        // COS nodes keep container logs only under /var/log.
        if provider != providers::GKE_COS {
            paths.push(("logdockercontainerpath", "/var/lib/docker/containers", true));
        }
        for (name, path, ro) in paths {
            template.add_volume(host_path(name, path));
            template.add_volume_mount(c, mount(name, path, ro));
        }
    }
}
