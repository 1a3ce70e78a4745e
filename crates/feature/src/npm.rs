//! Network performance monitoring: system-probe kernel access and its socket shared with the process agent.

use agentop_apply::ResourceManagers;
use agentop_core::crd::enabled;
use agentop_core::names::containers;
use agentop_core::{AgentDeployment, ComponentName, Result};
use k8s_openapi::api::core::v1::{EmptyDirVolumeSource, HostPathVolumeSource, Volume, VolumeMount};

use crate::{env, Capability, Feature, FeatureId, FeatureOptions, RequiredComponent, RequiredComponents, Scope};

pub const SYSPROBE_SOCKET_DIR: &str = "/var/run/sysprobe";
pub const APPARMOR_ANNOTATION: &str = "container.apparmor.security.beta.kubernetes.io/system-probe";

#[derive(Debug, Clone)]
pub struct Npm {
    conntrack: bool,
}

pub(crate) fn build(instance: &AgentDeployment, _: &FeatureOptions) -> Option<Feature> {
    let npm = instance.features().npm?;
    if !enabled(npm.enabled) {
        return None;
    }
    Some(Feature::Npm(Npm { conntrack: npm.enable_conntrack.unwrap_or(true) }))
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount { name: name.to_string(), mount_path: path.to_string(), ..Default::default() }
}

impl Capability for Npm {
    fn id(&self) -> FeatureId {
        FeatureId::Npm
    }

    fn requirements(&self) -> RequiredComponents {
        RequiredComponents {
            node_agent: RequiredComponent::with_containers(&[
                containers::AGENT,
                containers::PROCESS_AGENT,
                containers::SYSTEM_PROBE,
            ]),
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
        template.add_annotation(APPARMOR_ANNOTATION, "unconfined");

        template.add_volume(Volume {
            name: "debugfs".into(),
            host_path: Some(HostPathVolumeSource { path: "/sys/kernel/debug".into(), type_: None }),
            ..Default::default()
        });
        template.add_volume(Volume {
            name: "sysprobe-socket-dir".into(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
        template.add_volume_mount(containers::SYSTEM_PROBE, mount("debugfs", "/sys/kernel/debug"));
        for c in [containers::SYSTEM_PROBE, containers::PROCESS_AGENT, containers::AGENT] {
            template.add_volume_mount(c, mount("sysprobe-socket-dir", SYSPROBE_SOCKET_DIR));
        }

        let socket = format!("{}/sysprobe.sock", SYSPROBE_SOCKET_DIR);
        for c in [containers::PROCESS_AGENT, containers::SYSTEM_PROBE] {
            template.add_env(c, env::NETWORK_ENABLED, "true");
            template.add_env(c, env::SYSPROBE_SOCKET, socket.clone());
        }
        template.add_env(containers::SYSTEM_PROBE, env::CONNTRACK_ENABLED, self.conntrack.to_string());
    }
}
