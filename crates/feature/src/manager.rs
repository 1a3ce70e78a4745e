//! Pod template mutation with per-key feature ownership.
//!
//! Every env var, volume, mount, annotation and port a feature writes is
//! recorded against that feature's id. A feature may overwrite its own keys
//! (last write wins); a write to a key another feature already owns is refused.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, Volume, VolumeMount};
use metrics::counter;
use tracing::warn;

use crate::FeatureId;

/// Who wrote a key: a feature, or the workload builder / user overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOwner {
    Feature(FeatureId),
    Override,
}

pub struct PodTemplateManager {
    template: PodTemplateSpec,
    owners: BTreeMap<String, KeyOwner>,
}

impl PodTemplateManager {
    /// Keys already present in `template` belong to [`KeyOwner::Override`]; features cannot replace them.
    pub fn new(template: PodTemplateSpec) -> Self {
        let owners = base_keys(&template).into_iter().map(|k| (k, KeyOwner::Override)).collect();
        Self { template, owners }
    }

    pub fn template(&self) -> &PodTemplateSpec {
        &self.template
    }

    pub fn into_template(self) -> PodTemplateSpec {
        self.template
    }

    pub fn owner_of(&self, key: &str) -> Option<KeyOwner> {
        self.owners.get(key).copied()
    }

    /// Scope writes to one feature.
    pub fn feature(&mut self, id: FeatureId) -> Scope<'_> {
        Scope { mgr: self, owner: KeyOwner::Feature(id) }
    }

    /// Scope for user overrides; these replace feature values unconditionally.
    pub fn overrides(&mut self) -> Scope<'_> {
        Scope { mgr: self, owner: KeyOwner::Override }
    }

    fn spec(&mut self) -> &mut PodSpec {
        self.template.spec.get_or_insert_with(Default::default)
    }

    fn claim(&mut self, key: String, who: KeyOwner) -> bool {
        match self.owners.get(&key) {
            Some(prev) if *prev != who && who != KeyOwner::Override => {
                warn!(key = %key, owner = ?prev, writer = ?who, "pod template key owned by another feature; write refused");
                counter!("template_write_conflicts", 1u64);
                false
            }
            _ => {
                self.owners.insert(key, who);
                true
            }
        }
    }

    fn container_mut(&mut self, name: &str) -> Option<&mut Container> {
        self.spec().containers.iter_mut().find(|c| c.name == name)
    }
}

fn base_keys(template: &PodTemplateSpec) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(annotations) = template.metadata.as_ref().and_then(|m| m.annotations.as_ref()) {
        keys.extend(annotations.keys().map(|k| annotation_key(k)));
    }
    let Some(spec) = template.spec.as_ref() else { return keys };
    keys.extend(spec.volumes.iter().flatten().map(|v| volume_key(&v.name)));
    for c in &spec.containers {
        keys.extend(c.env.iter().flatten().map(|e| env_key(&c.name, &e.name)));
        keys.extend(c.volume_mounts.iter().flatten().map(|m| mount_key(&c.name, &m.name)));
        keys.extend(c.ports.iter().flatten().map(|p| port_key(&c.name, p)));
    }
    keys
}

pub fn env_key(container: &str, name: &str) -> String {
    format!("env:{}:{}", container, name)
}

pub fn volume_key(name: &str) -> String {
    format!("volume:{}", name)
}

pub fn mount_key(container: &str, name: &str) -> String {
    format!("mount:{}:{}", container, name)
}

pub fn annotation_key(name: &str) -> String {
    format!("annotation:{}", name)
}

pub fn port_key(container: &str, port: &ContainerPort) -> String {
    format!("port:{}:{}", container, port.name.as_deref().unwrap_or_default())
}

/// Writes on behalf of one owner. Every method returns whether the write landed.
pub struct Scope<'a> {
    mgr: &'a mut PodTemplateManager,
    owner: KeyOwner,
}

impl Scope<'_> {
    pub fn container_names(&self) -> Vec<String> {
        self.mgr.template.spec.as_ref().map(|s| s.containers.iter().map(|c| c.name.clone()).collect()).unwrap_or_default()
    }

    pub fn add_env(&mut self, container: &str, name: &str, value: impl Into<String>) -> bool {
        self.add_env_var(container, EnvVar { name: name.to_string(), value: Some(value.into()), ..Default::default() })
    }

    pub fn add_env_var(&mut self, container: &str, var: EnvVar) -> bool {
        if self.mgr.container_mut(container).is_none() {
            return false;
        }
        if !self.mgr.claim(env_key(container, &var.name), self.owner) {
            return false;
        }
        let Some(c) = self.mgr.container_mut(container) else { return false };
        let env = c.env.get_or_insert_with(Vec::new);
        match env.iter_mut().find(|e| e.name == var.name) {
            Some(existing) => *existing = var,
            None => env.push(var),
        }
        true
    }

    /// Same variable on every container of the template.
    pub fn add_env_all(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        for c in self.container_names() {
            self.add_env(&c, name, value.clone());
        }
    }

    pub fn add_env_var_all(&mut self, var: EnvVar) {
        for c in self.container_names() {
            self.add_env_var(&c, var.clone());
        }
    }

    pub fn add_volume(&mut self, volume: Volume) -> bool {
        if !self.mgr.claim(volume_key(&volume.name), self.owner) {
            return false;
        }
        let vols = self.mgr.spec().volumes.get_or_insert_with(Vec::new);
        match vols.iter_mut().find(|v| v.name == volume.name) {
            Some(existing) => *existing = volume,
            None => vols.push(volume),
        }
        true
    }

    pub fn add_volume_mount(&mut self, container: &str, mount: VolumeMount) -> bool {
        if self.mgr.container_mut(container).is_none() {
            return false;
        }
        if !self.mgr.claim(mount_key(container, &mount.name), self.owner) {
            return false;
        }
        let Some(c) = self.mgr.container_mut(container) else { return false };
        let mounts = c.volume_mounts.get_or_insert_with(Vec::new);
        match mounts.iter_mut().find(|m| m.name == mount.name) {
            Some(existing) => *existing = mount,
            None => mounts.push(mount),
        }
        true
    }

    pub fn add_annotation(&mut self, key: &str, value: &str) -> bool {
        if !self.mgr.claim(annotation_key(key), self.owner) {
            return false;
        }
        let meta = self.mgr.template.metadata.get_or_insert_with(Default::default);
        meta.annotations.get_or_insert_with(Default::default).insert(key.to_string(), value.to_string());
        true
    }

    pub fn add_port(&mut self, container: &str, port: ContainerPort) -> bool {
        let key = port_key(container, &port);
        if self.mgr.container_mut(container).is_none() || !self.mgr.claim(key, self.owner) {
            return false;
        }
        let Some(c) = self.mgr.container_mut(container) else { return false };
        let ports = c.ports.get_or_insert_with(Vec::new);
        match ports.iter_mut().find(|p| p.name == port.name) {
            Some(existing) => *existing = port,
            None => ports.push(port),
        }
        true
    }
}

/// Value of env var `name` on `container`, if set.
pub fn env_value<'a>(template: &'a PodTemplateSpec, container: &str, name: &str) -> Option<&'a str> {
    template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == container)?
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == name)?
        .value
        .as_deref()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(containers: &[&str]) -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: containers.iter().map(|n| Container { name: n.to_string(), ..Default::default() }).collect(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn same_feature_last_write_wins() {
        let mut m = PodTemplateManager::new(template(&["agent"]));
        assert!(m.feature(FeatureId::Apm).add_env("agent", "X", "1"));
        assert!(m.feature(FeatureId::Apm).add_env("agent", "X", "2"));
        assert_eq!(env_value(m.template(), "agent", "X"), Some("2"));
        assert_eq!(m.template().spec.as_ref().unwrap().containers[0].env.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn other_feature_cannot_clobber_owned_key() {
        let mut m = PodTemplateManager::new(template(&["agent"]));
        assert!(m.feature(FeatureId::Apm).add_env("agent", "X", "apm"));
        assert!(!m.feature(FeatureId::Npm).add_env("agent", "X", "npm"));
        assert_eq!(env_value(m.template(), "agent", "X"), Some("apm"));
        assert_eq!(m.owner_of(&env_key("agent", "X")), Some(KeyOwner::Feature(FeatureId::Apm)));
        // Overrides always land.
        assert!(m.overrides().add_env("agent", "X", "user"));
        assert_eq!(env_value(m.template(), "agent", "X"), Some("user"));
    }

    #[test]
    fn writes_to_missing_container_are_dropped() {
        let mut m = PodTemplateManager::new(template(&["agent"]));
        assert!(!m.feature(FeatureId::Apm).add_env("trace-agent", "X", "1"));
        assert!(m.owner_of(&env_key("trace-agent", "X")).is_none());
    }

    #[test]
    fn builder_keys_are_not_overwritten_by_features() {
        let mut base = template(&["cluster-agent"]);
        let c = &mut base.spec.as_mut().unwrap().containers[0];
        c.ports = Some(vec![ContainerPort { name: Some("agentport".into()), container_port: 5005, ..Default::default() }]);
        c.env = Some(vec![EnvVar { name: "DD_CLUSTER_NAME".into(), value: Some("prod".into()), ..Default::default() }]);
        let mut m = PodTemplateManager::new(base);
        assert_eq!(m.owner_of(&env_key("cluster-agent", "DD_CLUSTER_NAME")), Some(KeyOwner::Override));

        let port = ContainerPort { name: Some("agentport".into()), container_port: 9999, ..Default::default() };
        assert!(!m.feature(FeatureId::AdmissionController).add_port("cluster-agent", port));
        assert!(!m.feature(FeatureId::Defaults).add_env("cluster-agent", "DD_CLUSTER_NAME", "other"));
        let c = &m.template().spec.as_ref().unwrap().containers[0];
        assert_eq!(c.ports.as_ref().unwrap()[0].container_port, 5005);
        assert_eq!(env_value(m.template(), "cluster-agent", "DD_CLUSTER_NAME"), Some("prod"));
        // Untouched keys remain free for features.
        assert!(m.feature(FeatureId::Defaults).add_env("cluster-agent", "DD_SITE", "datadoghq.com"));
    }

    #[test]
    fn volumes_and_annotations_are_tracked() {
        let mut m = PodTemplateManager::new(template(&["agent", "system-probe"]));
        let mut s = m.feature(FeatureId::Npm);
        assert!(s.add_volume(Volume { name: "debugfs".into(), ..Default::default() }));
        assert!(s.add_volume_mount("system-probe", VolumeMount { name: "debugfs".into(), mount_path: "/sys/kernel/debug".into(), ..Default::default() }));
        assert!(s.add_annotation("a", "b"));
        s.add_env_all("SHARED", "1");
        assert!(!m.feature(FeatureId::LogCollection).add_volume(Volume { name: "debugfs".into(), ..Default::default() }));
        let spec = m.template().spec.as_ref().unwrap();
        assert_eq!(spec.containers.len(), 2);
        assert_eq!(spec.volumes.as_ref().unwrap().len(), 1);
        assert_eq!(env_value(m.template(), "system-probe", "SHARED"), Some("1"));
        assert_eq!(env_value(m.template(), "agent", "SHARED"), Some("1"));
    }
}
