//! Workload builders: node-agent DaemonSets and the cluster-agent / checks-runner Deployments.
//!
//! Layering on the pod template: base containers, then features, then the
//! component override, then (node agent only) the profile override.

use std::collections::{BTreeMap, BTreeSet};

use agentop_core::crd::{ComponentOverride, ContainerOverride, ProfileOverride};
use agentop_core::defaults::DEFAULT_REGISTRY;
use agentop_core::names::{self, containers};
use agentop_core::{AgentDeployment, AgentProfile, ComponentName};
use agentop_feature::{configure_all, Feature, PodTemplateManager, RequiredComponents};
use agentop_profile::ProfileRef;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Capabilities, Container, ContainerPort, NodeAffinity, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, PodSpec, PodTemplateSpec, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use crate::providers;

pub const DEFAULT_IMAGE_TAG: &str = "7.52.0";

/// Everything the builders need from the current pass.
pub struct Inputs<'a> {
    /// Defaulted working copy.
    pub instance: &'a AgentDeployment,
    pub features: &'a [Feature],
    pub required: &'a RequiredComponents,
}

impl Inputs<'_> {
    fn owner(&self) -> String {
        self.instance.name_any()
    }

    fn namespace(&self) -> Option<String> {
        self.instance.namespace()
    }

    fn image(&self, component: ComponentName) -> String {
        let default_name = match component {
            ComponentName::ClusterAgent => "cluster-agent",
            _ => "agent",
        };
        let img = self.instance.component_override(component).and_then(|o| o.image.clone()).unwrap_or_default();
        let name = img.name.unwrap_or_else(|| default_name.to_string());
        let tag = img.tag.unwrap_or_else(|| DEFAULT_IMAGE_TAG.to_string());
        if name.contains('/') {
            return format!("{}:{}", name, tag);
        }
        let registry = self.instance.global().registry.unwrap_or_else(|| DEFAULT_REGISTRY.to_string());
        format!("{}/{}:{}", registry, name, tag)
    }
}

pub fn node_agent_name(owner: &str, profile: &ProfileRef, provider: &str) -> String {
    let mut name = names::component(owner, ComponentName::NodeAgent);
    if !profile.is_default() {
        name = format!("{}-profile-{}-{}", name, profile.namespace, profile.name);
    }
    if !provider.is_empty() {
        name = format!("{}-{}", name, provider);
    }
    name
}

fn container(name: &str, image: &str) -> Container {
    let mut c = Container { name: name.to_string(), image: Some(image.to_string()), ..Default::default() };
    match name {
        containers::AGENT | containers::CLUSTER_AGENT | containers::CHECKS_RUNNER => {}
        containers::SYSTEM_PROBE => {
            c.command = Some(vec!["system-probe".into(), "--config=/etc/agentop/system-probe.yaml".into()]);
            c.security_context = Some(SecurityContext {
                capabilities: Some(Capabilities {
                    add: Some(
                        ["SYS_ADMIN", "SYS_RESOURCE", "SYS_PTRACE", "NET_ADMIN", "NET_BROADCAST", "NET_RAW", "IPC_LOCK"]
                            .iter()
                            .map(|s| s.to_string())
                            .collect(),
                    ),
                    drop: None,
                }),
                ..Default::default()
            });
        }
        other => c.command = Some(vec![other.to_string(), "--config=/etc/agentop/agent.yaml".into()]),
    }
    c
}

fn template(labels: &BTreeMap<String, String>, service_account: String, containers: Vec<Container>) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta { labels: Some(labels.clone()), ..Default::default() }),
        spec: Some(PodSpec { service_account_name: Some(service_account), containers, ..Default::default() }),
    }
}

fn container_mut<'a>(t: &'a mut PodTemplateSpec, name: &str) -> Option<&'a mut Container> {
    t.spec.as_mut()?.containers.iter_mut().find(|c| c.name == name)
}

fn container_env(mgr: &mut PodTemplateManager, name: &str, ov: &ContainerOverride) {
    let mut scope = mgr.overrides();
    for var in &ov.env {
        scope.add_env_var(name, var.clone());
    }
}

fn container_resources(t: &mut PodTemplateSpec, name: &str, ov: &ContainerOverride) {
    if let (Some(res), Some(c)) = (&ov.resources, container_mut(t, name)) {
        c.resources = Some(res.clone());
    }
}

fn add_labels(t: &mut PodTemplateSpec, extra: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) {
    let meta = t.metadata.get_or_insert_with(Default::default);
    let labels = meta.labels.get_or_insert_with(Default::default);
    labels.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    // Selector labels must keep matching.
    labels.extend(selector.iter().map(|(k, v)| (k.clone(), v.clone())));
}

/// Run the features, then apply the component override.
fn configure(
    inputs: &Inputs<'_>,
    component: ComponentName,
    base: PodTemplateSpec,
    provider: &str,
) -> (PodTemplateManager, Option<ComponentOverride>) {
    let mut mgr = PodTemplateManager::new(base);
    configure_all(inputs.features, component, &mut mgr, provider);

    let ov = inputs.instance.component_override(component).cloned();
    if let Some(ov) = &ov {
        let names = mgr.overrides().container_names();
        {
            let mut scope = mgr.overrides();
            for var in &ov.env {
                for c in &names {
                    scope.add_env_var(c, var.clone());
                }
            }
            for (k, v) in &ov.annotations {
                scope.add_annotation(k, v);
            }
        }
        for (name, c) in &ov.containers {
            container_env(&mut mgr, name, c);
        }
    }
    (mgr, ov)
}

fn finish_override(t: &mut PodTemplateSpec, ov: Option<&ComponentOverride>, selector: &BTreeMap<String, String>) {
    let Some(ov) = ov else { return };
    add_labels(t, &ov.labels, selector);
    for (name, c) in &ov.containers {
        container_resources(t, name, c);
    }
    if let Some(spec) = t.spec.as_mut() {
        if !ov.node_selector.is_empty() {
            spec.node_selector = Some(ov.node_selector.clone());
        }
        if let Some(pc) = &ov.priority_class_name {
            spec.priority_class_name = Some(pc.clone());
        }
    }
}

fn profile_override(mgr: &mut PodTemplateManager, ov: &ProfileOverride) {
    for (name, c) in &ov.containers {
        container_env(mgr, name, c);
    }
}

fn finish_profile(t: &mut PodTemplateSpec, ov: &ProfileOverride, selector: &BTreeMap<String, String>) {
    add_labels(t, &ov.labels, selector);
    for (name, c) in &ov.containers {
        container_resources(t, name, c);
    }
    if let (Some(pc), Some(spec)) = (&ov.priority_class_name, t.spec.as_mut()) {
        spec.priority_class_name = Some(pc.clone());
    }
}

fn node_affinity(expressions: Vec<NodeSelectorRequirement>, fields: Vec<NodeSelectorRequirement>) -> Option<Affinity> {
    if expressions.is_empty() && fields.is_empty() {
        return None;
    }
    Some(Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: if expressions.is_empty() { None } else { Some(expressions) },
                    match_fields: if fields.is_empty() { None } else { Some(fields) },
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn meta(inputs: &Inputs<'_>, name: String) -> ObjectMeta {
    ObjectMeta { name: Some(name), namespace: inputs.namespace(), ..Default::default() }
}

/// Node-agent DaemonSet for one (profile, provider) pair.
pub struct NodeAgentTarget<'a> {
    pub profile_ref: &'a ProfileRef,
    pub profile: Option<&'a AgentProfile>,
    pub provider: &'a str,
    /// Nodes owned by non-default profiles; the default DaemonSet avoids them.
    pub claimed: &'a BTreeSet<String>,
    pub profiles_enabled: bool,
}

pub fn node_agent(inputs: &Inputs<'_>, target: &NodeAgentTarget<'_>) -> DaemonSet {
    let owner = inputs.owner();
    let component = ComponentName::NodeAgent;
    let mut selector = names::selector_labels(&owner, component);
    if target.profiles_enabled {
        selector.insert(names::LABEL_PROFILE.to_string(), target.profile_ref.label_value());
    }
    if !target.provider.is_empty() {
        selector.insert(names::LABEL_PROVIDER.to_string(), target.provider.to_string());
    }

    let image = inputs.image(component);
    let mut wanted: Vec<&str> = vec![containers::AGENT];
    wanted.extend(inputs.required.node_agent.containers.iter().copied().filter(|c| *c != containers::AGENT));
    let base = template(
        &selector,
        inputs.instance.service_account_name(component),
        wanted.iter().map(|c| container(c, &image)).collect(),
    );

    let (mut mgr, ov) = configure(inputs, component, base, target.provider);
    let profile_ov = target.profile.and_then(|p| p.node_agent_override()).cloned();
    if let Some(pov) = &profile_ov {
        profile_override(&mut mgr, pov);
    }
    let mut t = mgr.into_template();
    finish_override(&mut t, ov.as_ref(), &selector);
    if let Some(pov) = &profile_ov {
        finish_profile(&mut t, pov, &selector);
    }

    let mut expressions = Vec::new();
    let mut fields = Vec::new();
    if let Some(p) = target.profile.filter(|_| !target.profile_ref.is_default()) {
        expressions.extend(p.node_requirements().iter().cloned());
    }
    if target.profiles_enabled && target.profile_ref.is_default() && !target.claimed.is_empty() {
        fields.push(NodeSelectorRequirement {
            key: "metadata.name".into(),
            operator: "NotIn".into(),
            values: Some(target.claimed.iter().cloned().collect()),
        });
    }
    expressions.extend(providers::affinity(target.provider));
    if let Some(spec) = t.spec.as_mut() {
        spec.affinity = node_affinity(expressions, fields);
    }

    DaemonSet {
        metadata: meta(inputs, node_agent_name(&owner, target.profile_ref, target.provider)),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector { match_labels: Some(selector), ..Default::default() },
            template: t,
            ..Default::default()
        }),
        status: None,
    }
}

fn deployment(inputs: &Inputs<'_>, component: ComponentName, container_name: &str) -> Deployment {
    let owner = inputs.owner();
    let selector = names::selector_labels(&owner, component);
    let mut c = container(container_name, &inputs.image(component));
    if component == ComponentName::ClusterAgent {
        c.ports = Some(vec![ContainerPort {
            name: Some("agentport".into()),
            container_port: names::CLUSTER_AGENT_PORT,
            protocol: Some("TCP".into()),
            ..Default::default()
        }]);
    }
    let base = template(&selector, inputs.instance.service_account_name(component), vec![c]);
    let (mgr, ov) = configure(inputs, component, base, "");
    let mut t = mgr.into_template();
    finish_override(&mut t, ov.as_ref(), &selector);

    Deployment {
        metadata: meta(inputs, names::component(&owner, component)),
        spec: Some(DeploymentSpec {
            replicas: Some(ov.as_ref().and_then(|o| o.replicas).unwrap_or(1)),
            selector: LabelSelector { match_labels: Some(selector), ..Default::default() },
            template: t,
            ..Default::default()
        }),
        status: None,
    }
}

pub fn cluster_agent(inputs: &Inputs<'_>) -> Deployment {
    deployment(inputs, ComponentName::ClusterAgent, containers::CLUSTER_AGENT)
}

pub fn checks_runner(inputs: &Inputs<'_>) -> Deployment {
    deployment(inputs, ComponentName::ClusterChecksRunner, containers::CHECKS_RUNNER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentop_core::builder::{AgentDeploymentBuilder, AgentProfileBuilder};
    use agentop_core::defaults;
    use agentop_feature::{build_features, env_value, FeatureOptions};
    use k8s_openapi::api::core::v1::EnvVar;

    fn inst(b: AgentDeploymentBuilder) -> AgentDeployment {
        let mut i = b.build();
        defaults::apply(&mut i.spec);
        i
    }

    fn base() -> AgentDeploymentBuilder {
        AgentDeploymentBuilder::new("ns", "dd").with_credentials("k", "a")
    }

    #[test]
    fn names_encode_profile_and_provider() {
        let d = ProfileRef::default_profile();
        let p = ProfileRef { namespace: "ns".into(), name: "gpu".into() };
        assert_eq!(node_agent_name("dd", &d, ""), "dd-agent");
        assert_eq!(node_agent_name("dd", &d, "gke-cos"), "dd-agent-gke-cos");
        assert_eq!(node_agent_name("dd", &p, "default"), "dd-agent-profile-ns-gpu-default");
    }

    #[test]
    fn overrides_win_over_features_and_profile_wins_last() {
        let i = inst(
            base().with_log_collection(true).with_override(
                ComponentName::NodeAgent,
                ComponentOverride {
                    env: vec![EnvVar { name: "AGENT_LOGS_ENABLED".into(), value: Some("false".into()), ..Default::default() }],
                    labels: [("team".to_string(), "core".to_string())].into_iter().collect(),
                    ..Default::default()
                },
            ),
        );
        let (features, required) = build_features(&i, &FeatureOptions::default());
        let inputs = Inputs { instance: &i, features: &features, required: &required };
        let profile = AgentProfileBuilder::new("ns", "gpu")
            .selector("pool", "In", &["gpu"])
            .container_env("agent", "AGENT_LOGS_ENABLED", "profile")
            .priority_class("high")
            .build();
        let pref = ProfileRef::of(&profile);
        let claimed = BTreeSet::new();
        let ds = node_agent(
            &inputs,
            &NodeAgentTarget { profile_ref: &pref, profile: Some(&profile), provider: "", claimed: &claimed, profiles_enabled: true },
        );
        let spec = ds.spec.unwrap();
        let t = &spec.template;
        assert_eq!(env_value(t, "agent", "AGENT_LOGS_ENABLED"), Some("profile"));
        assert_eq!(t.spec.as_ref().unwrap().priority_class_name.as_deref(), Some("high"));
        let labels = t.metadata.as_ref().unwrap().labels.as_ref().unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("core"));
        assert_eq!(labels.get(names::LABEL_PROFILE).map(String::as_str), Some("ns-gpu"));
        assert_eq!(spec.selector.match_labels.as_ref().unwrap().get(names::LABEL_PROFILE).map(String::as_str), Some("ns-gpu"));
        let terms = &t.spec.as_ref().unwrap().affinity.as_ref().unwrap().node_affinity.as_ref().unwrap()
            .required_during_scheduling_ignored_during_execution.as_ref().unwrap().node_selector_terms;
        assert_eq!(terms[0].match_expressions.as_ref().unwrap()[0].key, "pool");
    }

    #[test]
    fn default_daemon_set_avoids_claimed_nodes() {
        let i = inst(base());
        let (features, required) = build_features(&i, &FeatureOptions::default());
        let inputs = Inputs { instance: &i, features: &features, required: &required };
        let claimed: BTreeSet<String> = ["n1".to_string()].into_iter().collect();
        let d = ProfileRef::default_profile();
        let ds = node_agent(
            &inputs,
            &NodeAgentTarget { profile_ref: &d, profile: None, provider: "gke-cos", claimed: &claimed, profiles_enabled: true },
        );
        let t = ds.spec.unwrap().template;
        let term = &t.spec.unwrap().affinity.unwrap().node_affinity.unwrap()
            .required_during_scheduling_ignored_during_execution.unwrap().node_selector_terms[0].clone();
        assert_eq!(term.match_fields.as_ref().unwrap()[0].values.as_ref().unwrap(), &vec!["n1".to_string()]);
        assert_eq!(term.match_expressions.as_ref().unwrap()[0].operator, "In");
    }

    #[test]
    fn npm_node_agent_runs_system_probe() {
        let i = inst(base().with_npm(true));
        let (features, required) = build_features(&i, &FeatureOptions::default());
        let inputs = Inputs { instance: &i, features: &features, required: &required };
        let d = ProfileRef::default_profile();
        let claimed = BTreeSet::new();
        let ds = node_agent(
            &inputs,
            &NodeAgentTarget { profile_ref: &d, profile: None, provider: "", claimed: &claimed, profiles_enabled: false },
        );
        let t = ds.spec.unwrap().template;
        let names: Vec<String> = t.spec.as_ref().unwrap().containers.iter().map(|c| c.name.clone()).collect();
        assert_eq!(names[0], "agent");
        assert!(names.contains(&"system-probe".to_string()));
        assert_eq!(env_value(&t, "system-probe", "AGENT_NETWORK_CONFIG_ENABLED"), Some("true"));
        assert_eq!(env_value(&t, "system-probe", "AGENT_SITE"), Some(defaults::DEFAULT_SITE));
    }

    #[test]
    fn cluster_agent_replicas_and_image_follow_override() {
        let i = inst(base().with_override(
            ComponentName::ClusterAgent,
            ComponentOverride {
                replicas: Some(2),
                image: Some(agentop_core::crd::ImageConfig { name: None, tag: Some("7.60.0".into()) }),
                ..Default::default()
            },
        ));
        let (features, required) = build_features(&i, &FeatureOptions::default());
        let inputs = Inputs { instance: &i, features: &features, required: &required };
        let d = cluster_agent(&inputs);
        let spec = d.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        let c = &spec.template.spec.unwrap().containers[0];
        assert_eq!(c.image.as_deref(), Some("ghcr.io/agentop/cluster-agent:7.60.0"));
        assert_eq!(d.metadata.name.as_deref(), Some("dd-cluster-agent"));
    }
}
