use agentop_apply::ResourceManagers;
use agentop_core::crd::enabled;
use agentop_core::names::{self, containers};
use agentop_core::{AgentDeployment, ComponentName, Result};
use k8s_openapi::api::rbac::v1::PolicyRule;
use kube::ResourceExt;

use crate::{env, Capability, Feature, FeatureId, FeatureOptions, RequiredComponent, RequiredComponents, Scope};

#[derive(Debug, Clone)]
pub struct OrchestratorExplorer {
    owner: String,
    scrubbing: bool,
}

pub(crate) fn build(instance: &AgentDeployment, _: &FeatureOptions) -> Option<Feature> {
    let oe = instance.features().orchestrator_explorer?;
    if !enabled(oe.enabled) {
        return None;
    }
    Some(Feature::OrchestratorExplorer(OrchestratorExplorer {
        owner: instance.name_any(),
        scrubbing: oe.scrubbing.unwrap_or(true),
    }))
}

fn rules() -> Vec<PolicyRule> {
    let read = vec!["get".to_string(), "list".to_string(), "watch".to_string()];
    let group = |g: &str, rs: &[&str]| PolicyRule {
        api_groups: Some(vec![g.to_string()]),
        resources: Some(rs.iter().map(|s| s.to_string()).collect()),
        verbs: read.clone(),
        ..Default::default()
    };
    vec![
        group("", &["pods", "services", "nodes", "namespaces", "persistentvolumes", "persistentvolumeclaims", "serviceaccounts"]),
        group("apps", &["deployments", "replicasets", "daemonsets", "statefulsets"]),
        group("batch", &["jobs", "cronjobs"]),
        group("networking.k8s.io", &["ingresses"]),
        group("rbac.authorization.k8s.io", &["roles", "rolebindings", "clusterroles", "clusterrolebindings"]),
    ]
}

impl Capability for OrchestratorExplorer {
    fn id(&self) -> FeatureId {
        FeatureId::OrchestratorExplorer
    }

    fn requirements(&self) -> RequiredComponents {
        RequiredComponents {
            node_agent: RequiredComponent::with_containers(&[containers::AGENT, containers::PROCESS_AGENT]),
            cluster_agent: RequiredComponent::yes(),
            ..Default::default()
        }
    }

    fn manage_dependencies(&self, managers: &mut ResourceManagers, required: &RequiredComponents) -> Result<()> {
        if !required.is_enabled(ComponentName::ClusterAgent) {
            return Ok(());
        }
        let role = names::component(&self.owner, ComponentName::ClusterAgent);
        managers.cluster_role_rules(&role, rules()).map(|_| ())
    }

    fn configure(&self, component: ComponentName, template: &mut Scope<'_>, _: &str) {
        let targets: &[&str] = match component {
            ComponentName::NodeAgent => &[containers::PROCESS_AGENT],
            ComponentName::ClusterAgent => &[containers::CLUSTER_AGENT],
            ComponentName::ClusterChecksRunner => &[],
        };
        for c in targets {
            template.add_env(c, env::ORCHESTRATOR_ENABLED, "true");
            template.add_env(c, env::ORCHESTRATOR_SCRUBBING, self.scrubbing.to_string());
        }
    }
}
