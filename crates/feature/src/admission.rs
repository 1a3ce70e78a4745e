//! Admission controller run by the cluster agent.

use agentop_apply::ResourceManagers;
use agentop_core::names::{self, containers};
use agentop_core::{crd::enabled, AgentDeployment, ComponentName, Result};
use k8s_openapi::api::rbac::v1::PolicyRule;
use kube::ResourceExt;

use crate::{collect, env, Capability, Feature, FeatureId, FeatureOptions, RequiredComponent, RequiredComponents, Scope};

pub const WEBHOOK_PORT: i32 = 8000;

#[derive(Debug, Clone)]
pub struct AdmissionController {
    owner: String,
    mutate_unlabelled: bool,
    service_name: String,
    webhook_name: String,
}

/// Name of the mutating webhook registered by the cluster agent.
pub fn webhook_name(instance: &AgentDeployment) -> String {
    format!("{}-webhook", instance.name_any())
}

pub fn service_name(instance: &AgentDeployment) -> String {
    instance
        .features()
        .admission_controller
        .and_then(|a| a.service_name)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("{}-admission-controller", instance.name_any()))
}

pub(crate) fn is_enabled(instance: &AgentDeployment) -> bool {
    enabled(instance.features().admission_controller.and_then(|a| a.enabled))
}

pub(crate) fn build(instance: &AgentDeployment, _: &FeatureOptions) -> Option<Feature> {
    if !is_enabled(instance) {
        return None;
    }
    let ac = instance.features().admission_controller.unwrap_or_default();
    Some(Feature::AdmissionController(AdmissionController {
        owner: instance.name_any(),
        mutate_unlabelled: ac.mutate_unlabelled.unwrap_or(false),
        service_name: service_name(instance),
        webhook_name: webhook_name(instance),
    }))
}

fn webhook_rules() -> Vec<PolicyRule> {
    vec![
        PolicyRule {
            api_groups: Some(vec!["admissionregistration.k8s.io".into()]),
            resources: Some(vec!["mutatingwebhookconfigurations".into(), "validatingwebhookconfigurations".into()]),
            verbs: vec!["get".into(), "list".into(), "watch".into(), "update".into(), "create".into()],
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec!["".into()]),
            resources: Some(vec!["secrets".into()]),
            verbs: vec!["get".into(), "list".into(), "watch".into(), "update".into(), "create".into()],
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec!["batch".into()]),
            resources: Some(vec!["jobs".into(), "cronjobs".into()]),
            verbs: vec!["get".into()],
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec!["apps".into()]),
            resources: Some(vec!["statefulsets".into(), "replicasets".into(), "deployments".into()]),
            verbs: vec!["get".into()],
            ..Default::default()
        },
    ]
}

impl Capability for AdmissionController {
    fn id(&self) -> FeatureId {
        FeatureId::AdmissionController
    }

    fn requirements(&self) -> RequiredComponents {
        RequiredComponents { cluster_agent: RequiredComponent::yes(), ..Default::default() }
    }

    fn manage_dependencies(&self, managers: &mut ResourceManagers, required: &RequiredComponents) -> Result<()> {
        if !required.is_enabled(ComponentName::ClusterAgent) {
            return Ok(());
        }
        let ns = managers.owner().namespace.clone();
        let mut errs = Vec::new();
        errs.extend(
            managers
                .service(
                    &ns,
                    &self.service_name,
                    names::selector_labels(&self.owner, ComponentName::ClusterAgent),
                    vec![("webhook".into(), 443, WEBHOOK_PORT)],
                )
                .err(),
        );
        let role = names::component(&self.owner, ComponentName::ClusterAgent);
        errs.extend(managers.cluster_role_rules(&role, webhook_rules()).err());
        collect(errs)
    }

    fn configure(&self, component: ComponentName, template: &mut Scope<'_>, _: &str) {
        if component != ComponentName::ClusterAgent {
            return;
        }
        let c = containers::CLUSTER_AGENT;
        template.add_env(c, env::ADMISSION_ENABLED, "true");
        template.add_env(c, env::ADMISSION_MUTATE_UNLABELLED, self.mutate_unlabelled.to_string());
        template.add_env(c, env::ADMISSION_SERVICE_NAME, self.service_name.clone());
        template.add_env(c, env::ADMISSION_WEBHOOK_NAME, self.webhook_name.clone());
    }
}
