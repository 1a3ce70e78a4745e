//! Always-on baseline: credentials, cluster-agent token, service accounts, base RBAC,
//! the cluster-agent service and install info.

use std::collections::BTreeMap;

use agentop_apply::ResourceManagers;
use agentop_core::crd::{Credentials, SecretRef};
use agentop_core::names::{self, containers};
use agentop_core::{AgentDeployment, ComponentName, Result};
use k8s_openapi::api::rbac::v1::PolicyRule;
use kube::ResourceExt;

use crate::{collect, env, field_env, secret_env, Capability, Feature, FeatureId, FeatureOptions, InstallInfo};
use crate::{RequiredComponent, RequiredComponents, Scope};

#[derive(Debug, Clone)]
pub struct Defaults {
    owner: String,
    site: String,
    cluster_name: Option<String>,
    credentials: Credentials,
    /// Where the token lives when the user supplied the secret.
    token_ref: Option<SecretRef>,
    /// Value written to the generated token secret otherwise.
    token: String,
    network_policy: bool,
    cluster_agent_enabled: bool,
    service_accounts: BTreeMap<ComponentName, String>,
    install: InstallInfo,
}

pub(crate) fn build(instance: &AgentDeployment, options: &FeatureOptions) -> Option<Feature> {
    let global = instance.global();
    let token_ref = global.cluster_agent_token_secret.clone();
    let token = global
        .cluster_agent_token
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(|| instance.status.as_ref().and_then(|s| s.generated_token()).map(str::to_string))
        .unwrap_or_else(options.generate_token);
    Some(Feature::Defaults(Defaults {
        owner: instance.name_any(),
        site: global.site.unwrap_or_else(|| agentop_core::defaults::DEFAULT_SITE.to_string()),
        cluster_name: global.cluster_name,
        credentials: global.credentials.unwrap_or_default(),
        token_ref,
        token,
        network_policy: global.network_policy.and_then(|n| n.create).unwrap_or(false),
        cluster_agent_enabled: !instance.is_disabled(ComponentName::ClusterAgent),
        service_accounts: ComponentName::ALL.into_iter().map(|c| (c, instance.service_account_name(c))).collect(),
        install: options.install.clone(),
    }))
}

fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(groups.iter().map(|s| s.to_string()).collect()),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn base_rules(component: ComponentName) -> Vec<PolicyRule> {
    match component {
        ComponentName::NodeAgent => vec![
            rule(&[""], &["nodes/metrics", "nodes/spec", "nodes/proxy", "nodes/stats"], &["get"]),
            rule(&[""], &["endpoints"], &["get"]),
        ],
        ComponentName::ClusterAgent => vec![
            rule(&[""], &["services", "events", "endpoints", "pods", "nodes", "namespaces", "componentstatuses"], &["get", "list", "watch"]),
            rule(&["coordination.k8s.io"], &["leases"], &["get"]),
        ],
        ComponentName::ClusterChecksRunner => vec![
            rule(&[""], &["services", "events", "endpoints", "pods", "nodes", "componentstatuses"], &["get", "list", "watch"]),
        ],
    }
}

fn leader_election_rules() -> Vec<PolicyRule> {
    vec![
        rule(&[""], &["configmaps"], &["get", "create", "update"]),
        rule(&["coordination.k8s.io"], &["leases"], &["get", "create", "update"]),
        rule(&[""], &["events"], &["create"]),
    ]
}

pub(crate) fn leader_election_name(owner: &str) -> String {
    format!("{}-leader-election", owner)
}

impl Defaults {
    fn api_key_env(&self) -> Option<k8s_openapi::api::core::v1::EnvVar> {
        if let Some(r) = &self.credentials.api_secret {
            return Some(secret_env(env::API_KEY, &r.secret_name, &r.key_name));
        }
        self.credentials
            .api_key
            .as_ref()
            .map(|_| secret_env(env::API_KEY, &names::credentials_secret(&self.owner), names::API_KEY_KEY))
    }

    fn app_key_env(&self) -> Option<k8s_openapi::api::core::v1::EnvVar> {
        if let Some(r) = &self.credentials.app_secret {
            return Some(secret_env(env::APP_KEY, &r.secret_name, &r.key_name));
        }
        self.credentials
            .app_key
            .as_ref()
            .map(|_| secret_env(env::APP_KEY, &names::credentials_secret(&self.owner), names::APP_KEY_KEY))
    }

    fn token_env(&self) -> k8s_openapi::api::core::v1::EnvVar {
        match &self.token_ref {
            Some(r) => secret_env(env::CLUSTER_AGENT_AUTH_TOKEN, &r.secret_name, &r.key_name),
            None => secret_env(env::CLUSTER_AGENT_AUTH_TOKEN, &names::token_secret(&self.owner), names::TOKEN_KEY),
        }
    }

    fn service_account(&self, c: ComponentName) -> String {
        self.service_accounts.get(&c).cloned().unwrap_or_else(|| names::component(&self.owner, c))
    }
}

impl Capability for Defaults {
    fn id(&self) -> FeatureId {
        FeatureId::Defaults
    }

    fn requirements(&self) -> RequiredComponents {
        RequiredComponents {
            node_agent: RequiredComponent::with_containers(&[containers::AGENT]),
            cluster_agent: RequiredComponent::yes(),
            checks_runner: RequiredComponent::default(),
        }
    }

    fn manage_dependencies(&self, managers: &mut ResourceManagers, required: &RequiredComponents) -> Result<()> {
        let ns = managers.owner().namespace.clone();
        let mut errs = Vec::new();

        let mut creds = BTreeMap::new();
        if let Some(k) = self.credentials.api_key.as_ref().filter(|k| !k.is_empty()) {
            creds.insert(names::API_KEY_KEY.to_string(), k.clone());
        }
        if let Some(k) = self.credentials.app_key.as_ref().filter(|k| !k.is_empty()) {
            creds.insert(names::APP_KEY_KEY.to_string(), k.clone());
        }
        if !creds.is_empty() {
            errs.extend(managers.secret(&ns, &names::credentials_secret(&self.owner), creds).err());
        }

        if self.token_ref.is_none() {
            let data = BTreeMap::from([(names::TOKEN_KEY.to_string(), self.token.clone())]);
            errs.extend(managers.secret(&ns, &names::token_secret(&self.owner), data).err());
        }

        for c in required.enabled() {
            let name = names::component(&self.owner, c);
            errs.extend(managers.service_account(&ns, &name).err());
            errs.extend(managers.cluster_role_rules(&name, base_rules(c)).err());
            errs.extend(managers.cluster_role_binding(&name, &name, &ns, &self.service_account(c)).err());
            if self.network_policy {
                let ports: &[i32] = match c {
                    ComponentName::ClusterAgent => &[names::CLUSTER_AGENT_PORT],
                    _ => &[],
                };
                errs.extend(managers.network_policy(&ns, &name, names::selector_labels(&self.owner, c), ports).err());
            }
        }

        if required.is_enabled(ComponentName::ClusterAgent) {
            let le = leader_election_name(&self.owner);
            let sa = self.service_account(ComponentName::ClusterAgent);
            errs.extend(managers.role(&ns, &le, leader_election_rules()).err());
            errs.extend(managers.role_binding(&ns, &le, &le, &sa).err());
            errs.extend(
                managers
                    .service(
                        &ns,
                        &names::cluster_agent_service(&self.owner),
                        names::selector_labels(&self.owner, ComponentName::ClusterAgent),
                        vec![("agentport".into(), names::CLUSTER_AGENT_PORT, names::CLUSTER_AGENT_PORT)],
                    )
                    .err(),
            );
        }

        let info = format!(
            "install_method:\n  tool: agentop\n  installer_version: {}\n  install_type: {}\n",
            env!("CARGO_PKG_VERSION"),
            self.install.type_
        );
        let data = BTreeMap::from([("install_info".to_string(), info)]);
        errs.extend(managers.config_map(&ns, &names::install_info_config_map(&self.owner), data).err());

        collect(errs)
    }

    fn configure(&self, component: ComponentName, template: &mut Scope<'_>, _provider: &str) {
        if let Some(v) = self.api_key_env() {
            template.add_env_var_all(v);
        }
        if let Some(v) = self.app_key_env() {
            if component != ComponentName::NodeAgent {
                template.add_env_var_all(v);
            }
        }
        template.add_env_all(env::SITE, self.site.clone());
        if let Some(cn) = &self.cluster_name {
            template.add_env_all(env::CLUSTER_NAME, cn.clone());
        }
        template.add_env_var_all(self.token_env());

        let service = names::cluster_agent_service(&self.owner);
        match component {
            ComponentName::NodeAgent => {
                template.add_env_var_all(field_env(env::KUBELET_HOST, "status.hostIP"));
                template.add_env_all(env::CLUSTER_AGENT_ENABLED, self.cluster_agent_enabled.to_string());
                if self.cluster_agent_enabled {
                    template.add_env_all(env::CLUSTER_AGENT_SERVICE, service);
                }
            }
            ComponentName::ClusterAgent => {
                template.add_env(containers::CLUSTER_AGENT, env::LEADER_ELECTION, "true");
                template.add_env(containers::CLUSTER_AGENT, env::LEADER_LEASE_NAME, leader_election_name(&self.owner));
            }
            ComponentName::ClusterChecksRunner => {
                template.add_env(containers::CHECKS_RUNNER, env::CLUSTER_AGENT_ENABLED, "true");
                template.add_env(containers::CHECKS_RUNNER, env::CLUSTER_AGENT_SERVICE, service);
            }
        }
    }
}
