use std::collections::BTreeMap;

use agentop_core::Result;
use agentop_kubehub::{ObjectKey, ObjectKind};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::core::DynamicObject;

use crate::{DependencyStore, Owner};

fn meta(namespace: Option<&str>, name: &str) -> ObjectMeta {
    ObjectMeta { name: Some(name.to_string()), namespace: namespace.map(str::to_string), ..Default::default() }
}

/// Appends incoming rules that are not already present.
fn merge_rules(existing: &DynamicObject, incoming: &DynamicObject) -> Result<DynamicObject> {
    let mut out = existing.clone();
    let mut rules: Vec<PolicyRule> = match existing.data.get("rules") {
        Some(v) => serde_json::from_value(v.clone())?,
        None => Vec::new(),
    };
    if let Some(v) = incoming.data.get("rules") {
        let extra: Vec<PolicyRule> = serde_json::from_value(v.clone())?;
        for r in extra {
            if !rules.contains(&r) {
                rules.push(r);
            }
        }
    }
    if let Some(map) = out.data.as_object_mut() {
        map.insert("rules".into(), serde_json::to_value(&rules)?);
    }
    Ok(out)
}

/// Typed helpers features use to declare dependencies.
pub struct ResourceManagers {
    store: DependencyStore,
}

impl ResourceManagers {
    pub fn new(owner: Owner) -> Self {
        Self { store: DependencyStore::new(owner) }
    }

    pub fn store(&self) -> &DependencyStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut DependencyStore {
        &mut self.store
    }

    pub fn into_store(self) -> DependencyStore {
        self.store
    }

    pub fn owner(&self) -> &Owner {
        self.store.owner()
    }

    pub fn secret(&mut self, namespace: &str, name: &str, data: BTreeMap<String, String>) -> Result<ObjectKey> {
        let secret = Secret {
            metadata: meta(Some(namespace), name),
            data: Some(data.into_iter().map(|(k, v)| (k, ByteString(v.into_bytes()))).collect()),
            type_: Some("Opaque".into()),
            ..Default::default()
        };
        self.store.add_or_update(ObjectKind::Secret, &secret, None)
    }

    pub fn config_map(&mut self, namespace: &str, name: &str, data: BTreeMap<String, String>) -> Result<ObjectKey> {
        let cm = ConfigMap { metadata: meta(Some(namespace), name), data: Some(data), ..Default::default() };
        self.store.add_or_update(ObjectKind::ConfigMap, &cm, None)
    }

    pub fn service_account(&mut self, namespace: &str, name: &str) -> Result<ObjectKey> {
        let sa = ServiceAccount { metadata: meta(Some(namespace), name), ..Default::default() };
        self.store.add_or_update(ObjectKind::ServiceAccount, &sa, None)
    }

    /// Cluster roles fold: every caller's rules end up in one object.
    pub fn cluster_role_rules(&mut self, name: &str, rules: Vec<PolicyRule>) -> Result<ObjectKey> {
        let role = ClusterRole { metadata: meta(None, name), rules: Some(rules), ..Default::default() };
        self.store.add_or_update(ObjectKind::ClusterRole, &role, Some(merge_rules))
    }

    pub fn cluster_role_binding(&mut self, name: &str, role: &str, sa_namespace: &str, sa_name: &str) -> Result<ObjectKey> {
        let binding = ClusterRoleBinding {
            metadata: meta(None, name),
            role_ref: role_ref("ClusterRole", role),
            subjects: Some(vec![sa_subject(sa_namespace, sa_name)]),
        };
        self.store.add_or_update(ObjectKind::ClusterRoleBinding, &binding, None)
    }

    pub fn role(&mut self, namespace: &str, name: &str, rules: Vec<PolicyRule>) -> Result<ObjectKey> {
        let role = Role { metadata: meta(Some(namespace), name), rules: Some(rules) };
        self.store.add_or_update(ObjectKind::Role, &role, Some(merge_rules))
    }

    pub fn role_binding(&mut self, namespace: &str, name: &str, role: &str, sa_name: &str) -> Result<ObjectKey> {
        let binding = RoleBinding {
            metadata: meta(Some(namespace), name),
            role_ref: role_ref("Role", role),
            subjects: Some(vec![sa_subject(namespace, sa_name)]),
        };
        self.store.add_or_update(ObjectKind::RoleBinding, &binding, None)
    }

    pub fn service(
        &mut self,
        namespace: &str,
        name: &str,
        selector: BTreeMap<String, String>,
        ports: Vec<(String, i32, i32)>,
    ) -> Result<ObjectKey> {
        let svc = Service {
            metadata: meta(Some(namespace), name),
            spec: Some(ServiceSpec {
                selector: Some(selector),
                ports: Some(
                    ports
                        .into_iter()
                        .map(|(n, port, target)| ServicePort {
                            name: Some(n),
                            port,
                            target_port: Some(IntOrString::Int(target)),
                            protocol: Some("TCP".into()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.store.add_or_update(ObjectKind::Service, &svc, None)
    }

    /// Ingress limited to `ports` on pods carrying `pod_labels`; egress left open.
    pub fn network_policy(
        &mut self,
        namespace: &str,
        name: &str,
        pod_labels: BTreeMap<String, String>,
        ingress_ports: &[i32],
    ) -> Result<ObjectKey> {
        let ingress = if ingress_ports.is_empty() {
            vec![]
        } else {
            vec![NetworkPolicyIngressRule {
                ports: Some(
                    ingress_ports
                        .iter()
                        .map(|p| NetworkPolicyPort {
                            port: Some(IntOrString::Int(*p)),
                            protocol: Some("TCP".into()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }]
        };
        let np = NetworkPolicy {
            metadata: meta(Some(namespace), name),
            spec: Some(NetworkPolicySpec {
                pod_selector: LabelSelector { match_labels: Some(pod_labels), ..Default::default() },
                policy_types: Some(vec!["Ingress".into()]),
                ingress: Some(ingress),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.store.add_or_update(ObjectKind::NetworkPolicy, &np, None)
    }
}

fn role_ref(kind: &str, name: &str) -> RoleRef {
    RoleRef { api_group: "rbac.authorization.k8s.io".into(), kind: kind.into(), name: name.into() }
}

fn sa_subject(namespace: &str, name: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".into(),
        name: name.into(),
        namespace: Some(namespace.into()),
        api_group: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(resource: &str) -> PolicyRule {
        PolicyRule {
            api_groups: Some(vec!["".into()]),
            resources: Some(vec![resource.into()]),
            verbs: vec!["get".into(), "list".into()],
            ..Default::default()
        }
    }

    fn managers() -> ResourceManagers {
        ResourceManagers::new(Owner { namespace: "ns".into(), name: "agent".into(), reference: None })
    }

    #[test]
    fn cluster_role_rules_fold_and_dedup() {
        let mut m = managers();
        m.cluster_role_rules("agent-cluster-agent", vec![rule("pods")]).unwrap();
        m.cluster_role_rules("agent-cluster-agent", vec![rule("nodes"), rule("pods")]).unwrap();
        let key = m.cluster_role_rules("agent-cluster-agent", vec![rule("services")]).unwrap();
        let role: ClusterRole = m.store().get_typed(&key).unwrap();
        let resources: Vec<String> = role.rules.unwrap().into_iter().flat_map(|r| r.resources.unwrap()).collect();
        assert_eq!(resources, vec!["pods", "nodes", "services"]);
        assert_eq!(key.namespace, None);
    }

    #[test]
    fn secret_data_is_bytes() {
        let mut m = managers();
        let data = [("token".to_string(), "abc".to_string())].into_iter().collect();
        let key = m.secret("ns", "agent-token", data).unwrap();
        let s: Secret = m.store().get_typed(&key).unwrap();
        assert_eq!(s.data.unwrap().get("token").unwrap().0, b"abc".to_vec());
    }

    #[test]
    fn role_binding_targets_service_account_in_namespace() {
        let mut m = managers();
        let key = m.role_binding("ns", "agent-leader", "agent-leader", "agent-cluster-agent").unwrap();
        let b: RoleBinding = m.store().get_typed(&key).unwrap();
        let subj = &b.subjects.unwrap()[0];
        assert_eq!(subj.namespace.as_deref(), Some("ns"));
        assert_eq!(b.role_ref.kind, "Role");
    }
}
