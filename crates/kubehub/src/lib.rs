//! agentop kubehub: the object-store seam between the reconciler and the cluster.
//!
//! Everything above this crate talks to [`ObjectStore`] in terms of
//! [`ObjectKey`] + [`DynamicObject`]. [`KubeStore`] backs it with the real API
//! server; [`MemStore`] keeps objects in memory for tests.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use agentop_core::{AgentDeployment, AgentProfile, Error, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Node, Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

mod mem;

pub use mem::{Fault, MemStore, Op};

/// Object kinds the operator reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    AgentDeployment,
    AgentProfile,
    Node,
    Secret,
    ConfigMap,
    ServiceAccount,
    Service,
    Role,
    RoleBinding,
    ClusterRole,
    ClusterRoleBinding,
    NetworkPolicy,
    DaemonSet,
    Deployment,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 14] = [
        ObjectKind::AgentDeployment,
        ObjectKind::AgentProfile,
        ObjectKind::Node,
        ObjectKind::Secret,
        ObjectKind::ConfigMap,
        ObjectKind::ServiceAccount,
        ObjectKind::Service,
        ObjectKind::Role,
        ObjectKind::RoleBinding,
        ObjectKind::ClusterRole,
        ObjectKind::ClusterRoleBinding,
        ObjectKind::NetworkPolicy,
        ObjectKind::DaemonSet,
        ObjectKind::Deployment,
    ];

    pub fn api_resource(&self) -> ApiResource {
        match self {
            ObjectKind::AgentDeployment => ApiResource::erase::<AgentDeployment>(&()),
            ObjectKind::AgentProfile => ApiResource::erase::<AgentProfile>(&()),
            ObjectKind::Node => ApiResource::erase::<Node>(&()),
            ObjectKind::Secret => ApiResource::erase::<Secret>(&()),
            ObjectKind::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
            ObjectKind::ServiceAccount => ApiResource::erase::<ServiceAccount>(&()),
            ObjectKind::Service => ApiResource::erase::<Service>(&()),
            ObjectKind::Role => ApiResource::erase::<Role>(&()),
            ObjectKind::RoleBinding => ApiResource::erase::<RoleBinding>(&()),
            ObjectKind::ClusterRole => ApiResource::erase::<ClusterRole>(&()),
            ObjectKind::ClusterRoleBinding => ApiResource::erase::<ClusterRoleBinding>(&()),
            ObjectKind::NetworkPolicy => ApiResource::erase::<NetworkPolicy>(&()),
            ObjectKind::DaemonSet => ApiResource::erase::<DaemonSet>(&()),
            ObjectKind::Deployment => ApiResource::erase::<Deployment>(&()),
        }
    }

    pub fn namespaced(&self) -> bool {
        !matches!(self, ObjectKind::Node | ObjectKind::ClusterRole | ObjectKind::ClusterRoleBinding)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::AgentDeployment => "AgentDeployment",
            ObjectKind::AgentProfile => "AgentProfile",
            ObjectKind::Node => "Node",
            ObjectKind::Secret => "Secret",
            ObjectKind::ConfigMap => "ConfigMap",
            ObjectKind::ServiceAccount => "ServiceAccount",
            ObjectKind::Service => "Service",
            ObjectKind::Role => "Role",
            ObjectKind::RoleBinding => "RoleBinding",
            ObjectKind::ClusterRole => "ClusterRole",
            ObjectKind::ClusterRoleBinding => "ClusterRoleBinding",
            ObjectKind::NetworkPolicy => "NetworkPolicy",
            ObjectKind::DaemonSet => "DaemonSet",
            ObjectKind::Deployment => "Deployment",
        }
    }

    /// Case-sensitive lookup by `kind` string.
    pub fn from_kind(kind: &str) -> Option<ObjectKind> {
        ObjectKind::ALL.iter().copied().find(|k| k.as_str() == kind)
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one object: (kind, namespace, name). `namespace` is `None` for cluster-scoped kinds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(kind: ObjectKind, namespace: &str, name: &str) -> Self {
        Self { kind, namespace: Some(namespace.to_string()), name: name.to_string() }
    }

    pub fn cluster(kind: ObjectKind, name: &str) -> Self {
        Self { kind, namespace: None, name: name.to_string() }
    }

    /// Key of an object as read back from a store.
    pub fn of(kind: ObjectKind, obj: &DynamicObject) -> Self {
        Self {
            kind,
            namespace: if kind.namespaced() { obj.metadata.namespace.clone() } else { None },
            name: obj.metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Equality-only label selector.
pub type Labels = BTreeMap<String, String>;

pub fn selector_string(labels: &Labels) -> String {
    labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// Generic object store. Writes carry `metadata.resourceVersion` for optimistic concurrency.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject>;

    /// List objects of `kind`; `namespace = None` lists across namespaces.
    async fn list(&self, kind: ObjectKind, namespace: Option<&str>, labels: &Labels) -> Result<Vec<DynamicObject>>;

    async fn create(&self, key: &ObjectKey, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn update(&self, key: &ObjectKey, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// Replace the status subresource only.
    async fn update_status(&self, key: &ObjectKey, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn get_opt(&self, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        match self.get(key).await {
            Ok(o) => Ok(Some(o)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject> {
    let v = serde_json::to_value(obj)?;
    Ok(serde_json::from_value(v)?)
}

pub fn from_dynamic<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K> {
    let v = serde_json::to_value(obj)?;
    Ok(serde_json::from_value(v)?)
}

/// Typed read; `Ok(None)` when the object is absent.
pub async fn get_typed<K: DeserializeOwned>(store: &dyn ObjectStore, key: &ObjectKey) -> Result<Option<K>> {
    match store.get_opt(key).await? {
        Some(o) => Ok(Some(from_dynamic(&o)?)),
        None => Ok(None),
    }
}

pub async fn list_typed<K: DeserializeOwned>(
    store: &dyn ObjectStore,
    kind: ObjectKind,
    namespace: Option<&str>,
    labels: &Labels,
) -> Result<Vec<K>> {
    store.list(kind, namespace, labels).await?.iter().map(from_dynamic).collect()
}

/// Map an API error onto the shared taxonomy.
pub fn classify(e: kube::Error) -> Error {
    match &e {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(ae.message.clone()),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            Error::AlreadyExists(ae.message.clone())
        }
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict(ae.message.clone()),
        _ => Error::Kube(e),
    }
}

/// [`ObjectStore`] over the Kubernetes API. Every call is bounded by `timeout`.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    timeout: Duration,
}

impl KubeStore {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn api(&self, kind: ObjectKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match (kind.namespaced(), namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    async fn bounded<T, F>(&self, op: &'static str, key: String, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, kube::Error>> + Send,
    {
        counter!("kube_api_calls", 1u64, "op" => op);
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => {
                debug!(op, key = %key, error = %e, "kube call failed");
                Err(classify(e))
            }
            Err(_) => {
                counter!("kube_api_timeouts", 1u64, "op" => op);
                Err(Error::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject> {
        let api = self.api(key.kind, key.namespace.as_deref());
        self.bounded("get", key.to_string(), api.get(&key.name)).await
    }

    async fn list(&self, kind: ObjectKind, namespace: Option<&str>, labels: &Labels) -> Result<Vec<DynamicObject>> {
        let api = self.api(kind, namespace);
        let lp = if labels.is_empty() { ListParams::default() } else { ListParams::default().labels(&selector_string(labels)) };
        let list = self.bounded("list", kind.to_string(), api.list(&lp)).await?;
        Ok(list.items)
    }

    async fn create(&self, key: &ObjectKey, obj: &DynamicObject) -> Result<DynamicObject> {
        let api = self.api(key.kind, key.namespace.as_deref());
        self.bounded("create", key.to_string(), api.create(&PostParams::default(), obj)).await
    }

    async fn update(&self, key: &ObjectKey, obj: &DynamicObject) -> Result<DynamicObject> {
        let api = self.api(key.kind, key.namespace.as_deref());
        self.bounded("update", key.to_string(), api.replace(&key.name, &PostParams::default(), obj)).await
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let api = self.api(key.kind, key.namespace.as_deref());
        self.bounded("delete", key.to_string(), api.delete(&key.name, &DeleteParams::default())).await?;
        Ok(())
    }

    async fn update_status(&self, key: &ObjectKey, obj: &DynamicObject) -> Result<DynamicObject> {
        let api = self.api(key.kind, key.namespace.as_deref());
        let body = serde_json::to_vec(obj)?;
        self.bounded("update_status", key.to_string(), api.replace_status(&key.name, &PostParams::default(), body))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_scoped_kinds() {
        assert!(!ObjectKind::ClusterRole.namespaced());
        assert!(!ObjectKind::Node.namespaced());
        assert!(ObjectKind::Secret.namespaced());
        assert_eq!(ObjectKind::from_kind("ClusterRoleBinding"), Some(ObjectKind::ClusterRoleBinding));
        assert_eq!(ObjectKind::from_kind("clusterrole"), None);
    }

    #[test]
    fn api_resource_matches_kind() {
        for k in ObjectKind::ALL {
            assert_eq!(k.api_resource().kind, k.as_str());
        }
        assert_eq!(ObjectKind::AgentDeployment.api_resource().group, "agentop.dev");
        assert_eq!(ObjectKind::DaemonSet.api_resource().api_version, "apps/v1");
    }

    #[test]
    fn key_ordering_groups_by_kind() {
        let a = ObjectKey::namespaced(ObjectKind::Secret, "ns", "z");
        let b = ObjectKey::namespaced(ObjectKind::ConfigMap, "ns", "a");
        assert!(a < b);
        assert_eq!(a.to_string(), "Secret ns/z");
        assert_eq!(ObjectKey::cluster(ObjectKind::ClusterRole, "r").to_string(), "ClusterRole r");
    }

    #[test]
    fn dynamic_round_trip_keeps_type_meta() {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some("x".into());
        cm.data = Some([("k".to_string(), "v".to_string())].into_iter().collect());
        let d = to_dynamic(&cm).unwrap();
        assert_eq!(d.types.as_ref().unwrap().kind, "ConfigMap");
        let back: ConfigMap = from_dynamic(&d).unwrap();
        assert_eq!(back, cm);
    }

    #[test]
    fn selector_string_joins_pairs() {
        let mut l = Labels::new();
        l.insert("a".into(), "1".into());
        l.insert("b".into(), "2".into());
        assert_eq!(selector_string(&l), "a=1,b=2");
    }
}
