//! agentop apply: the per-pass dependency store and its apply/cleanup against an object store.
//!
//! Features declare auxiliary objects into a [`DependencyStore`] keyed by
//! (kind, namespace, name). `apply` then creates or updates each entry only when
//! the semantic diff reports a change; `cleanup` deletes owned objects that are
//! no longer desired.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use agentop_core::names::{LABEL_MANAGED_BY, LABEL_PART_OF, MANAGED_BY};
use agentop_core::{names, AgentDeployment, Error, Result};
use agentop_kubehub::{from_dynamic, to_dynamic, Labels, ObjectKey, ObjectKind, ObjectStore};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;
use kube::{Resource, ResourceExt};
use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

pub mod diff;
mod managers;
pub mod overrides;

pub use diff::{diff_summary, needs_update, overlay, strip_noisy, template_hash, DiffSummary, TEMPLATE_HASH_ANNOTATION};
pub use managers::ResourceManagers;

/// Kinds the dependency store owns and cleans up. Workloads are managed separately.
pub const DEPENDENCY_KINDS: [ObjectKind; 9] = [
    ObjectKind::Secret,
    ObjectKind::ConfigMap,
    ObjectKind::ServiceAccount,
    ObjectKind::Service,
    ObjectKind::Role,
    ObjectKind::RoleBinding,
    ObjectKind::ClusterRole,
    ObjectKind::ClusterRoleBinding,
    ObjectKind::NetworkPolicy,
];

/// Folds a new write into the stored object for the same key.
pub type MergeFn = fn(existing: &DynamicObject, incoming: &DynamicObject) -> Result<DynamicObject>;

/// The AgentDeployment every dependency points back to.
#[derive(Debug, Clone)]
pub struct Owner {
    pub namespace: String,
    pub name: String,
    pub reference: Option<OwnerReference>,
}

impl Owner {
    pub fn of(instance: &AgentDeployment) -> Result<Self> {
        Ok(Self {
            namespace: agentop_core::namespace_of(instance)?,
            name: instance.name_any(),
            reference: instance.controller_owner_ref(&()),
        })
    }

    /// Labels marking an object as managed on behalf of this owner.
    pub fn labels(&self) -> Labels {
        let mut l = Labels::new();
        l.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
        l.insert(LABEL_PART_OF.to_string(), names::part_of(&self.namespace, &self.name));
        l
    }
}

struct Entry {
    object: DynamicObject,
    merge: Option<MergeFn>,
}

/// Desired auxiliary objects for one pass.
pub struct DependencyStore {
    owner: Owner,
    entries: BTreeMap<ObjectKey, Entry>,
}

impl DependencyStore {
    pub fn new(owner: Owner) -> Self {
        Self { owner, entries: BTreeMap::new() }
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    /// Key for `obj` as `kind`; namespaced kinds default to the owner namespace.
    pub fn key_for(&self, kind: ObjectKind, obj: &DynamicObject) -> Result<ObjectKey> {
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Validation(format!("{} dependency without a name", kind)))?;
        let namespace =
            if kind.namespaced() { Some(obj.metadata.namespace.clone().unwrap_or_else(|| self.owner.namespace.clone())) } else { None };
        Ok(ObjectKey { kind, namespace, name })
    }

    fn decorate(&self, key: &ObjectKey, obj: &mut DynamicObject) {
        obj.metadata.name = Some(key.name.clone());
        obj.metadata.namespace = key.namespace.clone();
        let labels = obj.metadata.labels.get_or_insert_with(Default::default);
        labels.extend(self.owner.labels());
        if let Some(hash) = template_hash(&obj.data) {
            obj.metadata.annotations.get_or_insert_with(Default::default).insert(TEMPLATE_HASH_ANNOTATION.to_string(), hash);
        }
        if key.namespace.as_deref() == Some(self.owner.namespace.as_str()) {
            if let Some(r) = &self.owner.reference {
                let refs = obj.metadata.owner_references.get_or_insert_with(Vec::new);
                if !refs.iter().any(|x| x.uid == r.uid) {
                    refs.push(r.clone());
                }
            }
        }
    }

    /// Upsert a typed object. Without a merge function the last write wins.
    pub fn add_or_update<K: Serialize>(&mut self, kind: ObjectKind, obj: &K, merge: Option<MergeFn>) -> Result<ObjectKey> {
        let d = to_dynamic(obj)?;
        self.add_or_update_dynamic(kind, d, merge)
    }

    pub fn add_or_update_dynamic(&mut self, kind: ObjectKind, mut obj: DynamicObject, merge: Option<MergeFn>) -> Result<ObjectKey> {
        let key = self.key_for(kind, &obj)?;
        self.decorate(&key, &mut obj);
        let entry = match self.entries.remove(&key) {
            Some(prev) => match merge.or(prev.merge) {
                Some(f) => match f(&prev.object, &obj) {
                    Ok(mut merged) => {
                        self.decorate(&key, &mut merged);
                        Entry { object: merged, merge: merge.or(prev.merge) }
                    }
                    Err(e) => {
                        self.entries.insert(key, prev);
                        return Err(e);
                    }
                },
                None => Entry { object: obj, merge },
            },
            None => Entry { object: obj, merge },
        };
        self.entries.insert(key.clone(), entry);
        Ok(key)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&DynamicObject> {
        self.entries.get(key).map(|e| &e.object)
    }

    pub fn get_typed<K: DeserializeOwned>(&self, key: &ObjectKey) -> Option<K> {
        self.get(key).and_then(|o| from_dynamic(o).ok())
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &ObjectKey) -> Option<DynamicObject> {
        self.entries.remove(key).map(|e| e.object)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ObjectKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrite a stored entry in place. Ownership labels are restored afterwards.
    pub fn patch<F>(&mut self, key: &ObjectKey, f: F) -> Result<()>
    where
        F: FnOnce(&mut DynamicObject) -> Result<()>,
    {
        let mut entry = self.entries.remove(key).ok_or_else(|| Error::NotFound(format!("no dependency {}", key)))?;
        let res = f(&mut entry.object);
        self.decorate(key, &mut entry.object);
        self.entries.insert(key.clone(), entry);
        res
    }

    /// Create missing entries and update drifted ones. One failure never blocks the rest.
    pub async fn apply(&self, client: &dyn ObjectStore) -> Vec<Error> {
        let mut errs = Vec::new();
        for (key, entry) in &self.entries {
            if let Err(e) = apply_one(client, key, &entry.object).await {
                warn!(key = %key, error = %e, "dependency apply failed");
                counter!("dependency_errors", 1u64, "kind" => key.kind.as_str());
                errs.push(e);
            }
        }
        errs
    }

    /// Delete owned objects of every dependency kind that this pass did not declare.
    pub async fn cleanup(&self, client: &dyn ObjectStore) -> Vec<Error> {
        self.cleanup_kinds(client, &DEPENDENCY_KINDS).await
    }

    pub async fn cleanup_kinds(&self, client: &dyn ObjectStore, kinds: &[ObjectKind]) -> Vec<Error> {
        let selector = self.owner.labels();
        let mut errs = Vec::new();
        for kind in kinds {
            let live = match client.list(*kind, None, &selector).await {
                Ok(v) => v,
                Err(e) => {
                    errs.push(e);
                    continue;
                }
            };
            for obj in live {
                let key = ObjectKey::of(*kind, &obj);
                if self.entries.contains_key(&key) {
                    continue;
                }
                match client.delete(&key).await {
                    Ok(()) => {
                        counter!("dependency_deletes", 1u64, "kind" => kind.as_str());
                        info!(key = %key, "deleted stale dependency");
                    }
                    Err(e) if e.is_not_found() => debug!(key = %key, "stale dependency already gone"),
                    Err(e) => errs.push(e),
                }
            }
        }
        errs
    }
}

async fn apply_one(client: &dyn ObjectStore, key: &ObjectKey, desired: &DynamicObject) -> Result<()> {
    match client.get_opt(key).await? {
        None => {
            client.create(key, desired).await?;
            counter!("dependency_creates", 1u64, "kind" => key.kind.as_str());
            info!(key = %key, "created dependency");
        }
        Some(observed) => {
            let d = serde_json::to_value(desired)?;
            let o = serde_json::to_value(&observed)?;
            if !needs_update(&d, &o) {
                return Ok(());
            }
            let summary = diff_summary(&strip_noisy(d.clone()), &strip_noisy(o.clone()));
            let mut body: DynamicObject = serde_json::from_value(overlay(&o, &d))?;
            body.metadata.resource_version = observed.metadata.resource_version.clone();
            client.update(key, &body).await?;
            counter!("dependency_updates", 1u64, "kind" => key.kind.as_str());
            info!(key = %key, adds = summary.adds, updates = summary.updates, removes = summary.removes, "updated dependency");
        }
    }
    Ok(())
}

/// Merge a JSON body into a dynamic object, keeping its type meta.
pub(crate) fn json_to_dynamic(v: Json) -> Result<DynamicObject> {
    Ok(serde_json::from_value(v)?)
}
