//! In-memory [`ObjectStore`] with resourceVersion checks, write counters and fault injection.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use agentop_core::{Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::DynamicObject;
use serde::{de::DeserializeOwned, Serialize};

use crate::{from_dynamic, to_dynamic, Labels, ObjectKey, ObjectKind, ObjectStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    List,
    Create,
    Update,
    Delete,
    UpdateStatus,
}

/// Error to return from an injected fault.
#[derive(Debug, Clone)]
pub enum Fault {
    Conflict,
    NotFound,
    Internal(String),
}

impl Fault {
    fn to_error(&self, key: &str) -> Error {
        match self {
            Fault::Conflict => Error::Conflict(format!("injected conflict on {}", key)),
            Fault::NotFound => Error::NotFound(key.to_string()),
            Fault::Internal(msg) => Error::Internal(format!("{}: {}", key, msg)),
        }
    }
}

struct Injected {
    op: Op,
    kind: ObjectKind,
    fault: Fault,
    remaining: usize,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    next_rv: u64,
    faults: Vec<Injected>,
    writes: Vec<(Op, ObjectKey)>,
}

impl Inner {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn check_fault(&mut self, op: Op, kind: ObjectKind, key: &str) -> Result<()> {
        if let Some(f) = self.faults.iter_mut().find(|f| f.op == op && f.kind == kind && f.remaining > 0) {
            f.remaining -= 1;
            return Err(f.fault.to_error(key));
        }
        Ok(())
    }
}

/// Objects live in a `BTreeMap`; every write is recorded for assertions.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

fn status_of(obj: &DynamicObject) -> Option<serde_json::Value> {
    obj.data.get("status").cloned()
}

fn set_status(obj: &mut DynamicObject, status: Option<serde_json::Value>) {
    if let Some(map) = obj.data.as_object_mut() {
        match status {
            Some(s) => {
                map.insert("status".into(), s);
            }
            None => {
                map.remove("status");
            }
        }
    }
}

fn labels_match(obj: &DynamicObject, labels: &Labels) -> bool {
    let have = obj.metadata.labels.as_ref();
    labels.iter().all(|(k, v)| have.and_then(|l| l.get(k)) == Some(v))
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace an object without recording a write.
    pub fn seed<K: Serialize>(&self, kind: ObjectKind, obj: &K) -> Result<()> {
        let mut d = to_dynamic(obj)?;
        let mut inner = self.lock();
        let key = ObjectKey::of(kind, &d);
        d.metadata.resource_version = Some(inner.bump());
        if d.metadata.uid.is_none() {
            d.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        inner.objects.insert(key, d);
        Ok(())
    }

    pub fn typed<K: DeserializeOwned>(&self, key: &ObjectKey) -> Option<K> {
        self.lock().objects.get(key).and_then(|o| from_dynamic(o).ok())
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.lock().objects.contains_key(key)
    }

    pub fn keys(&self, kind: ObjectKind) -> Vec<ObjectKey> {
        self.lock().objects.keys().filter(|k| k.kind == kind).cloned().collect()
    }

    /// Fail the next `times` calls of `op` on objects of `kind`.
    pub fn inject(&self, op: Op, kind: ObjectKind, fault: Fault, times: usize) {
        self.lock().faults.push(Injected { op, kind, fault, remaining: times });
    }

    /// Every successful write in call order.
    pub fn writes(&self) -> Vec<(Op, ObjectKey)> {
        self.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    pub fn count(&self, op: Op) -> usize {
        self.lock().writes.iter().filter(|(o, _)| *o == op).count()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemStore {
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject> {
        let mut inner = self.lock();
        inner.check_fault(Op::Get, key.kind, &key.to_string())?;
        inner.objects.get(key).cloned().ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn list(&self, kind: ObjectKind, namespace: Option<&str>, labels: &Labels) -> Result<Vec<DynamicObject>> {
        let mut inner = self.lock();
        inner.check_fault(Op::List, kind, kind.as_str())?;
        Ok(inner
            .objects
            .iter()
            .filter(|(k, _)| k.kind == kind)
            .filter(|(k, _)| namespace.is_none() || k.namespace.as_deref() == namespace)
            .filter(|(_, o)| labels_match(o, labels))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, key: &ObjectKey, obj: &DynamicObject) -> Result<DynamicObject> {
        let mut inner = self.lock();
        inner.check_fault(Op::Create, key.kind, &key.to_string())?;
        if inner.objects.contains_key(key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        let mut stored = obj.clone();
        stored.metadata.resource_version = Some(inner.bump());
        stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        stored.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        set_status(&mut stored, None);
        inner.objects.insert(key.clone(), stored.clone());
        inner.writes.push((Op::Create, key.clone()));
        Ok(stored)
    }

    async fn update(&self, key: &ObjectKey, obj: &DynamicObject) -> Result<DynamicObject> {
        let mut inner = self.lock();
        inner.check_fault(Op::Update, key.kind, &key.to_string())?;
        let current = inner.objects.get(key).cloned().ok_or_else(|| Error::NotFound(key.to_string()))?;
        if let Some(rv) = &obj.metadata.resource_version {
            if current.metadata.resource_version.as_ref() != Some(rv) {
                return Err(Error::Conflict(format!("{}: resourceVersion {} is stale", key, rv)));
            }
        }
        let mut stored = obj.clone();
        stored.metadata.uid = current.metadata.uid.clone();
        stored.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        stored.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
        set_status(&mut stored, status_of(&current));
        stored.metadata.resource_version = Some(inner.bump());
        inner.writes.push((Op::Update, key.clone()));
        let released = stored.metadata.deletion_timestamp.is_some()
            && stored.metadata.finalizers.as_ref().map(|f| f.is_empty()).unwrap_or(true);
        if released {
            inner.objects.remove(key);
        } else {
            inner.objects.insert(key.clone(), stored.clone());
        }
        Ok(stored)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut inner = self.lock();
        inner.check_fault(Op::Delete, key.kind, &key.to_string())?;
        let has_finalizers = match inner.objects.get(key) {
            None => return Err(Error::NotFound(key.to_string())),
            Some(o) => o.metadata.finalizers.as_ref().map(|f| !f.is_empty()).unwrap_or(false),
        };
        if has_finalizers {
            let rv = inner.bump();
            if let Some(o) = inner.objects.get_mut(key) {
                if o.metadata.deletion_timestamp.is_none() {
                    o.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                }
                o.metadata.resource_version = Some(rv);
            }
        } else {
            inner.objects.remove(key);
        }
        inner.writes.push((Op::Delete, key.clone()));
        Ok(())
    }

    async fn update_status(&self, key: &ObjectKey, obj: &DynamicObject) -> Result<DynamicObject> {
        let mut inner = self.lock();
        inner.check_fault(Op::UpdateStatus, key.kind, &key.to_string())?;
        let mut current = inner.objects.get(key).cloned().ok_or_else(|| Error::NotFound(key.to_string()))?;
        if let Some(rv) = &obj.metadata.resource_version {
            if current.metadata.resource_version.as_ref() != Some(rv) {
                return Err(Error::Conflict(format!("{}: resourceVersion {} is stale", key, rv)));
            }
        }
        set_status(&mut current, status_of(obj));
        current.metadata.resource_version = Some(inner.bump());
        inner.objects.insert(key.clone(), current.clone());
        inner.writes.push((Op::UpdateStatus, key.clone()));
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    fn cm(name: &str, label: Option<(&str, &str)>) -> DynamicObject {
        let mut c = ConfigMap::default();
        c.metadata.name = Some(name.into());
        c.metadata.namespace = Some("ns".into());
        if let Some((k, v)) = label {
            c.metadata.labels = Some([(k.to_string(), v.to_string())].into_iter().collect());
        }
        to_dynamic(&c).unwrap()
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::namespaced(ObjectKind::ConfigMap, "ns", name)
    }

    #[tokio::test]
    async fn create_get_and_duplicate_create() {
        let s = MemStore::new();
        let created = s.create(&key("a"), &cm("a", None)).await.unwrap();
        assert!(created.metadata.resource_version.is_some());
        assert!(s.get(&key("a")).await.is_ok());
        let err = s.create(&key("a"), &cm("a", None)).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert!(s.get(&key("b")).await.unwrap_err().is_not_found());
        assert!(s.get_opt(&key("b")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let s = MemStore::new();
        let first = s.create(&key("a"), &cm("a", None)).await.unwrap();
        let second = s.update(&key("a"), &first).await.unwrap();
        assert_ne!(first.metadata.resource_version, second.metadata.resource_version);
        let err = s.update(&key("a"), &first).await.unwrap_err();
        assert!(err.is_conflict());
        let err = s.update_status(&key("a"), &first).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn update_keeps_status_and_update_status_keeps_spec() {
        let s = MemStore::new();
        let mut obj = s.create(&key("a"), &cm("a", None)).await.unwrap();
        obj.data["status"] = serde_json::json!({"ok": true});
        obj.data["data"] = serde_json::json!({"k": "ignored"});
        let after = s.update_status(&key("a"), &obj).await.unwrap();
        assert_eq!(after.data["status"], serde_json::json!({"ok": true}));
        assert!(after.data.get("data").is_none());

        let mut upd = after.clone();
        upd.data["data"] = serde_json::json!({"k": "v"});
        set_status(&mut upd, None);
        let after = s.update(&key("a"), &upd).await.unwrap();
        assert_eq!(after.data["status"], serde_json::json!({"ok": true}));
        assert_eq!(after.data["data"], serde_json::json!({"k": "v"}));
    }

    #[tokio::test]
    async fn list_filters_by_labels_and_namespace() {
        let s = MemStore::new();
        s.create(&key("a"), &cm("a", Some(("team", "x")))).await.unwrap();
        s.create(&key("b"), &cm("b", Some(("team", "y")))).await.unwrap();
        let mut sel = Labels::new();
        sel.insert("team".into(), "x".into());
        let got = s.list(ObjectKind::ConfigMap, Some("ns"), &sel).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].metadata.name.as_deref(), Some("a"));
        assert!(s.list(ObjectKind::ConfigMap, Some("other"), &Labels::new()).await.unwrap().is_empty());
        assert_eq!(s.list(ObjectKind::ConfigMap, None, &Labels::new()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_with_finalizer_marks_then_release_removes() {
        let s = MemStore::new();
        let mut obj = cm("a", None);
        obj.metadata.finalizers = Some(vec!["x/y".into()]);
        s.create(&key("a"), &obj).await.unwrap();
        s.delete(&key("a")).await.unwrap();
        let marked = s.get(&key("a")).await.unwrap();
        assert!(marked.metadata.deletion_timestamp.is_some());

        let mut released = marked.clone();
        released.metadata.finalizers = Some(vec![]);
        s.update(&key("a"), &released).await.unwrap();
        assert!(!s.contains(&key("a")));
        assert!(s.delete(&key("a")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn injected_faults_fire_then_expire() {
        let s = MemStore::new();
        s.inject(Op::Create, ObjectKind::ConfigMap, Fault::Internal("boom".into()), 1);
        let err = s.create(&key("a"), &cm("a", None)).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        s.create(&key("a"), &cm("a", None)).await.unwrap();
        assert_eq!(s.count(Op::Create), 1);
        assert_eq!(s.writes(), vec![(Op::Create, key("a"))]);
    }
}
