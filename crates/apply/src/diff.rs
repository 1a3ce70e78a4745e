//! Semantic comparison of a desired object against what the server returned.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};

/// Top-level fields compared for exact equality rather than containment.
pub const EXACT_FIELDS: &[&str] = &["data", "stringData", "binaryData", "rules", "subjects", "roleRef"];

/// Nested fields replaced wholesale on update. Their changes are detected through
/// [`TEMPLATE_HASH_ANNOTATION`] since the server defaults fields inside them.
pub const REPLACED_PATHS: &[(&str, &str)] = &[("spec", "template")];

/// Digest of the desired pod template, stamped on workloads.
pub const TEMPLATE_HASH_ANNOTATION: &str = "agentop.dev/template-hash";

const SKIPPED_FIELDS: &[&str] = &["apiVersion", "kind", "metadata", "status"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// Drop server-populated fields so two renderings can be compared.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for k in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            meta.remove(k);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Count key-level differences between `target` and `base`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                let min = aa.len().min(bb.len());
                s.updates += (0..min).filter(|i| aa[*i] != bb[*i]).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

/// True when every field set in `desired` is present with the same value in `observed`.
/// Arrays must have equal length and match element-wise.
pub fn contained(desired: &Json, observed: &Json) -> bool {
    match (desired, observed) {
        (Json::Null, _) => true,
        (Json::Object(d), Json::Object(o)) => d.iter().all(|(k, dv)| match o.get(k) {
            Some(ov) => contained(dv, ov),
            None => is_empty(dv),
        }),
        (Json::Object(d), Json::Null) => d.values().all(is_empty),
        (Json::Array(d), Json::Array(o)) => d.len() == o.len() && d.iter().zip(o).all(|(a, b)| contained(a, b)),
        (Json::Array(d), Json::Null) => d.is_empty(),
        (d, o) => d == o,
    }
}

fn is_empty(v: &Json) -> bool {
    match v {
        Json::Null => true,
        Json::Object(m) => m.values().all(is_empty),
        Json::Array(a) => a.is_empty(),
        _ => false,
    }
}

/// Hex SHA-256 of `spec.template`; `None` when the body has no pod template.
pub fn template_hash(body: &Json) -> Option<String> {
    let template = body.get("spec")?.get("template")?;
    let bytes = serde_json::to_vec(template).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Some(format!("{:x}", hasher.finalize()))
}

fn map_contained(desired: Option<&Json>, observed: Option<&Json>) -> bool {
    contained(desired.unwrap_or(&Json::Null), observed.unwrap_or(&Json::Null))
}

/// Decide whether `observed` must be rewritten to match `desired`.
///
/// Labels, annotations and owner references from `desired` must be present in
/// `observed`; body fields are compared by containment except [`EXACT_FIELDS`].
pub fn needs_update(desired: &Json, observed: &Json) -> bool {
    let dm = desired.get("metadata");
    let om = observed.get("metadata");
    for field in ["labels", "annotations", "ownerReferences"] {
        if !map_contained(dm.and_then(|m| m.get(field)), om.and_then(|m| m.get(field))) {
            return true;
        }
    }
    let Some(body) = desired.as_object() else { return true };
    body.iter().filter(|(k, _)| !SKIPPED_FIELDS.contains(&k.as_str())).any(|(k, dv)| {
        let ov = observed.get(k).unwrap_or(&Json::Null);
        if EXACT_FIELDS.contains(&k.as_str()) {
            !(dv == ov || (is_empty(dv) && is_empty(ov)))
        } else {
            !contained(dv, ov)
        }
    })
}

/// Lay `desired` over `observed`: objects merge recursively, arrays, scalars,
/// [`EXACT_FIELDS`] and [`REPLACED_PATHS`] replace. Server-populated fields of
/// `observed` survive outside those.
pub fn overlay(observed: &Json, desired: &Json) -> Json {
    fn merge(base: &mut Json, top: &Json) {
        match (base, top) {
            (Json::Object(b), Json::Object(t)) => {
                for (k, tv) in t {
                    match b.get_mut(k) {
                        Some(bv) if tv.is_object() => merge(bv, tv),
                        _ => {
                            b.insert(k.clone(), tv.clone());
                        }
                    }
                }
            }
            (b, t) => *b = t.clone(),
        }
    }
    let mut out = observed.clone();
    let (Some(o), Some(d)) = (out.as_object_mut(), desired.as_object()) else { return desired.clone() };
    for (k, dv) in d {
        if k == "status" {
            continue;
        }
        if k == "metadata" {
            let meta = o.entry("metadata").or_insert_with(|| Json::Object(Default::default()));
            for field in ["labels", "annotations"] {
                if let Some(v) = dv.get(field) {
                    let slot = meta
                        .as_object_mut()
                        .map(|m| m.entry(field).or_insert_with(|| Json::Object(Default::default())));
                    if let Some(slot) = slot {
                        merge(slot, v);
                    }
                }
            }
            if let (Some(refs), Some(m)) = (dv.get("ownerReferences"), meta.as_object_mut()) {
                m.insert("ownerReferences".into(), refs.clone());
            }
            continue;
        }
        if EXACT_FIELDS.contains(&k.as_str()) {
            o.insert(k.clone(), dv.clone());
            continue;
        }
        match o.get_mut(k) {
            Some(ov) => merge(ov, dv),
            None => {
                o.insert(k.clone(), dv.clone());
            }
        }
        for (outer, inner) in REPLACED_PATHS.iter().filter(|(outer, _)| *outer == k.as_str()) {
            if let (Some(fresh), Some(slot)) = (dv.get(*inner), o.get_mut(*outer).and_then(Json::as_object_mut)) {
                slot.insert(inner.to_string(), fresh.clone());
            }
        }
    }
    out
}
