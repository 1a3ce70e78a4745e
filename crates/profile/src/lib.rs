//! agentop profile resolver.
//!
//! Profiles are processed oldest first. Each valid profile either claims every
//! node its selector matches or, when any of those nodes is already claimed,
//! claims nothing and is marked conflicting. Nodes left unclaimed run the
//! implicit `default` profile.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use agentop_core::condition::{self, ConditionStatus, PROFILE_APPLIED, PROFILE_VALID};
use agentop_core::crd::{AgentProfileStatus, ComponentName};
use agentop_core::{AgentProfile, Error, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, NodeSelectorRequirement};
use kube::ResourceExt;
use metrics::counter;
use tracing::{debug, info, warn};

pub const DEFAULT_PROFILE: &str = "default";

/// Identity of an applied profile; the default profile has an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProfileRef {
    pub namespace: String,
    pub name: String,
}

impl ProfileRef {
    pub fn of(profile: &AgentProfile) -> Self {
        Self { namespace: profile.namespace().unwrap_or_default(), name: profile.name_any() }
    }

    pub fn default_profile() -> Self {
        Self { namespace: String::new(), name: DEFAULT_PROFILE.to_string() }
    }

    pub fn is_default(&self) -> bool {
        self.namespace.is_empty() && self.name == DEFAULT_PROFILE
    }

    /// Value of the profile label on node-agent pods.
    pub fn label_value(&self) -> String {
        if self.is_default() {
            DEFAULT_PROFILE.to_string()
        } else {
            format!("{}-{}", self.namespace, self.name)
        }
    }
}

impl std::fmt::Display for ProfileRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_default() {
            f.write_str(DEFAULT_PROFILE)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Ascending creation time, then name, then namespace. Profiles without a
/// creation time sort last.
pub fn sort_profiles(profiles: &mut [AgentProfile]) {
    profiles.sort_by(|a, b| {
        let ka = (a.creation_timestamp().is_none(), a.creation_timestamp().map(|t| t.0), a.name_any(), a.namespace());
        let kb = (b.creation_timestamp().is_none(), b.creation_timestamp().map(|t| t.0), b.name_any(), b.namespace());
        ka.cmp(&kb)
    });
}

const OPERATORS: [&str; 6] = ["In", "NotIn", "Exists", "DoesNotExist", "Gt", "Lt"];

fn validate_requirement(r: &NodeSelectorRequirement) -> Result<()> {
    let values = r.values.as_deref().unwrap_or(&[]);
    if r.key.is_empty() {
        return Err(Error::Validation("selector requirement without key".into()));
    }
    match r.operator.as_str() {
        "In" | "NotIn" if values.is_empty() => {
            Err(Error::Validation(format!("{} on {} needs at least one value", r.operator, r.key)))
        }
        "Exists" | "DoesNotExist" if !values.is_empty() => {
            Err(Error::Validation(format!("{} on {} takes no values", r.operator, r.key)))
        }
        "Gt" | "Lt" if values.len() != 1 || values[0].parse::<i64>().is_err() => {
            Err(Error::Validation(format!("{} on {} needs one integer value", r.operator, r.key)))
        }
        op if !OPERATORS.contains(&op) => Err(Error::Validation(format!("unknown operator {}", op))),
        _ => Ok(()),
    }
}

/// Reject profiles that could not be applied safely.
pub fn validate(profile: &AgentProfile) -> Result<()> {
    let reqs = profile.node_requirements();
    if reqs.is_empty() {
        return Err(Error::Validation("profileNodeAffinity is empty".into()));
    }
    for r in reqs {
        validate_requirement(r)?;
    }
    if let Some(cfg) = &profile.spec.config {
        if let Some(c) = cfg.overrides.keys().find(|c| **c != ComponentName::NodeAgent) {
            return Err(Error::Validation(format!("override of {} is not supported in profiles", c)));
        }
    }
    Ok(())
}

fn requirement_matches(r: &NodeSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let values = r.values.as_deref().unwrap_or(&[]);
    let label = labels.get(&r.key);
    match r.operator.as_str() {
        "In" => label.map(|v| values.contains(v)).unwrap_or(false),
        "NotIn" => label.map(|v| !values.contains(v)).unwrap_or(true),
        "Exists" => label.is_some(),
        "DoesNotExist" => label.is_none(),
        "Gt" | "Lt" => {
            let (Some(l), Some(want)) = (label.and_then(|v| v.parse::<i64>().ok()), values.first().and_then(|v| v.parse::<i64>().ok()))
            else {
                return false;
            };
            if r.operator == "Gt" { l > want } else { l < want }
        }
        _ => false,
    }
}

/// Every requirement holds for `node`'s labels.
pub fn matches_node(reqs: &[NodeSelectorRequirement], node: &Node) -> bool {
    let empty = BTreeMap::new();
    let labels = node.metadata.labels.as_ref().unwrap_or(&empty);
    reqs.iter().all(|r| requirement_matches(r, labels))
}

fn set_status(profile: &mut AgentProfile, now: DateTime<Utc>, valid: (bool, &str, &str), applied: Option<(bool, &str, &str)>, covered: Vec<String>) {
    let st = profile.status.get_or_insert_with(AgentProfileStatus::default);
    st.valid = Some(ConditionStatus::from_bool(valid.0).to_string());
    condition::upsert(&mut st.conditions, now, PROFILE_VALID, ConditionStatus::from_bool(valid.0), valid.1, valid.2);
    match applied {
        Some((ok, reason, msg)) => {
            st.applied = Some(ConditionStatus::from_bool(ok).to_string());
            condition::upsert(&mut st.conditions, now, PROFILE_APPLIED, ConditionStatus::from_bool(ok), reason, msg);
        }
        None => {
            st.applied = Some(ConditionStatus::Unknown.to_string());
            condition::upsert(&mut st.conditions, now, PROFILE_APPLIED, ConditionStatus::Unknown, "Invalid", "profile is not valid");
        }
    }
    st.covered_nodes = covered;
}

/// How one profile fared in a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Claimed these nodes (possibly none).
    Applied(Vec<String>),
    /// A selected node already belonged to an older profile.
    Conflicting(Vec<String>),
    Invalid(String),
}

/// Validate `profile` and try to claim its nodes. Its in-memory status is updated either way.
pub fn profile_to_apply(
    profile: &mut AgentProfile,
    nodes: &[Node],
    assigned: &mut BTreeMap<String, ProfileRef>,
    now: DateTime<Utc>,
) -> Outcome {
    let me = ProfileRef::of(profile);
    if let Err(e) = validate(profile) {
        warn!(profile = %me, error = %e, "invalid profile");
        counter!("profile_invalid", 1u64);
        set_status(profile, now, (false, "Invalid", &e.to_string()), None, Vec::new());
        return Outcome::Invalid(e.to_string());
    }

    let matched: Vec<String> = nodes
        .iter()
        .filter(|n| matches_node(profile.node_requirements(), n))
        .map(|n| n.name_any())
        .collect();
    let contested: Vec<String> = matched.iter().filter(|n| assigned.contains_key(*n)).cloned().collect();
    if !contested.is_empty() {
        info!(profile = %me, nodes = ?contested, "profile conflicts with an older profile");
        counter!("profile_conflicts", 1u64);
        let msg = format!("nodes already covered by another profile: {}", contested.join(","));
        set_status(profile, now, (true, "Valid", "profile is valid"), Some((false, "Conflict", &msg)), Vec::new());
        return Outcome::Conflicting(contested);
    }

    for n in &matched {
        assigned.insert(n.clone(), me.clone());
    }
    debug!(profile = %me, nodes = matched.len(), "profile applied");
    let msg = format!("profile applied to {} node(s)", matched.len());
    set_status(profile, now, (true, "Valid", "profile is valid"), Some((true, "Applied", &msg)), matched.clone());
    Outcome::Applied(matched)
}

/// Give every unclaimed node to the default profile.
pub fn apply_default_profile(nodes: &[Node], assigned: &mut BTreeMap<String, ProfileRef>) -> Vec<String> {
    let default = ProfileRef::default_profile();
    let mut covered = Vec::new();
    for n in nodes {
        let name = n.name_any();
        if !assigned.contains_key(&name) {
            assigned.insert(name.clone(), default.clone());
            covered.push(name);
        }
    }
    covered
}

/// One profile after a pass.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub profile: AgentProfile,
    pub outcome: Outcome,
    /// Status differs from the one read at the start of the pass.
    pub status_changed: bool,
}

/// Result of resolving all profiles against the current nodes.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Profiles to run node agents for, in precedence order; the default profile is last.
    pub applied: Vec<ProfileRef>,
    pub by_node: BTreeMap<String, ProfileRef>,
    pub profiles: Vec<Resolved>,
}

impl Resolution {
    pub fn profile(&self, r: &ProfileRef) -> Option<&AgentProfile> {
        self.profiles.iter().map(|p| &p.profile).find(|p| ProfileRef::of(p) == *r)
    }

    /// Nodes claimed by a non-default profile.
    pub fn claimed_nodes(&self) -> BTreeSet<String> {
        self.by_node.iter().filter(|(_, p)| !p.is_default()).map(|(n, _)| n.clone()).collect()
    }

    pub fn nodes_of(&self, r: &ProfileRef) -> Vec<String> {
        self.by_node.iter().filter(|(_, p)| *p == r).map(|(n, _)| n.clone()).collect()
    }
}

pub fn resolve(mut profiles: Vec<AgentProfile>, nodes: &[Node], now: DateTime<Utc>) -> Resolution {
    sort_profiles(&mut profiles);
    let mut assigned = BTreeMap::new();
    let mut applied = Vec::new();
    let mut out = Vec::with_capacity(profiles.len());
    for mut p in profiles {
        let before = p.status.clone();
        let outcome = profile_to_apply(&mut p, nodes, &mut assigned, now);
        if matches!(outcome, Outcome::Applied(_)) {
            applied.push(ProfileRef::of(&p));
        }
        let status_changed = p.status != before;
        out.push(Resolved { profile: p, outcome, status_changed });
    }
    apply_default_profile(nodes, &mut assigned);
    applied.push(ProfileRef::default_profile());
    Resolution { applied, by_node: assigned, profiles: out }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentop_core::builder::node;

    fn req(key: &str, op: &str, values: &[&str]) -> NodeSelectorRequirement {
        NodeSelectorRequirement {
            key: key.into(),
            operator: op.into(),
            values: if values.is_empty() { None } else { Some(values.iter().map(|v| v.to_string()).collect()) },
        }
    }

    #[test]
    fn operators_match_labels() {
        let n = node("n1", &[("pool", "gpu"), ("cores", "16")]);
        assert!(matches_node(&[req("pool", "In", &["gpu", "cpu"])], &n));
        assert!(!matches_node(&[req("pool", "NotIn", &["gpu"])], &n));
        assert!(matches_node(&[req("zone", "NotIn", &["a"])], &n));
        assert!(matches_node(&[req("pool", "Exists", &[])], &n));
        assert!(matches_node(&[req("zone", "DoesNotExist", &[])], &n));
        assert!(matches_node(&[req("cores", "Gt", &["8"])], &n));
        assert!(!matches_node(&[req("cores", "Lt", &["8"])], &n));
        assert!(!matches_node(&[req("pool", "Gt", &["1"])], &n));
        assert!(!matches_node(&[req("pool", "In", &["gpu"]), req("zone", "Exists", &[])], &n));
    }

    #[test]
    fn validation_rejects_malformed_requirements() {
        assert!(validate_requirement(&req("a", "In", &[])).is_err());
        assert!(validate_requirement(&req("a", "Exists", &["x"])).is_err());
        assert!(validate_requirement(&req("a", "Gt", &["x"])).is_err());
        assert!(validate_requirement(&req("a", "Near", &["x"])).is_err());
        assert!(validate_requirement(&req("a", "Lt", &["3"])).is_ok());
    }

    #[test]
    fn default_ref_renders_plainly() {
        let d = ProfileRef::default_profile();
        assert!(d.is_default());
        assert_eq!(d.to_string(), "default");
        assert_eq!(d.label_value(), "default");
        let p = ProfileRef { namespace: "ns".into(), name: "gpu".into() };
        assert_eq!(p.label_value(), "ns-gpu");
    }
}
