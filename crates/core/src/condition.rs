//! Typed status conditions with upsert-by-type semantics.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const RECONCILE_ERROR: &str = "ReconcileError";
pub const NODE_AGENT_RECONCILED: &str = "NodeAgentReconciled";
pub const CLUSTER_AGENT_RECONCILED: &str = "ClusterAgentReconciled";
pub const CHECKS_RUNNER_RECONCILED: &str = "ClusterChecksRunnerReconciled";
pub const PROFILE_VALID: &str = "Valid";
pub const PROFILE_APPLIED: &str = "Applied";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn from_bool(b: bool) -> Self {
        if b { ConditionStatus::True } else { ConditionStatus::False }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Insert or update the condition of `type_`.
///
/// The transition time moves only when `status` changes, so re-asserting an
/// unchanged condition leaves the list structurally equal.
pub fn upsert(
    conditions: &mut Vec<Condition>,
    now: DateTime<Utc>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status {
                existing.status = status;
                existing.last_transition_time = Some(Time(now));
            }
            existing.reason = Some(reason.to_string());
            existing.message = Some(message.to_string());
        }
        None => conditions.push(Condition {
            type_: type_.to_string(),
            status,
            last_transition_time: Some(Time(now)),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }),
    }
}

pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find(conditions, type_).map(|c| c.status == ConditionStatus::True).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> { Utc.timestamp_opt(secs, 0).unwrap() }

    #[test]
    fn upsert_appends_unseen_type() {
        let mut cs = Vec::new();
        upsert(&mut cs, t(1), "A", ConditionStatus::True, "r", "m");
        upsert(&mut cs, t(2), "B", ConditionStatus::False, "r", "m");
        assert_eq!(cs.len(), 2);
        assert_eq!(cs[1].type_, "B");
    }

    #[test]
    fn upsert_keeps_transition_time_when_status_unchanged() {
        let mut cs = Vec::new();
        upsert(&mut cs, t(1), "A", ConditionStatus::True, "r1", "m1");
        let before = cs.clone();
        upsert(&mut cs, t(5), "A", ConditionStatus::True, "r1", "m1");
        assert_eq!(cs, before);

        upsert(&mut cs, t(9), "A", ConditionStatus::False, "r2", "m2");
        assert_eq!(cs.len(), 1);
        assert_eq!(cs[0].last_transition_time, Some(Time(t(9))));
        assert_eq!(cs[0].reason.as_deref(), Some("r2"));
        assert!(!is_true(&cs, "A"));
    }
}
