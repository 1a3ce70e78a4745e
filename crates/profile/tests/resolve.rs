use agentop_core::builder::{node, AgentProfileBuilder};
use agentop_core::condition::{self, ConditionStatus, PROFILE_APPLIED, PROFILE_VALID};
use agentop_core::{AgentProfile, ComponentName};
use agentop_profile::{resolve, sort_profiles, Outcome, ProfileRef};
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn profile(name: &str, created: i64, pool: &[&str]) -> AgentProfile {
    AgentProfileBuilder::new("ns", name)
        .created_at(t(created))
        .selector("pool", "In", pool)
        .container_env("agent", "AGENT_LOG_LEVEL", "debug")
        .build()
}

fn nodes() -> Vec<Node> {
    vec![
        node("a1", &[("pool", "a")]),
        node("a2", &[("pool", "a")]),
        node("b1", &[("pool", "b")]),
        node("c1", &[("pool", "c")]),
    ]
}

fn r(name: &str) -> ProfileRef {
    ProfileRef { namespace: "ns".into(), name: name.into() }
}

#[test]
fn older_profile_wins_contested_nodes() {
    let old = profile("zeta", 10, &["a"]);
    let young = profile("alpha", 20, &["a", "b"]);
    let res = resolve(vec![young, old], &nodes(), t(100));

    assert_eq!(res.applied, vec![r("zeta"), ProfileRef::default_profile()]);
    assert_eq!(res.by_node["a1"], r("zeta"));
    assert_eq!(res.by_node["a2"], r("zeta"));
    // All-or-nothing: b1 is not taken by the conflicting profile.
    assert!(res.by_node["b1"].is_default());

    let alpha = res.profiles.iter().find(|p| p.profile.name_any() == "alpha").unwrap();
    assert_eq!(alpha.outcome, Outcome::Conflicting(vec!["a1".into(), "a2".into()]));
    let conds = &alpha.profile.status.as_ref().unwrap().conditions;
    assert_eq!(condition::find(conds, PROFILE_APPLIED).unwrap().status, ConditionStatus::False);
    assert!(condition::is_true(conds, PROFILE_VALID));
}

#[test]
fn equal_timestamps_fall_back_to_name() {
    let mut ps = vec![profile("b", 5, &["a"]), profile("a", 5, &["a"]), profile("c", 1, &["c"])];
    sort_profiles(&mut ps);
    let names: Vec<String> = ps.iter().map(|p| p.name_any()).collect();
    assert_eq!(names, vec!["c", "a", "b"]);

    let res = resolve(vec![profile("b", 5, &["a"]), profile("a", 5, &["a"])], &nodes(), t(100));
    assert_eq!(res.by_node["a1"], r("a"));
}

#[test]
fn ordering_is_permutation_stable() {
    let set = || vec![profile("p1", 3, &["a"]), profile("p2", 1, &["a", "b"]), profile("p3", 2, &["c"])];
    let forward = resolve(set(), &nodes(), t(100));
    let mut reversed = set();
    reversed.reverse();
    let backward = resolve(reversed, &nodes(), t(100));
    assert_eq!(forward.by_node, backward.by_node);
    assert_eq!(forward.applied, backward.applied);
}

#[test]
fn every_node_is_covered_exactly_once() {
    let res = resolve(vec![profile("p", 1, &["b"])], &nodes(), t(100));
    assert_eq!(res.by_node.len(), 4);
    assert_eq!(res.applied.iter().filter(|p| p.is_default()).count(), 1);
    assert_eq!(res.nodes_of(&r("p")), vec!["b1"]);
    assert_eq!(res.claimed_nodes().into_iter().collect::<Vec<_>>(), vec!["b1"]);

    let none = resolve(Vec::new(), &nodes(), t(100));
    assert_eq!(none.applied, vec![ProfileRef::default_profile()]);
    assert!(none.by_node.values().all(ProfileRef::is_default));
}

#[test]
fn profile_matching_no_node_is_still_applied() {
    let res = resolve(vec![profile("empty", 1, &["zzz"])], &nodes(), t(100));
    assert_eq!(res.profiles[0].outcome, Outcome::Applied(vec![]));
    assert_eq!(res.applied, vec![r("empty"), ProfileRef::default_profile()]);
}

#[test]
fn invalid_profiles_are_excluded() {
    let no_selector = AgentProfileBuilder::new("ns", "bare").created_at(t(1)).build();
    let wrong_component = AgentProfileBuilder::new("ns", "dca")
        .created_at(t(2))
        .selector("pool", "In", &["a"])
        .component_override(ComponentName::ClusterAgent)
        .build();
    let res = resolve(vec![no_selector, wrong_component], &nodes(), t(100));
    assert_eq!(res.applied, vec![ProfileRef::default_profile()]);
    for p in &res.profiles {
        assert!(matches!(p.outcome, Outcome::Invalid(_)));
        let st = p.profile.status.as_ref().unwrap();
        assert_eq!(st.valid.as_deref(), Some("False"));
        assert!(!condition::is_true(&st.conditions, PROFILE_VALID));
    }
}

#[test]
fn unchanged_outcome_leaves_status_untouched() {
    let first = resolve(vec![profile("p", 1, &["a"])], &nodes(), t(100));
    assert!(first.profiles[0].status_changed);
    let again = resolve(vec![first.profiles[0].profile.clone()], &nodes(), t(200));
    assert!(!again.profiles[0].status_changed);
    assert_eq!(again.profiles[0].profile.status.as_ref().unwrap().covered_nodes, vec!["a1", "a2"]);
}
