//! Node providers: node-agent DaemonSets are split per provider when introspection is on.

use std::collections::BTreeSet;

use agentop_core::names::providers::{DEFAULT, GKE_COS, GKE_COS_VALUE, GKE_OS_LABEL, LEGACY};
use k8s_openapi::api::core::v1::{Node, NodeSelectorRequirement};

pub fn provider_of(node: &Node) -> &'static str {
    let cos = node
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(GKE_OS_LABEL))
        .map(|v| v == GKE_COS_VALUE)
        .unwrap_or(false);
    if cos {
        GKE_COS
    } else {
        DEFAULT
    }
}

/// Providers present in `nodes`. Without introspection there is only the legacy provider.
/// An empty node list still yields the default provider so the node agent keeps existing.
pub fn provider_list(nodes: &[Node], introspection: bool) -> BTreeSet<String> {
    if !introspection {
        return BTreeSet::from([LEGACY.to_string()]);
    }
    let mut out: BTreeSet<String> = nodes.iter().map(|n| provider_of(n).to_string()).collect();
    if out.is_empty() {
        out.insert(DEFAULT.to_string());
    }
    out
}

/// Node-affinity expression pinning a DaemonSet to its provider's nodes.
pub fn affinity(provider: &str) -> Option<NodeSelectorRequirement> {
    let op = match provider {
        GKE_COS => "In",
        DEFAULT => "NotIn",
        _ => return None,
    };
    Some(NodeSelectorRequirement {
        key: GKE_OS_LABEL.to_string(),
        operator: op.to_string(),
        values: Some(vec![GKE_COS_VALUE.to_string()]),
    })
}
