//! Workload status aggregation.

use agentop_core::WorkloadStatus;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::ResourceExt;

fn summarize(mut s: WorkloadStatus) -> WorkloadStatus {
    let state = if s.desired > 0 && s.ready == s.desired && s.up_to_date == s.desired {
        "Running"
    } else if s.up_to_date < s.desired {
        "Updating"
    } else {
        "Progressing"
    };
    s.status = Some(format!("{} ({}/{}/{})", state, s.desired, s.ready, s.up_to_date));
    s.state = Some(state.to_string());
    s
}

/// Node-agent status summed across every DaemonSet (profiles x providers).
pub fn daemon_sets(dss: &[DaemonSet]) -> WorkloadStatus {
    let mut s = WorkloadStatus::default();
    for ds in dss {
        s.names.push(ds.name_any());
        if let Some(st) = &ds.status {
            s.desired += st.desired_number_scheduled;
            s.current += st.current_number_scheduled;
            s.ready += st.number_ready;
            s.available += st.number_available.unwrap_or(0);
            s.up_to_date += st.updated_number_scheduled.unwrap_or(0);
        }
    }
    s.names.sort();
    summarize(s)
}

pub fn deployment(d: &Deployment) -> WorkloadStatus {
    let mut s = WorkloadStatus { names: vec![d.name_any()], ..Default::default() };
    s.desired = d.spec.as_ref().and_then(|sp| sp.replicas).unwrap_or(1);
    if let Some(st) = &d.status {
        s.current = st.replicas.unwrap_or(0);
        s.ready = st.ready_replicas.unwrap_or(0);
        s.available = st.available_replicas.unwrap_or(0);
        s.up_to_date = st.updated_replicas.unwrap_or(0);
    }
    summarize(s)
}

/// Replace the observed counters of `slot`, keeping the generated token.
pub fn merge_into(slot: &mut Option<WorkloadStatus>, observed: WorkloadStatus) {
    let token = slot.as_ref().and_then(|s| s.generated_token.clone());
    *slot = Some(WorkloadStatus { generated_token: token, ..observed });
}

/// Drop the observed counters of a component that no longer runs, keeping the generated token.
pub fn clear(slot: &mut Option<WorkloadStatus>) {
    let token = slot.as_ref().and_then(|s| s.generated_token.clone());
    *slot = token.map(|t| WorkloadStatus { generated_token: Some(t), ..Default::default() });
}
