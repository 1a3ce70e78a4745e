//! agentop reconcile: one pass from an AgentDeployment spec to cluster state and published status.
//!
//! A pass is idempotent: running it twice against an unchanged cluster issues
//! no writes the second time.

#![forbid(unsafe_code)]

mod pipeline;
pub mod providers;
pub mod status;
pub mod workload;

use std::sync::Arc;
use std::time::{Duration, Instant};

use agentop_core::{Error, Result};
use agentop_feature::FeatureOptions;
use agentop_kubehub::ObjectStore;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{info_span, warn, Instrument};

pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(15);
/// Retry delay after losing a status-write race.
pub const STATUS_CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    /// Resolve AgentProfiles and run one node-agent DaemonSet per applied profile.
    pub profiles_enabled: bool,
    /// Split node-agent DaemonSets per node provider.
    pub introspection_enabled: bool,
    pub default_requeue: Duration,
    pub features: FeatureOptions,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            profiles_enabled: false,
            introspection_enabled: false,
            default_requeue: DEFAULT_REQUEUE,
            features: FeatureOptions::default(),
        }
    }
}

/// What the controller should do after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub requeue_after: Option<Duration>,
}

impl Outcome {
    pub fn done() -> Self {
        Self { requeue_after: None }
    }

    pub fn requeue(after: Duration) -> Self {
        Self { requeue_after: Some(after) }
    }
}

pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    options: ReconcilerOptions,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ObjectStore>, options: ReconcilerOptions) -> Self {
        Self { store, options }
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    pub fn options(&self) -> &ReconcilerOptions {
        &self.options
    }

    /// Run one pass for the AgentDeployment `namespace/name`.
    pub async fn reconcile(&self, namespace: &str, name: &str, now: DateTime<Utc>) -> Result<Outcome> {
        let started = Instant::now();
        let span = info_span!("reconcile", namespace = %namespace, name = %name);
        let res = pipeline::run(self, namespace, name, now).instrument(span).await;
        counter!("reconcile_passes", 1u64);
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        if let Err(e) = &res {
            counter!("reconcile_errors", 1u64);
            warn!(namespace = %namespace, name = %name, error = %e, "reconcile failed");
        }
        res
    }

    /// Like [`Reconciler::reconcile`], abandoning the pass once `cancel` fires.
    pub async fn reconcile_until(
        &self,
        namespace: &str,
        name: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = self.reconcile(namespace, name, now) => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_are_printable_for_startup_logs() {
        let opts = ReconcilerOptions { profiles_enabled: true, ..Default::default() };
        let printed = format!("{:?}", opts);
        assert!(printed.contains("profiles_enabled: true"));
        assert!(printed.contains("k8s_manual"));
        assert_eq!(opts.default_requeue, DEFAULT_REQUEUE);
    }
}
