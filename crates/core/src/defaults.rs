//! Spec defaulting. Applied to a working copy every pass; the stored spec is never rewritten.

use crate::crd::{
    AdmissionControllerFeatureConfig, AgentDeploymentSpec, ApmFeatureConfig,
    ClusterChecksFeatureConfig, InstrumentationConfig, LogCollectionFeatureConfig,
    NpmFeatureConfig, OrchestratorExplorerFeatureConfig, Toggle,
};

pub const DEFAULT_SITE: &str = "intake.agentop.dev";
pub const DEFAULT_REGISTRY: &str = "ghcr.io/agentop";
pub const DEFAULT_APM_PORT: i32 = 8126;

fn default_if_unset<T>(slot: &mut Option<T>, v: T) {
    if slot.is_none() {
        *slot = Some(v);
    }
}

/// Fill every unset field with its default. Idempotent.
pub fn apply(spec: &mut AgentDeploymentSpec) {
    let global = spec.global.get_or_insert_with(Default::default);
    default_if_unset(&mut global.site, DEFAULT_SITE.to_string());
    default_if_unset(&mut global.registry, DEFAULT_REGISTRY.to_string());

    let f = spec.features.get_or_insert_with(Default::default);

    let ac = f.admission_controller.get_or_insert_with(AdmissionControllerFeatureConfig::default);
    default_if_unset(&mut ac.enabled, true);
    default_if_unset(&mut ac.mutate_unlabelled, false);

    let apm = f.apm.get_or_insert_with(ApmFeatureConfig::default);
    default_if_unset(&mut apm.enabled, false);
    default_if_unset(&mut apm.host_port, DEFAULT_APM_PORT);
    let instr = apm.instrumentation.get_or_insert_with(InstrumentationConfig::default);
    default_if_unset(&mut instr.enabled, false);

    let logs = f.log_collection.get_or_insert_with(LogCollectionFeatureConfig::default);
    default_if_unset(&mut logs.enabled, false);
    default_if_unset(&mut logs.container_collect_all, false);

    let npm = f.npm.get_or_insert_with(NpmFeatureConfig::default);
    default_if_unset(&mut npm.enabled, false);
    default_if_unset(&mut npm.enable_conntrack, true);

    let oe = f.orchestrator_explorer.get_or_insert_with(OrchestratorExplorerFeatureConfig::default);
    default_if_unset(&mut oe.enabled, true);
    default_if_unset(&mut oe.scrubbing, true);

    let ksm = f.kube_state_metrics_core.get_or_insert_with(Toggle::default);
    default_if_unset(&mut ksm.enabled, true);

    let cc = f.cluster_checks.get_or_insert_with(ClusterChecksFeatureConfig::default);
    default_if_unset(&mut cc.enabled, true);
    default_if_unset(&mut cc.use_cluster_checks_runners, false);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_unset_fields_only() {
        let mut spec = AgentDeploymentSpec::default();
        spec.features = Some(crate::crd::FeaturesConfig {
            orchestrator_explorer: Some(OrchestratorExplorerFeatureConfig { enabled: Some(false), scrubbing: None }),
            ..Default::default()
        });
        apply(&mut spec);
        let f = spec.features.as_ref().unwrap();
        assert_eq!(f.orchestrator_explorer.as_ref().unwrap().enabled, Some(false));
        assert_eq!(f.orchestrator_explorer.as_ref().unwrap().scrubbing, Some(true));
        assert_eq!(f.admission_controller.as_ref().unwrap().enabled, Some(true));
        assert_eq!(f.apm.as_ref().unwrap().host_port, Some(DEFAULT_APM_PORT));
        assert_eq!(spec.global.as_ref().unwrap().site.as_deref(), Some(DEFAULT_SITE));
        assert!(f.asm.is_none());
    }

    #[test]
    fn defaults_are_idempotent() {
        let mut once = AgentDeploymentSpec::default();
        apply(&mut once);
        let mut twice = once.clone();
        apply(&mut twice);
        assert_eq!(once, twice);
    }
}
