//! The pass itself. Stage order:
//! fetch, finalizer, credentials, features, dependencies, cluster agent,
//! profiles, node agents, checks runner, dependency apply, cleanup, status.

use std::collections::BTreeSet;

use agentop_apply::{overrides, DependencyStore, Owner, ResourceManagers};
use agentop_core::condition::{self, ConditionStatus};
use agentop_core::names::{self, FINALIZER};
use agentop_core::{defaults, AgentDeployment, AgentDeploymentStatus, AgentProfile, ComponentName, Error, Result, WorkloadStatus};
use agentop_feature::{build_features, manage_all_dependencies};
use agentop_kubehub::{from_dynamic, get_typed, list_typed, to_dynamic, Labels, ObjectKey, ObjectKind, ObjectStore};
use agentop_profile::{resolve, Resolution};
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::ResourceExt;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::workload::{self, Inputs, NodeAgentTarget};
use crate::{providers, status, Outcome, Reconciler, STATUS_CONFLICT_REQUEUE};

pub(crate) async fn run(r: &Reconciler, namespace: &str, name: &str, now: DateTime<Utc>) -> Result<Outcome> {
    let store = r.store();
    let key = ObjectKey::namespaced(ObjectKind::AgentDeployment, namespace, name);
    let Some(fetched) = get_typed::<AgentDeployment>(store, &key).await? else {
        debug!("agent deployment gone; nothing to do");
        return Ok(Outcome::done());
    };
    if fetched.metadata.deletion_timestamp.is_some() {
        return finalize(store, &key, fetched).await;
    }
    let fetched = ensure_finalizer(store, &key, fetched).await?;

    let mut new_status = fetched.status_or_default();
    let result = reconcile_instance(r, &fetched, &mut new_status, now).await;
    publish(store, &key, &fetched, new_status, result, now).await
}

fn has_finalizer(instance: &AgentDeployment) -> bool {
    instance.finalizers().iter().any(|f| f == FINALIZER)
}

async fn ensure_finalizer(store: &dyn ObjectStore, key: &ObjectKey, mut instance: AgentDeployment) -> Result<AgentDeployment> {
    if has_finalizer(&instance) {
        return Ok(instance);
    }
    instance.finalizers_mut().push(FINALIZER.to_string());
    let stored = store.update(key, &to_dynamic(&instance)?).await?;
    debug!("finalizer added");
    from_dynamic(&stored)
}

/// Cluster-scoped dependencies carry no owner reference, so they are removed here
/// before the finalizer is released.
async fn finalize(store: &dyn ObjectStore, key: &ObjectKey, mut instance: AgentDeployment) -> Result<Outcome> {
    if !has_finalizer(&instance) {
        return Ok(Outcome::done());
    }
    let owner = Owner::of(&instance)?;
    let errs = DependencyStore::new(owner)
        .cleanup_kinds(store, &[ObjectKind::ClusterRoleBinding, ObjectKind::ClusterRole])
        .await;
    Error::aggregate(errs)?;
    instance.finalizers_mut().retain(|f| f != FINALIZER);
    store.update(key, &to_dynamic(&instance)?).await?;
    info!("finalizer removed");
    Ok(Outcome::done())
}

async fn reconcile_instance(
    r: &Reconciler,
    fetched: &AgentDeployment,
    new_status: &mut AgentDeploymentStatus,
    now: DateTime<Utc>,
) -> Result<Outcome> {
    let store = r.store();
    let opts = r.options();

    let has_key = fetched.global().credentials.map(|c| c.has_api_key()).unwrap_or(false);
    if !has_key {
        return Err(Error::Validation("credentials: an API key or API key secret is required".into()));
    }

    let mut instance = fetched.clone();
    defaults::apply(&mut instance.spec);
    let (features, required) = build_features(&instance, &opts.features);
    debug!(features = ?features.iter().map(|f| f.id().as_str()).collect::<Vec<_>>(), "features active");

    let owner = Owner::of(&instance)?;
    let mut managers = ResourceManagers::new(owner.clone());
    let mut errs = manage_all_dependencies(&features, &mut managers, &required);
    errs.extend(overrides::dependencies(&mut managers, &instance, &required.enabled()));

    ensure_token_in_status(fetched, new_status, managers.store());

    let inputs = Inputs { instance: &instance, features: &features, required: &required };

    reconcile_deployment(store, &owner, &inputs, ComponentName::ClusterAgent, new_status, now).await?;

    let nodes: Vec<Node> = if opts.profiles_enabled || opts.introspection_enabled {
        list_typed(store, ObjectKind::Node, None, &Labels::new()).await?
    } else {
        Vec::new()
    };
    let resolution = if opts.profiles_enabled {
        let profiles: Vec<AgentProfile> = list_typed(store, ObjectKind::AgentProfile, None, &Labels::new()).await?;
        let res = resolve(profiles, &nodes, now);
        persist_profile_statuses(store, &res).await;
        res
    } else {
        resolve(Vec::new(), &nodes, now)
    };
    let provider_list = providers::provider_list(&nodes, opts.introspection_enabled);

    reconcile_node_agents(store, &owner, &inputs, &resolution, &provider_list, opts.profiles_enabled, new_status, now)
        .await?;

    reconcile_deployment(store, &owner, &inputs, ComponentName::ClusterChecksRunner, new_status, now).await?;

    let deps = managers.into_store();
    errs.extend(deps.apply(store).await);
    Error::aggregate(errs)?;
    Error::aggregate(deps.cleanup(store).await)?;

    Ok(Outcome::requeue(opts.default_requeue))
}

/// Record the generated cluster-agent token so later passes reuse it.
fn ensure_token_in_status(fetched: &AgentDeployment, new_status: &mut AgentDeploymentStatus, deps: &DependencyStore) {
    let global = fetched.global();
    if global.cluster_agent_token.is_some() || global.cluster_agent_token_secret.is_some() {
        return;
    }
    if fetched.status.as_ref().and_then(|s| s.generated_token()).is_some() {
        return;
    }
    let Ok(ns) = agentop_core::namespace_of(fetched) else { return };
    let key = ObjectKey::namespaced(ObjectKind::Secret, &ns, &names::token_secret(&fetched.name_any()));
    let token = deps
        .get_typed::<Secret>(&key)
        .and_then(|s| s.data)
        .and_then(|d| d.get(names::TOKEN_KEY).map(|b| String::from_utf8_lossy(&b.0).into_owned()));
    let Some(token) = token else {
        debug!("generated token secret not declared");
        return;
    };
    new_status.cluster_agent.get_or_insert_with(WorkloadStatus::default).generated_token = Some(token);
}

fn component_slot(status: &mut AgentDeploymentStatus, component: ComponentName) -> (&mut Option<WorkloadStatus>, &'static str) {
    match component {
        ComponentName::NodeAgent => (&mut status.agent, condition::NODE_AGENT_RECONCILED),
        ComponentName::ClusterAgent => (&mut status.cluster_agent, condition::CLUSTER_AGENT_RECONCILED),
        ComponentName::ClusterChecksRunner => (&mut status.cluster_checks_runner, condition::CHECKS_RUNNER_RECONCILED),
    }
}

async fn delete_if_present(store: &dyn ObjectStore, key: &ObjectKey) -> Result<()> {
    if store.get_opt(key).await?.is_none() {
        return Ok(());
    }
    match store.delete(key).await {
        Ok(()) => {
            info!(key = %key, "deleted workload of disabled component");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

fn mark(status: &mut AgentDeploymentStatus, component: ComponentName, now: DateTime<Utc>, res: &Result<()>) {
    let (_, cond) = component_slot(status, component);
    match res {
        Ok(()) => condition::upsert(&mut status.conditions, now, cond, ConditionStatus::True, "Reconciled", ""),
        Err(e) => condition::upsert(&mut status.conditions, now, cond, ConditionStatus::False, "ReconcileFailed", &e.to_string()),
    }
}

fn disable(status: &mut AgentDeploymentStatus, component: ComponentName) {
    let (slot, cond) = component_slot(status, component);
    status::clear(slot);
    status.conditions.retain(|c| c.type_ != cond);
}

async fn reconcile_deployment(
    store: &dyn ObjectStore,
    owner: &Owner,
    inputs: &Inputs<'_>,
    component: ComponentName,
    new_status: &mut AgentDeploymentStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    let key = ObjectKey::namespaced(ObjectKind::Deployment, &owner.namespace, &names::component(&owner.name, component));
    if !inputs.required.is_enabled(component) {
        delete_if_present(store, &key).await?;
        disable(new_status, component);
        return Ok(());
    }

    let desired = match component {
        ComponentName::ClusterAgent => workload::cluster_agent(inputs),
        _ => workload::checks_runner(inputs),
    };
    let mut ds = DependencyStore::new(owner.clone());
    ds.add_or_update(ObjectKind::Deployment, &desired, None)?;
    let res = Error::aggregate(ds.apply(store).await);
    mark(new_status, component, now, &res);
    res?;

    if let Some(observed) = get_typed::<Deployment>(store, &key).await? {
        let (slot, _) = component_slot(new_status, component);
        status::merge_into(slot, status::deployment(&observed));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn reconcile_node_agents(
    store: &dyn ObjectStore,
    owner: &Owner,
    inputs: &Inputs<'_>,
    resolution: &Resolution,
    provider_list: &BTreeSet<String>,
    profiles_enabled: bool,
    new_status: &mut AgentDeploymentStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut ds = DependencyStore::new(owner.clone());
    if !inputs.required.is_enabled(ComponentName::NodeAgent) {
        Error::aggregate(ds.cleanup_kinds(store, &[ObjectKind::DaemonSet]).await)?;
        disable(new_status, ComponentName::NodeAgent);
        return Ok(());
    }

    let claimed = resolution.claimed_nodes();
    let mut keys = Vec::new();
    for profile_ref in &resolution.applied {
        let profile = resolution.profile(profile_ref);
        for provider in provider_list {
            let target = NodeAgentTarget { profile_ref, profile, provider, claimed: &claimed, profiles_enabled };
            keys.push(ds.add_or_update(ObjectKind::DaemonSet, &workload::node_agent(inputs, &target), None)?);
        }
    }
    let res = Error::aggregate(ds.apply(store).await);
    mark(new_status, ComponentName::NodeAgent, now, &res);
    res?;

    for e in ds.cleanup_kinds(store, &[ObjectKind::DaemonSet]).await {
        warn!(error = %e, "extraneous node-agent daemonset cleanup failed");
    }

    let mut observed = Vec::with_capacity(keys.len());
    for key in &keys {
        if let Some(d) = get_typed::<DaemonSet>(store, key).await? {
            observed.push(d);
        }
    }
    status::merge_into(&mut new_status.agent, status::daemon_sets(&observed));
    Ok(())
}

/// Profile status writes are best effort; a failure only delays the status.
async fn persist_profile_statuses(store: &dyn ObjectStore, resolution: &Resolution) {
    for p in resolution.profiles.iter().filter(|p| p.status_changed) {
        let Some(ns) = p.profile.namespace() else { continue };
        let key = ObjectKey::namespaced(ObjectKind::AgentProfile, &ns, &p.profile.name_any());
        let res = match to_dynamic(&p.profile) {
            Ok(body) => store.update_status(&key, &body).await.map(|_| ()),
            Err(e) => Err(e),
        };
        match res {
            Ok(()) => {
                counter!("profile_status_updates", 1u64);
            }
            Err(e) => warn!(profile = %key, error = %e, "profile status update failed"),
        }
    }
}

async fn publish(
    store: &dyn ObjectStore,
    key: &ObjectKey,
    fetched: &AgentDeployment,
    mut new_status: AgentDeploymentStatus,
    result: Result<Outcome>,
    now: DateTime<Utc>,
) -> Result<Outcome> {
    match &result {
        Ok(_) => condition::upsert(&mut new_status.conditions, now, condition::RECONCILE_ERROR, ConditionStatus::False, "ReconcileOk", ""),
        Err(e) => condition::upsert(
            &mut new_status.conditions,
            now,
            condition::RECONCILE_ERROR,
            ConditionStatus::True,
            "ReconcileError",
            &e.to_string(),
        ),
    }
    if fetched.status.as_ref() == Some(&new_status) {
        return result;
    }

    let mut updated = fetched.clone();
    updated.status = Some(new_status);
    match store.update_status(key, &to_dynamic(&updated)?).await {
        Ok(_) => {
            counter!("status_updates", 1u64);
            result
        }
        Err(e) if e.is_conflict() => {
            counter!("status_conflicts", 1u64);
            debug!(error = %e, "status write lost a race; retrying shortly");
            Ok(Outcome::requeue(STATUS_CONFLICT_REQUEUE))
        }
        Err(e) => {
            warn!(error = %e, "status update failed");
            Err(e)
        }
    }
}
