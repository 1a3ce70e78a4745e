//! User overrides folded into the dependency store after features ran and before apply.

use agentop_core::{names, AgentDeployment, ComponentName, Error};
use agentop_kubehub::{ObjectKey, ObjectKind};
use tracing::debug;

use crate::{json_to_dynamic, ResourceManagers};

/// Merge per-component overrides and `dependencyOverrides` for the `active` components.
/// Every failure is collected; none stops the others.
pub fn dependencies(managers: &mut ResourceManagers, instance: &AgentDeployment, active: &[ComponentName]) -> Vec<Error> {
    let mut errs = Vec::new();
    let owner = managers.owner().clone();

    for (component, ov) in &instance.spec.overrides {
        if !active.contains(component) {
            continue;
        }
        let generated = names::component(&owner.name, *component);
        if ov.service_account_name.is_some() {
            let key = ObjectKey::namespaced(ObjectKind::ServiceAccount, &owner.namespace, &generated);
            if managers.store_mut().remove(&key).is_some() {
                debug!(component = %component, "custom service account; dropped generated one");
            }
        }
        if !ov.extra_confd.is_empty() {
            let name = names::extra_confd_config_map(&owner.name, *component);
            if let Err(e) = managers.config_map(&owner.namespace, &name, ov.extra_confd.clone()) {
                errs.push(e);
            }
        }
        if !ov.extra_rbac_rules.is_empty() {
            if let Err(e) = managers.cluster_role_rules(&generated, ov.extra_rbac_rules.clone()) {
                errs.push(e);
            }
        }
    }

    for ov in &instance.spec.dependency_overrides {
        let Some(kind) = ObjectKind::from_kind(&ov.kind) else {
            errs.push(Error::Validation(format!("dependency override: unknown kind {}", ov.kind)));
            continue;
        };
        let key = if kind.namespaced() {
            ObjectKey::namespaced(kind, ov.namespace.as_deref().unwrap_or(&owner.namespace), &ov.name)
        } else {
            ObjectKey::cluster(kind, &ov.name)
        };
        let res = managers.store_mut().patch(&key, |obj| {
            let mut v = serde_json::to_value(&*obj)?;
            json_patch::merge(&mut v, &ov.patch);
            let mut patched = json_to_dynamic(v)?;
            patched.metadata.name = obj.metadata.name.clone();
            patched.metadata.namespace = obj.metadata.namespace.clone();
            *obj = patched;
            Ok(())
        });
        match res {
            Ok(()) => debug!(key = %key, "applied dependency override"),
            Err(e) if e.is_not_found() => {
                errs.push(Error::Validation(format!("dependency override targets undeclared {}", key)))
            }
            Err(e) => errs.push(e),
        }
    }
    errs
}
