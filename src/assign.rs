//! Role assignment: one principal, stamped synchronously

use crate::config::RetryPolicy;
use crate::constants::MAX_ASSIGN_RESTAMPS;
use crate::directory::{Directory, DirectoryError, Principal, Snapshot};
use crate::error::{Error, Result};
use crate::hierarchy::Actor;
use crate::propagate::RetryExhausted;
use crate::registry::RoleRegistry;

pub(crate) fn directory_error(e: RetryExhausted) -> Error {
    match e.error {
        DirectoryError::NotFound(id) => Error::principal_not_found(id),
        other => Error::Directory(other),
    }
}

/// Require `actor` to outrank `current`, the role the principal holds now.
///
/// Moving a principal within its own role needs no extra check, and a
/// dangling role id has nothing left to protect.
fn authorize_current(registry: &RoleRegistry, actor: &Actor, current: Option<&str>, role_id: &str) -> Result<()> {
    let Some(current) = current.filter(|c| *c != role_id) else {
        return Ok(());
    };
    match registry.get_role(current) {
        Ok(cur) => registry.authorize(actor, &cur),
        Err(Error::NotFound { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Give `principal_id` the role `role_id` and stamp the role's current capabilities.
///
/// The actor must outrank both the target role and the principal's current
/// role, unless it is a super admin. The directory write is conditional on
/// the current role the actor was checked against; if it changed meanwhile
/// the new current role is authorized and the write retried. After the
/// write the registry is read again; if an edit committed in between, the
/// newer set is stamped too, so an assignment racing a propagation still
/// lands on the latest capabilities.
pub fn assign_role(registry: &RoleRegistry, directory: &dyn Directory, retry: &RetryPolicy, actor: &Actor, principal_id: &str, role_id: &str) -> Result<Principal> {
    let principal = retry
        .run("get_principal", || directory.get_principal(principal_id))
        .map_err(directory_error)?
        .ok_or_else(|| Error::principal_not_found(principal_id))?;
    let mut role = registry.get_role(role_id)?;
    registry.authorize(actor, &role)?;
    let mut expected = principal.assigned_role;
    authorize_current(registry, actor, expected.as_deref(), role_id)?;

    let mut stamped = None;
    for _ in 0..MAX_ASSIGN_RESTAMPS {
        let snapshot = Snapshot::of(&role);
        match retry.run("assign", || directory.assign(principal_id, role_id, expected.as_deref(), &snapshot)) {
            Ok(p) => {
                expected = p.assigned_role.clone();
                stamped = Some(p);
            }
            Err(RetryExhausted { error: DirectoryError::RoleChanged { actual, .. }, .. }) => {
                tracing::debug!(principal = principal_id, role = role_id, current = ?actual, "principal changed role during assignment, re-checking");
                authorize_current(registry, actor, actual.as_deref(), role_id)?;
                expected = actual;
                continue;
            }
            Err(e) => return Err(directory_error(e)),
        }
        let latest = registry.get_role(role_id)?;
        if latest.version == role.version {
            tracing::info!(principal = principal_id, role = role_id, version = role.version, "role assigned");
            return stamped.ok_or_else(|| Error::principal_not_found(principal_id));
        }
        tracing::debug!(principal = principal_id, role = role_id, stamped = role.version, latest = latest.version, "role edited during assignment, restamping");
        role = latest;
    }
    match stamped {
        // Shows as PendingPropagation until the next run or remediation reaches it
        Some(p) => {
            tracing::warn!(principal = principal_id, role = role_id, "role kept changing during assignment; leaving convergence to propagation");
            Ok(p)
        }
        None => Err(Error::Directory(DirectoryError::RoleChanged {
            principal: principal_id.to_string(),
            expected: expected.clone(),
            actual: expected,
        })),
    }
}
