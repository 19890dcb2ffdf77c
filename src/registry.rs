//! Role registry: seeded roles, lookups and compare-and-swap capability edits

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::caps::CapabilitySet;
use crate::db::Store;
use crate::error::{Error, Result};
use crate::hierarchy::{can_administer, Actor, Level};

pub type RoleId = String;

/// A named, leveled bundle of capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub description: String,
    pub level: Level,
    pub capabilities: CapabilitySet,
    /// Compare-and-swap token; bumped by every capability change.
    pub version: u64,
}

impl Role {
    pub fn new(id: impl Into<RoleId>, name: impl Into<String>, description: impl Into<String>, level: Level, capabilities: CapabilitySet) -> Self {
        Role { id: id.into(), name: name.into(), description: description.into(), level, capabilities, version: 1 }
    }
}

/// Outcome of a capability edit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleUpdate {
    pub role: Role,
    /// False when the stored set already matched (idempotent resend).
    pub changed: bool,
}

/// Role records keyed by id, backed by a [`Store`].
#[derive(Clone)]
pub struct RoleRegistry {
    store: Store,
}

impl RoleRegistry {
    pub fn new(store: Store) -> Self {
        RoleRegistry { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ========================================================================
    // Seeding
    // ========================================================================

    pub fn is_bootstrapped(&self) -> Result<bool> {
        self.store.read(|d, tx| Ok(d.meta.get(tx, "boot")?.is_some()))
    }

    /// Seed the registry. Fails if already seeded or if the catalog is inconsistent.
    pub fn seed(&self, roles: &[Role]) -> Result<()> {
        validate_catalog(roles)?;
        self.store.write(|d, tx| {
            if d.meta.get(tx, "boot")?.is_some() {
                return Err(Error::Validation("already bootstrapped".into()));
            }
            for role in roles {
                let mut role = role.clone();
                role.version = 1;
                d.roles.put(tx, &role.id, &role)?;
            }
            d.meta.put(tx, "boot", "1")?;
            Ok(())
        })?;
        tracing::info!(roles = roles.len(), "seeded role registry");
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get_role(&self, id: &str) -> Result<Role> {
        self.store.read(|d, tx| d.roles.get(tx, id)?.ok_or_else(|| Error::role_not_found(id)))
    }

    /// All roles, most authoritative first
    pub fn list_roles(&self) -> Result<Vec<Role>> {
        let mut roles = self.store.read(|d, tx| {
            let mut r = Vec::new();
            for item in d.roles.iter(tx)? {
                r.push(item?.1);
            }
            Ok(r)
        })?;
        roles.sort_by_key(|r| r.level);
        Ok(roles)
    }

    /// Level the actor acts at, `None` for super admins.
    pub fn actor_level(&self, actor: &Actor) -> Result<Option<Level>> {
        if actor.super_admin {
            return Ok(None);
        }
        let Some(role) = &actor.role else {
            return Err(Error::AuthorizationDenied("actor holds no role".into()));
        };
        match self.get_role(role) {
            Ok(r) => Ok(Some(r.level)),
            Err(Error::NotFound { .. }) => Err(Error::AuthorizationDenied(format!("actor role {} is unknown", role))),
            Err(e) => Err(e),
        }
    }

    /// Require that `actor` may administer `target`.
    pub fn authorize(&self, actor: &Actor, target: &Role) -> Result<()> {
        match self.actor_level(actor)? {
            None => Ok(()),
            Some(level) if can_administer(level, target.level) => Ok(()),
            Some(level) => Err(Error::AuthorizationDenied(format!(
                "level {} cannot administer role {} (level {})",
                level, target.id, target.level
            ))),
        }
    }

    // ========================================================================
    // Edits
    // ========================================================================

    /// Replace a role's capability set.
    ///
    /// `base_version` is the version the caller read. A stale base is
    /// rejected unless the stored set already equals `capabilities`, in which
    /// case nothing is written. A successful change records a pending
    /// propagation marker in the same transaction.
    pub fn update_capabilities(&self, actor: &Actor, role_id: &str, capabilities: CapabilitySet, base_version: u64) -> Result<RoleUpdate> {
        let target = self.get_role(role_id)?;
        self.authorize(actor, &target)?;
        self.store.write(|d, tx| {
            let mut role = d.roles.get(tx, role_id)?.ok_or_else(|| Error::role_not_found(role_id))?;
            if role.capabilities == capabilities {
                return Ok(RoleUpdate { role, changed: false });
            }
            if role.version != base_version {
                return Err(Error::ConcurrentModification { role: role_id.to_string(), expected: base_version, actual: role.version });
            }
            role.capabilities = capabilities;
            role.version += 1;
            d.roles.put(tx, role_id, &role)?;
            d.pending.put(tx, role_id, &role.version)?;
            Ok(RoleUpdate { role, changed: true })
        })
    }

    // ========================================================================
    // Pending propagation markers
    // ========================================================================

    /// Roles whose latest edit has not finished propagating
    pub fn pending(&self) -> Result<Vec<(RoleId, u64)>> {
        self.store.read(|d, tx| {
            let mut r = Vec::new();
            for item in d.pending.iter(tx)? {
                let (k, v) = item?;
                r.push((k.to_string(), v));
            }
            Ok(r)
        })
    }

    /// Record that `version` of a role still needs propagating. Never moves a marker backwards.
    pub fn mark_pending(&self, role_id: &str, version: u64) -> Result<()> {
        self.store.write(|d, tx| {
            if d.pending.get(tx, role_id)?.map_or(true, |v| v < version) {
                d.pending.put(tx, role_id, &version)?;
            }
            Ok(())
        })
    }

    /// Drop the marker if it still names `version`; a newer edit keeps its own.
    pub fn clear_pending(&self, role_id: &str, version: u64) -> Result<bool> {
        self.store.write(|d, tx| match d.pending.get(tx, role_id)? {
            Some(v) if v <= version => Ok(d.pending.delete(tx, role_id)?),
            _ => Ok(false),
        })
    }
}

fn validate_catalog(roles: &[Role]) -> Result<()> {
    if roles.is_empty() {
        return Err(Error::Validation("role catalog is empty".into()));
    }
    let mut ids = HashSet::new();
    let mut levels = HashSet::new();
    for role in roles {
        if role.id.is_empty() {
            return Err(Error::Validation("role id must not be empty".into()));
        }
        if role.level == 0 {
            return Err(Error::Validation(format!("role {} has level 0; levels start at 1", role.id)));
        }
        if !ids.insert(role.id.as_str()) {
            return Err(Error::Validation(format!("duplicate role id {}", role.id)));
        }
        if !levels.insert(role.level) {
            return Err(Error::Validation(format!("level {} is used by more than one role (at {})", role.level, role.id)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::Capability;

    #[test]
    fn test_catalog_rejects_tied_levels() {
        let roles = [
            Role::new("a", "A", "", 2, CapabilitySet::empty()),
            Role::new("b", "B", "", 2, CapabilitySet::empty()),
        ];
        assert!(matches!(validate_catalog(&roles), Err(Error::Validation(_))));
    }

    #[test]
    fn test_catalog_rejects_level_zero() {
        let roles = [Role::new("a", "A", "", 0, CapabilitySet::empty())];
        assert!(validate_catalog(&roles).is_err());
    }

    #[test]
    fn test_catalog_rejects_duplicate_id() {
        let roles = [
            Role::new("a", "A", "", 1, CapabilitySet::empty()),
            Role::new("a", "A2", "", 2, CapabilitySet::of(&[Capability::ViewUsers])),
        ];
        assert!(validate_catalog(&roles).is_err());
    }

    #[test]
    fn test_catalog_ok() {
        assert!(validate_catalog(&crate::bootstrap::catalog()).is_ok());
    }
}
