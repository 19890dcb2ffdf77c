//! Directory adapter: where principals live
//!
//! The engine never owns principals. It asks a [`Directory`] who holds a
//! role and hands it snapshot writes. [`LmdbDirectory`] keeps principals in
//! the same LMDB environment as the registry; other backends implement the
//! trait and are injected into the engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::caps::CapabilitySet;
use crate::constants::DEFAULT_BATCH_SIZE;
use crate::db::Store;
use crate::error::Error;
use crate::keys::{build_key, get_part, role_member_key};
use crate::registry::{Role, RoleId};

pub type PrincipalId = String;

/// Denormalized copy of a role's capabilities, stamped with the role version it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub role_version: u64,
    /// Keyed by capability name. May lag the vocabulary; absent keys deny.
    pub capabilities: BTreeMap<String, bool>,
}

impl Snapshot {
    pub fn new(capabilities: CapabilitySet, role_version: u64) -> Self {
        Snapshot { role_version, capabilities: capabilities.to_map() }
    }

    pub fn of(role: &Role) -> Self {
        Snapshot::new(role.capabilities, role.version)
    }

    /// Whether this snapshot grants exactly `set`.
    pub fn matches(&self, set: CapabilitySet) -> bool {
        CapabilitySet::from_map(&self.capabilities).map(|s| s == set).unwrap_or(false)
    }
}

/// An identity holding at most one role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    pub assigned_role: Option<RoleId>,
    pub snapshot: Option<Snapshot>,
    /// Bypasses level comparisons and capability checks.
    #[serde(default)]
    pub super_admin: bool,
}

impl Principal {
    /// A principal with no role yet
    pub fn new(id: impl Into<PrincipalId>) -> Self {
        Principal { id: id.into(), assigned_role: None, snapshot: None, super_admin: false }
    }

    pub fn with_super_admin(mut self, super_admin: bool) -> Self {
        self.super_admin = super_admin;
        self
    }
}

/// One principal's share of a propagation batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotWrite {
    pub principal: PrincipalId,
    pub role: RoleId,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("directory timed out")]
    Timeout,
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("principal not found: {0}")]
    NotFound(PrincipalId),
    #[error("batch of {len} writes exceeds directory limit of {max}")]
    BatchTooLarge { len: usize, max: usize },
    #[error("principal {principal} holds role {actual:?}, expected {expected:?}")]
    RoleChanged { principal: PrincipalId, expected: Option<RoleId>, actual: Option<RoleId> },
    #[error("directory storage: {0}")]
    Storage(String),
}

impl DirectoryError {
    /// Transient failures take the retry path; the rest fail fast.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DirectoryError::Timeout | DirectoryError::Unavailable(_))
    }
}

/// Source of principals and sink for their snapshots.
///
/// Implementations must make `write_snapshots` atomic (all or nothing) and
/// conditional per principal: a write applies only while the principal still
/// holds `role`, and never replaces a snapshot stamped with a newer
/// `role_version`. That makes batches idempotent and order-independent.
pub trait Directory: Send + Sync {
    /// Ids of every principal currently holding `role`
    fn principals_with_role(&self, role: &str) -> Result<Vec<PrincipalId>, DirectoryError>;

    fn get_principal(&self, id: &str) -> Result<Option<Principal>, DirectoryError>;

    /// Apply a batch atomically. Returns how many snapshots actually changed.
    fn write_snapshots(&self, batch: &[SnapshotWrite]) -> Result<usize, DirectoryError>;

    /// Set `id`'s role and stamp `snapshot`, provided `id` still holds
    /// `expected_current`; otherwise fail with [`DirectoryError::RoleChanged`]
    /// and write nothing. The comparison and the write must be atomic.
    ///
    /// Switching roles always replaces the snapshot; re-assigning the same
    /// role only replaces it with an equal or newer version.
    fn assign(&self, id: &str, role: &str, expected_current: Option<&str>, snapshot: &Snapshot) -> Result<Principal, DirectoryError>;

    /// Largest batch `write_snapshots` accepts
    fn max_batch_size(&self) -> usize {
        DEFAULT_BATCH_SIZE
    }
}

// ============================================================================
// LMDB-backed directory
// ============================================================================

/// [`Directory`] stored next to the registry, one write transaction per batch.
#[derive(Clone)]
pub struct LmdbDirectory {
    store: Store,
    max_batch: usize,
}

fn storage(e: Error) -> DirectoryError {
    match e {
        Error::NotFound { id, .. } => DirectoryError::NotFound(id),
        Error::Directory(d) => d,
        other => DirectoryError::Storage(other.to_string()),
    }
}

impl LmdbDirectory {
    pub fn new(store: Store) -> Self {
        LmdbDirectory { store, max_batch: DEFAULT_BATCH_SIZE }
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    /// Insert or replace a principal, keeping the role index in step.
    pub fn put_principal(&self, principal: &Principal) -> Result<(), DirectoryError> {
        self.store
            .write(|d, tx| {
                if let Some(old) = d.principals.get(tx, &principal.id)? {
                    if let Some(r) = old.assigned_role {
                        d.by_role.delete(tx, &role_member_key(&r, &old.id)?)?;
                    }
                }
                if let Some(r) = &principal.assigned_role {
                    d.by_role.put(tx, &role_member_key(r, &principal.id)?, &())?;
                }
                d.principals.put(tx, &principal.id, principal)?;
                Ok(())
            })
            .map_err(storage)
    }

    /// Create a principal with no role. Idempotent for an existing id.
    pub fn create_principal(&self, id: &str, super_admin: bool) -> Result<Principal, DirectoryError> {
        if let Some(p) = self.get_principal(id)? {
            return Ok(p);
        }
        let p = Principal::new(id).with_super_admin(super_admin);
        self.put_principal(&p)?;
        Ok(p)
    }

    pub fn count(&self) -> Result<u64, DirectoryError> {
        self.store.read(|d, tx| Ok(d.principals.len(tx)?)).map_err(storage)
    }
}

impl Directory for LmdbDirectory {
    fn principals_with_role(&self, role: &str) -> Result<Vec<PrincipalId>, DirectoryError> {
        self.store
            .read(|d, tx| {
                let prefix = build_key(&[role])?;
                let mut r = Vec::new();
                for item in d.by_role.prefix_iter(tx, &prefix)? {
                    let (k, ()) = item?;
                    if let Some(id) = get_part(k, 1) {
                        r.push(id.to_string());
                    }
                }
                Ok(r)
            })
            .map_err(storage)
    }

    fn get_principal(&self, id: &str) -> Result<Option<Principal>, DirectoryError> {
        self.store.read(|d, tx| Ok(d.principals.get(tx, id)?)).map_err(storage)
    }

    fn write_snapshots(&self, batch: &[SnapshotWrite]) -> Result<usize, DirectoryError> {
        if batch.len() > self.max_batch {
            return Err(DirectoryError::BatchTooLarge { len: batch.len(), max: self.max_batch });
        }
        self.store
            .write(|d, tx| {
                let mut applied = 0;
                for w in batch {
                    let Some(mut p) = d.principals.get(tx, &w.principal)? else { continue };
                    if p.assigned_role.as_deref() != Some(w.role.as_str()) {
                        continue;
                    }
                    if p.snapshot.as_ref().is_some_and(|s| s.role_version >= w.snapshot.role_version) {
                        continue;
                    }
                    p.snapshot = Some(w.snapshot.clone());
                    d.principals.put(tx, &p.id, &p)?;
                    applied += 1;
                }
                Ok(applied)
            })
            .map_err(storage)
    }

    fn assign(&self, id: &str, role: &str, expected_current: Option<&str>, snapshot: &Snapshot) -> Result<Principal, DirectoryError> {
        self.store
            .write(|d, tx| {
                let mut p = d.principals.get(tx, id)?.ok_or_else(|| Error::principal_not_found(id))?;
                if p.assigned_role.as_deref() != expected_current {
                    return Err(Error::Directory(DirectoryError::RoleChanged {
                        principal: id.to_string(),
                        expected: expected_current.map(str::to_string),
                        actual: p.assigned_role,
                    }));
                }
                match p.assigned_role.as_deref() {
                    Some(current) if current == role => {
                        if p.snapshot.as_ref().is_some_and(|s| s.role_version > snapshot.role_version) {
                            return Ok(p);
                        }
                    }
                    current => {
                        if let Some(old) = current {
                            d.by_role.delete(tx, &role_member_key(old, id)?)?;
                        }
                        d.by_role.put(tx, &role_member_key(role, id)?, &())?;
                        p.assigned_role = Some(role.to_string());
                    }
                }
                p.snapshot = Some(snapshot.clone());
                d.principals.put(tx, id, &p)?;
                Ok(p)
            })
            .map_err(storage)
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch
    }
}
