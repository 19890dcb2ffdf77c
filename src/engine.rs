//! The engine: registry, directory and propagation worker behind one handle

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::assign::assign_role;
use crate::bootstrap::bootstrap;
use crate::caps::CapabilitySet;
use crate::check::has_capability;
use crate::config::EngineConfig;
use crate::db::Store;
use crate::directory::{Directory, LmdbDirectory, Principal};
use crate::error::{Error, Result};
use crate::hierarchy::{self, Actor, Level};
use crate::propagate::{failures_for, list_failures, remove_failures, Coordinator, Job, PropagationFailure, PropagationReport, Propagator};
use crate::registry::{Role, RoleRegistry};

/// Where a principal's snapshot stands relative to its role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Unassigned,
    Synced,
    /// The role changed and this principal has not been rewritten yet.
    PendingPropagation,
    /// Retries ran out for this principal's batch; see the failure records.
    FailedPropagation,
}

pub struct Engine {
    registry: RoleRegistry,
    directory: Arc<dyn Directory>,
    coordinator: Arc<Coordinator>,
    propagator: Propagator,
    config: EngineConfig,
}

impl Engine {
    /// Build an engine over `store`, seeding the role catalog on first use and
    /// resuming any propagation left pending by a previous process.
    pub fn new(store: Store, directory: Arc<dyn Directory>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let registry = RoleRegistry::new(store);
        bootstrap(&registry)?;
        let coordinator = Arc::new(Coordinator::new(registry.clone(), directory.clone(), config.clone()));
        let propagator = Propagator::start(coordinator.clone())?;
        for (role, version) in registry.pending()? {
            tracing::info!(%role, version, "resuming pending propagation");
            propagator.submit(Job { role, version })?;
        }
        Ok(Engine { registry, directory, coordinator, propagator, config })
    }

    /// Open a store at `path` with the bundled LMDB directory.
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<(Self, Arc<LmdbDirectory>)> {
        let store = Store::open(path, config.map_size)?;
        let directory = Arc::new(LmdbDirectory::new(store.clone()).with_max_batch(config.batch_size));
        let engine = Engine::new(store, directory.clone(), config)?;
        Ok((engine, directory))
    }

    pub fn registry(&self) -> &RoleRegistry {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    /// Synchronous access to the propagation logic
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Roles
    // ========================================================================

    pub fn get_role(&self, id: &str) -> Result<Role> {
        self.registry.get_role(id)
    }

    pub fn list_roles(&self) -> Result<Vec<Role>> {
        self.registry.list_roles()
    }

    #[inline]
    pub fn can_administer(&self, acting: Level, target: Level) -> bool {
        hierarchy::can_administer(acting, target)
    }

    /// Roles `actor` may edit or assign, most authoritative first
    pub fn administrable_roles(&self, actor: &Actor) -> Result<Vec<Role>> {
        let level = self.registry.actor_level(actor)?;
        Ok(self
            .list_roles()?
            .into_iter()
            .filter(|r| level.map_or(true, |l| hierarchy::can_administer(l, r.level)))
            .collect())
    }

    /// Replace a role's capabilities and queue propagation.
    ///
    /// Propagation is not part of the result: once the edit commits it is
    /// carried out by the worker, and failures end up in
    /// [`Engine::propagation_failures`].
    pub fn update_role_capabilities(&self, actor: &Actor, role_id: &str, capabilities: CapabilitySet, base_version: u64) -> Result<Role> {
        let update = self.registry.update_capabilities(actor, role_id, capabilities, base_version)?;
        if update.changed {
            tracing::info!(role = role_id, version = update.role.version, granted = capabilities.count(), "role capabilities updated");
            let job = Job { role: update.role.id.clone(), version: update.role.version };
            if let Err(e) = self.propagator.submit(job) {
                tracing::warn!(role = role_id, error = %e, "could not queue propagation; the pending sweep resumes it");
            }
        }
        Ok(update.role)
    }

    /// [`Engine::update_role_capabilities`] from a name -> bool map, validated for totality first.
    pub fn update_role_capabilities_map(&self, actor: &Actor, role_id: &str, capabilities: &BTreeMap<String, bool>, base_version: u64) -> Result<Role> {
        let set = CapabilitySet::from_map(capabilities)?;
        self.update_role_capabilities(actor, role_id, set, base_version)
    }

    // ========================================================================
    // Principals
    // ========================================================================

    pub fn assign_role(&self, actor: &Actor, principal_id: &str, role_id: &str) -> Result<Principal> {
        assign_role(&self.registry, self.directory.as_ref(), &self.config.retry, actor, principal_id, role_id)
    }

    /// Actor for a stored principal
    pub fn actor_for(&self, principal_id: &str) -> Result<Actor> {
        let p = self.directory.get_principal(principal_id)?.ok_or_else(|| Error::principal_not_found(principal_id))?;
        Ok(Actor::from(&p))
    }

    #[inline]
    pub fn has_capability(&self, principal: &Principal, capability: impl AsRef<str>) -> bool {
        has_capability(principal, capability)
    }

    /// Check by id. Unknown principals and directory faults deny.
    pub fn has_capability_for(&self, principal_id: &str, capability: impl AsRef<str>) -> bool {
        match self.directory.get_principal(principal_id) {
            Ok(Some(p)) => has_capability(&p, capability),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(principal = principal_id, capability = capability.as_ref(), error = %e, "directory fault during check; denying");
                false
            }
        }
    }

    pub fn sync_state(&self, principal_id: &str) -> Result<SyncState> {
        let p = self.directory.get_principal(principal_id)?.ok_or_else(|| Error::principal_not_found(principal_id))?;
        let Some(role_id) = p.assigned_role.as_deref() else {
            return Ok(SyncState::Unassigned);
        };
        let role = self.registry.get_role(role_id)?;
        if p.snapshot.as_ref().is_some_and(|s| s.role_version == role.version) {
            return Ok(SyncState::Synced);
        }
        let failed = failures_for(self.registry.store(), role_id, role.version)?.iter().any(|f| f.covers(principal_id));
        Ok(if failed { SyncState::FailedPropagation } else { SyncState::PendingPropagation })
    }

    // ========================================================================
    // Propagation
    // ========================================================================

    pub fn propagation_failures(&self) -> Result<Vec<PropagationFailure>> {
        list_failures(self.registry.store())
    }

    /// Re-run propagation for every role with failure records.
    ///
    /// Roles are marked pending before their records are cleared, so a crash
    /// in between still resumes them. Returns how many roles were queued.
    pub fn retry_failed_propagations(&self) -> Result<usize> {
        let failures = self.propagation_failures()?;
        let roles: BTreeSet<&str> = failures.iter().map(|f| f.role.as_str()).collect();
        let mut jobs = Vec::with_capacity(roles.len());
        for role in roles {
            let version = self.registry.get_role(role)?.version;
            self.registry.mark_pending(role, version)?;
            jobs.push(Job { role: role.to_string(), version });
        }
        remove_failures(self.registry.store(), &failures)?;
        for job in &jobs {
            tracing::info!(role = %job.role, version = job.version, "retrying failed propagation");
            self.propagator.submit(job.clone())?;
        }
        Ok(jobs.len())
    }

    /// Propagate a role's current capabilities on the calling thread.
    pub fn propagate(&self, role_id: &str) -> Result<PropagationReport> {
        let role = self.registry.get_role(role_id)?;
        self.coordinator.run(&Job { role: role.id, version: role.version })
    }

    /// Block until every queued propagation has run.
    pub fn flush(&self) -> Result<()> {
        self.propagator.flush()
    }

    /// Stop the worker after draining queued jobs.
    pub fn shutdown(&self) {
        self.propagator.shutdown();
    }
}
