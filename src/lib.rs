//! Rolecap - hierarchical role-based access control
//!
//! Roles sit on a strict level ladder (1 is most authoritative) and carry a
//! total map over a fixed capability vocabulary. Principals hold at most one
//! role plus a snapshot of its capabilities; checks read only the snapshot.
//! Role edits are compare-and-swap on a version token and fan out to
//! snapshots through bounded, retried, atomic batches.
//!
//! ```no_run
//! use rolecap::{Actor, Capability, Engine, EngineConfig, ROLE_ADMIN, ROLE_MANAGER};
//!
//! let (engine, directory) = Engine::open("./data/rolecap.mdb", EngineConfig::default())?;
//! directory.create_principal("alice", false)?;
//! let admin = Actor::role(ROLE_ADMIN);
//! engine.assign_role(&admin, "alice", ROLE_MANAGER)?;
//! assert!(engine.has_capability_for("alice", Capability::ViewReports));
//! # Ok::<(), rolecap::Error>(())
//! ```

pub mod assign;
pub mod bootstrap;
pub mod caps;
pub mod check;
pub mod config;
pub mod constants;
pub mod db;
pub mod directory;
pub mod engine;
pub mod error;
pub mod hierarchy;
pub mod keys;
pub mod propagate;
pub mod registry;

pub use bootstrap::{bootstrap, catalog};
pub use caps::{vocabulary_digest, Capability, CapabilitySet, Domain, VOCABULARY_VERSION};
pub use check::{has_all, has_capability};
pub use config::{EngineConfig, RetryPolicy};
pub use constants::*;
pub use db::Store;
pub use directory::{Directory, DirectoryError, LmdbDirectory, Principal, PrincipalId, Snapshot, SnapshotWrite};
pub use engine::{Engine, SyncState};
pub use error::{Error, Result};
pub use hierarchy::{can_administer, Actor, Level};
pub use propagate::{shard_of, Coordinator, FailureStage, Job, PropagationFailure, PropagationReport, Propagator};
pub use registry::{Role, RoleId, RoleRegistry, RoleUpdate};
