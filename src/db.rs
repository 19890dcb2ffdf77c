//! LMDB environment and database handles
//!
//! A [`Store`] is constructed explicitly and handed to the registry and the
//! bundled directory, so every test can run against its own environment.

use std::path::Path;

use byteorder::BigEndian;
use heed::types::{Bytes, SerdeJson, Str, Unit, U64};
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};

use crate::caps::{vocabulary_digest, VOCABULARY_VERSION};
use crate::constants::MAX_DBS;
use crate::directory::Principal;
use crate::error::{Error, Result};
use crate::propagate::PropagationFailure;
use crate::registry::Role;

// Database type aliases
pub type VersionDb = Database<Str, U64<BigEndian>>;

/// All database handles
#[derive(Clone, Copy)]
pub struct Dbs {
    /// role id -> role record
    pub roles: Database<Str, SerdeJson<Role>>,
    /// role id -> version still waiting for propagation
    pub pending: VersionDb,
    /// [role][version][batch] -> failure record
    pub failures: Database<Bytes, SerdeJson<PropagationFailure>>,
    pub meta: Database<Str, Str>,
    /// principal id -> principal (bundled directory)
    pub principals: Database<Str, SerdeJson<Principal>>,
    /// [role][principal] -> () (bundled directory)
    pub by_role: Database<Bytes, Unit>,
}

/// Shared handle to one LMDB environment
#[derive(Clone)]
pub struct Store {
    env: Env,
    dbs: Dbs,
}

impl Store {
    /// Open (creating if needed) the environment at `path`.
    pub fn open(path: impl AsRef<Path>, map_size: usize) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        // SAFETY: LMDB requires no other process to open this path with different options concurrently.
        let env = unsafe { EnvOpenOptions::new().map_size(map_size).max_dbs(MAX_DBS).open(path)? };
        let mut tx = env.write_txn()?;
        let dbs = Dbs {
            roles: env.create_database(&mut tx, Some("roles"))?,
            pending: env.create_database(&mut tx, Some("pending"))?,
            failures: env.create_database(&mut tx, Some("failures"))?,
            meta: env.create_database(&mut tx, Some("meta"))?,
            principals: env.create_database(&mut tx, Some("principals"))?,
            by_role: env.create_database(&mut tx, Some("by_role"))?,
        };
        check_vocabulary(&dbs, &mut tx)?;
        tx.commit()?;
        tracing::debug!(path = %path.display(), "opened store");
        Ok(Store { env, dbs })
    }

    /// Execute a read-only operation
    #[inline]
    pub fn read<T, F: FnOnce(&Dbs, &RoTxn) -> Result<T>>(&self, f: F) -> Result<T> {
        f(&self.dbs, &self.env.read_txn()?)
    }

    /// Execute a write; commits only if `f` succeeds
    #[inline]
    pub fn write<T, F: FnOnce(&Dbs, &mut RwTxn) -> Result<T>>(&self, f: F) -> Result<T> {
        let mut txn = self.env.write_txn()?;
        let r = f(&self.dbs, &mut txn)?;
        txn.commit()?;
        Ok(r)
    }
}

/// Stamp the vocabulary digest on first open; refuse a store written under another vocabulary.
fn check_vocabulary(dbs: &Dbs, tx: &mut RwTxn) -> Result<()> {
    let digest = vocabulary_digest();
    match dbs.meta.get(tx, "vocab_digest")? {
        Some(stored) if stored == digest => Ok(()),
        Some(stored) => Err(Error::Validation(format!(
            "store was written with capability vocabulary {} (this build: v{} {})",
            stored, VOCABULARY_VERSION, digest
        ))),
        None => {
            dbs.meta.put(tx, "vocab_digest", &digest)?;
            dbs.meta.put(tx, "vocab_version", &VOCABULARY_VERSION.to_string())?;
            Ok(())
        }
    }
}
