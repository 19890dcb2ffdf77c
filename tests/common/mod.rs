//! Shared test setup: a fresh store per test plus a directory wrapper that injects faults.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rolecap::{
    Actor, Directory, DirectoryError, Engine, EngineConfig, LmdbDirectory, Principal, PrincipalId, RetryPolicy,
    Snapshot, SnapshotWrite, Store, ROLE_ADMIN,
};
use tempfile::TempDir;

/// Small batches and millisecond backoff so retries stay fast
pub fn fast_config(batch_size: usize) -> EngineConfig {
    EngineConfig {
        batch_size,
        retry: RetryPolicy { max_attempts: 3, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(4) },
        ..EngineConfig::default()
    }
}

/// Engine over the bundled directory. Fields drop in order, so the engine closes before its directory is removed.
pub struct Harness {
    pub engine: Engine,
    pub directory: Arc<LmdbDirectory>,
    pub dir: TempDir,
}

pub fn setup(config: EngineConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let (engine, directory) = Engine::open(dir.path(), config).unwrap();
    Harness { engine, directory, dir }
}

/// Engine over a [`FaultyDirectory`] wrapping the bundled one.
pub struct FaultyHarness {
    pub engine: Engine,
    pub faulty: Arc<FaultyDirectory>,
    pub inner: Arc<LmdbDirectory>,
    pub store: Store,
    pub dir: TempDir,
}

pub fn setup_faulty(config: EngineConfig) -> FaultyHarness {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), config.map_size).unwrap();
    let inner = Arc::new(LmdbDirectory::new(store.clone()).with_max_batch(config.batch_size));
    let faulty = Arc::new(FaultyDirectory::new(inner.clone()));
    let engine = Engine::new(store.clone(), faulty.clone(), config).unwrap();
    FaultyHarness { engine, faulty, inner, store, dir }
}

/// Create `n` principals named `{prefix}{i}` and assign them `role` as admin.
pub fn populate(engine: &Engine, directory: &LmdbDirectory, prefix: &str, n: usize, role: &str) -> Vec<String> {
    let admin = Actor::role(ROLE_ADMIN);
    (0..n)
        .map(|i| {
            let id = format!("{}{}", prefix, i);
            directory.create_principal(&id, false).unwrap();
            engine.assign_role(&admin, &id, role).unwrap();
            id
        })
        .collect()
}

type Hook = Box<dyn FnOnce() + Send>;

/// Delegates to an inner directory, failing or running hooks on demand.
pub struct FaultyDirectory {
    inner: Arc<LmdbDirectory>,
    /// Upcoming `write_snapshots` calls that time out
    pub transient_writes: AtomicUsize,
    /// Batches containing any of these fail as unavailable
    pub poisoned: Mutex<HashSet<PrincipalId>>,
    pub fail_enumerate: AtomicBool,
    pub write_calls: AtomicUsize,
    before_write: Mutex<Option<Hook>>,
    before_assign: Mutex<Option<Hook>>,
}

impl FaultyDirectory {
    pub fn new(inner: Arc<LmdbDirectory>) -> Self {
        FaultyDirectory {
            inner,
            transient_writes: AtomicUsize::new(0),
            poisoned: Mutex::new(HashSet::new()),
            fail_enumerate: AtomicBool::new(false),
            write_calls: AtomicUsize::new(0),
            before_write: Mutex::new(None),
            before_assign: Mutex::new(None),
        }
    }

    pub fn poison(&self, id: &str) {
        self.poisoned.lock().unwrap().insert(id.to_string());
    }

    pub fn heal(&self) {
        self.poisoned.lock().unwrap().clear();
        self.transient_writes.store(0, Ordering::SeqCst);
        self.fail_enumerate.store(false, Ordering::SeqCst);
    }

    /// Run `f` once, just before the next snapshot batch is applied.
    pub fn on_next_write(&self, f: impl FnOnce() + Send + 'static) {
        *self.before_write.lock().unwrap() = Some(Box::new(f));
    }

    /// Run `f` once, just before the next assignment is applied.
    pub fn on_next_assign(&self, f: impl FnOnce() + Send + 'static) {
        *self.before_assign.lock().unwrap() = Some(Box::new(f));
    }
}

impl Directory for FaultyDirectory {
    fn principals_with_role(&self, role: &str) -> Result<Vec<PrincipalId>, DirectoryError> {
        if self.fail_enumerate.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("enumeration disabled".into()));
        }
        self.inner.principals_with_role(role)
    }

    fn get_principal(&self, id: &str) -> Result<Option<Principal>, DirectoryError> {
        self.inner.get_principal(id)
    }

    fn write_snapshots(&self, batch: &[SnapshotWrite]) -> Result<usize, DirectoryError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let hook = self.before_write.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        let transient = self.transient_writes.load(Ordering::SeqCst);
        if transient > 0 {
            self.transient_writes.store(transient - 1, Ordering::SeqCst);
            return Err(DirectoryError::Timeout);
        }
        let poisoned = self.poisoned.lock().unwrap();
        if batch.iter().any(|w| poisoned.contains(&w.principal)) {
            return Err(DirectoryError::Unavailable("poisoned principal in batch".into()));
        }
        drop(poisoned);
        self.inner.write_snapshots(batch)
    }

    fn assign(&self, id: &str, role: &str, expected_current: Option<&str>, snapshot: &Snapshot) -> Result<Principal, DirectoryError> {
        let hook = self.before_assign.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        self.inner.assign(id, role, expected_current, snapshot)
    }

    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }
}
