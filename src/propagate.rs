//! Propagation of role edits to principal snapshots
//!
//! A committed role edit leaves a pending marker in the store. The
//! [`Propagator`] worker owning the role picks the job up, enumerates the
//! role's principals once, and writes their snapshots in bounded atomic batches with retries.
//! Batches that still fail are persisted as [`PropagationFailure`] records
//! instead of being dropped. A job whose version has been overtaken by a
//! newer edit stops writing; the newer job converges instead.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, RetryPolicy};
use crate::db::Store;
use crate::directory::{Directory, DirectoryError, PrincipalId, Snapshot, SnapshotWrite};
use crate::error::{Error, Result};
use crate::keys::{build_key, failure_key};
use crate::registry::{RoleId, RoleRegistry};

/// Propagate `role` as of `version`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub role: RoleId,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureStage {
    /// Listing the role's principals failed; every holder is affected.
    Enumerate,
    /// One batch write failed; only its principals are affected.
    Write,
}

/// Durable remediation record for work that exhausted its retries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationFailure {
    pub role: RoleId,
    pub version: u64,
    pub batch: usize,
    pub stage: FailureStage,
    pub principals: Vec<PrincipalId>,
    pub attempts: u32,
    pub error: String,
    /// Unix epoch millis
    pub recorded_at: u64,
}

impl PropagationFailure {
    pub fn covers(&self, principal: &str) -> bool {
        self.stage == FailureStage::Enumerate || self.principals.iter().any(|p| p == principal)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationReport {
    pub role: RoleId,
    pub version: u64,
    /// Principals found at enumeration time
    pub principals: usize,
    pub batches: usize,
    /// Snapshots that actually changed
    pub written: usize,
    pub failed_batches: usize,
    /// A newer edit overtook this job
    pub superseded: bool,
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or_default()
}

// ============================================================================
// Retry
// ============================================================================

/// Last error after the retry budget ran out (or a non-retryable error).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted {
    pub error: DirectoryError,
    pub attempts: u32,
}

fn jitter(max: Duration) -> Duration {
    let ms = max.as_millis() as u64;
    if ms == 0 {
        return Duration::ZERO;
    }
    let mut buf = [0u8; 8];
    match getrandom::getrandom(&mut buf) {
        Ok(()) => Duration::from_millis(u64::from_le_bytes(buf) % (ms + 1)),
        Err(_) => Duration::ZERO,
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based), capped, plus up to 50% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = self.base_delay.saturating_mul(1u32 << attempt.min(16)).min(self.max_delay);
        capped + jitter(capped / 2)
    }

    /// Call `f` until it succeeds, fails non-retryably, or attempts run out.
    pub fn run<T>(&self, what: &str, mut f: impl FnMut() -> std::result::Result<T, DirectoryError>) -> std::result::Result<T, RetryExhausted> {
        let max = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < max => {
                    let d = self.delay(attempt - 1);
                    tracing::warn!(what, attempt, max, delay = ?d, error = %e, "directory call failed, retrying");
                    thread::sleep(d);
                }
                Err(error) => return Err(RetryExhausted { error, attempts: attempt }),
            }
        }
    }
}

// ============================================================================
// Failure records
// ============================================================================

pub fn record_failure(store: &Store, failure: &PropagationFailure) -> Result<()> {
    let key = failure_key(&failure.role, failure.version, failure.batch)?;
    store.write(|d, tx| Ok(d.failures.put(tx, &key, failure)?))?;
    tracing::error!(
        role = %failure.role,
        version = failure.version,
        batch = failure.batch,
        principals = failure.principals.len(),
        attempts = failure.attempts,
        error = %failure.error,
        "propagation failed; remediation record stored"
    );
    Ok(())
}

/// All stored failure records, ordered by role then version
pub fn list_failures(store: &Store) -> Result<Vec<PropagationFailure>> {
    store.read(|d, tx| {
        let mut r = Vec::new();
        for item in d.failures.iter(tx)? {
            r.push(item?.1);
        }
        Ok(r)
    })
}

/// Records for one role at one version
pub fn failures_for(store: &Store, role: &str, version: u64) -> Result<Vec<PropagationFailure>> {
    let prefix = build_key(&[role, &format!("{:020}", version)])?;
    store.read(|d, tx| {
        let mut r = Vec::new();
        for item in d.failures.prefix_iter(tx, &prefix)? {
            r.push(item?.1);
        }
        Ok(r)
    })
}

/// Delete a role's records older than `version`; a completed run at `version` re-covered them.
fn prune_failures(store: &Store, role: &str, version: u64) -> Result<usize> {
    let prefix = build_key(&[role])?;
    store.write(|d, tx| {
        let mut stale = Vec::new();
        for item in d.failures.prefix_iter(tx, &prefix)? {
            let (k, f) = item?;
            if f.version < version {
                stale.push(k.to_vec());
            }
        }
        for k in &stale {
            d.failures.delete(tx, k)?;
        }
        Ok(stale.len())
    })
}

/// Delete the given records; returns how many were still present.
pub fn remove_failures(store: &Store, records: &[PropagationFailure]) -> Result<usize> {
    let keys = records.iter().map(|f| failure_key(&f.role, f.version, f.batch)).collect::<Result<Vec<_>>>()?;
    store.write(|d, tx| {
        let mut n = 0;
        for k in &keys {
            if d.failures.delete(tx, k)? {
                n += 1;
            }
        }
        Ok(n)
    })
}

// ============================================================================
// Coordinator
// ============================================================================

/// Runs propagation jobs against a registry and a directory.
pub struct Coordinator {
    registry: RoleRegistry,
    directory: Arc<dyn Directory>,
    config: EngineConfig,
}

impl Coordinator {
    pub fn new(registry: RoleRegistry, directory: Arc<dyn Directory>, config: EngineConfig) -> Self {
        Coordinator { registry, directory, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size.min(self.directory.max_batch_size()).max(1)
    }

    fn fail(&self, job: &Job, batch: usize, stage: FailureStage, principals: Vec<PrincipalId>, e: RetryExhausted) -> Result<()> {
        record_failure(self.registry.store(), &PropagationFailure {
            role: job.role.clone(),
            version: job.version,
            batch,
            stage,
            principals,
            attempts: e.attempts,
            error: e.error.to_string(),
            recorded_at: now_millis(),
        })
    }

    /// Run one job to completion, supersession, or recorded failure.
    ///
    /// Only storage errors on the registry side are returned; they leave the
    /// pending marker in place so the job is resumed later.
    pub fn run(&self, job: &Job) -> Result<PropagationReport> {
        let mut report = PropagationReport { role: job.role.clone(), version: job.version, ..Default::default() };
        let role = self.registry.get_role(&job.role)?;
        if role.version != job.version {
            tracing::info!(role = %job.role, job = job.version, latest = role.version, "propagation superseded before start");
            report.superseded = role.version > job.version;
            self.registry.clear_pending(&job.role, job.version)?;
            return Ok(report);
        }
        let snapshot = Snapshot::of(&role);

        // T0: principals assigned after this point are stamped by assignment
        let ids = match self.config.retry.run("principals_with_role", || self.directory.principals_with_role(&job.role)) {
            Ok(ids) => ids,
            Err(e) => {
                self.fail(job, 0, FailureStage::Enumerate, Vec::new(), e)?;
                report.failed_batches = 1;
                self.registry.clear_pending(&job.role, job.version)?;
                return Ok(report);
            }
        };
        report.principals = ids.len();

        for (i, chunk) in ids.chunks(self.batch_size()).enumerate() {
            if self.registry.get_role(&job.role)?.version != job.version {
                tracing::info!(role = %job.role, version = job.version, batch = i, "propagation superseded, abandoning");
                report.superseded = true;
                break;
            }
            let writes: Vec<SnapshotWrite> = chunk
                .iter()
                .map(|p| SnapshotWrite { principal: p.clone(), role: job.role.clone(), snapshot: snapshot.clone() })
                .collect();
            report.batches += 1;
            match self.config.retry.run("write_snapshots", || self.directory.write_snapshots(&writes)) {
                Ok(n) => {
                    tracing::debug!(role = %job.role, version = job.version, batch = i, size = writes.len(), written = n, "batch committed");
                    report.written += n;
                }
                Err(e) => {
                    self.fail(job, i, FailureStage::Write, chunk.to_vec(), e)?;
                    report.failed_batches += 1;
                }
            }
        }

        if !report.superseded {
            let pruned = prune_failures(self.registry.store(), &job.role, job.version)?;
            if pruned > 0 {
                tracing::info!(role = %job.role, pruned, "cleared failure records superseded by this run");
            }
        }
        self.registry.clear_pending(&job.role, job.version)?;
        tracing::info!(
            role = %job.role,
            version = job.version,
            principals = report.principals,
            written = report.written,
            failed_batches = report.failed_batches,
            superseded = report.superseded,
            "propagation finished"
        );
        Ok(report)
    }
}

impl Coordinator {
    /// Run the pending marker of every role `owns` accepts.
    ///
    /// Picks up markers whose job never reached a worker, e.g. an edit whose
    /// submit failed or a run aborted by a storage error.
    pub fn resume_stalled(&self, owns: impl Fn(&str) -> bool) -> Result<usize> {
        let mut resumed = 0;
        for (role, version) in self.registry.pending()? {
            if !owns(&role) {
                continue;
            }
            tracing::info!(%role, version, "resuming stalled propagation");
            let job = Job { role, version };
            if let Err(e) = self.run(&job) {
                tracing::error!(role = %job.role, version = job.version, error = %e, "propagation aborted; marker kept for resume");
            }
            resumed += 1;
        }
        Ok(resumed)
    }
}

// ============================================================================
// Background worker
// ============================================================================

enum Msg {
    Job(Job),
    Flush(Sender<()>),
}

/// Worker that owns `role` among `shards` workers
pub fn shard_of(role: &str, shards: usize) -> usize {
    let mut h = DefaultHasher::new();
    role.hash(&mut h);
    (h.finish() % shards.max(1) as u64) as usize
}

fn work(coordinator: &Coordinator, rx: Receiver<Msg>, shard: usize, shards: usize) {
    // Instant arithmetic overflows on absurd intervals
    let interval = coordinator.config().resume_interval.min(Duration::from_secs(365 * 24 * 3600));
    let mut next_sweep = Instant::now() + interval;
    loop {
        let now = Instant::now();
        if now >= next_sweep {
            match coordinator.resume_stalled(|role| shard_of(role, shards) == shard) {
                Ok(0) => {}
                Ok(n) => tracing::debug!(shard, resumed = n, "pending sweep finished"),
                Err(e) => tracing::error!(shard, error = %e, "pending sweep failed"),
            }
            next_sweep = Instant::now() + interval;
            continue;
        }
        match rx.recv_timeout(next_sweep - now) {
            Ok(Msg::Job(job)) => {
                if let Err(e) = coordinator.run(&job) {
                    tracing::error!(role = %job.role, version = job.version, error = %e, "propagation aborted; marker kept for resume");
                }
            }
            Ok(Msg::Flush(ack)) => {
                let _ = ack.send(());
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Pool of background threads draining propagation jobs.
///
/// Jobs are routed by [`shard_of`], so one role's jobs run in submission
/// order on a single thread while a slow role only holds up its own shard.
pub struct Propagator {
    senders: Mutex<Vec<Sender<Msg>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

fn stopped() -> Error {
    Error::Storage("propagation worker stopped".into())
}

impl Propagator {
    pub fn start(coordinator: Arc<Coordinator>) -> Result<Self> {
        let shards = coordinator.config().workers.max(1);
        let mut senders = Vec::with_capacity(shards);
        let mut handles = Vec::with_capacity(shards);
        for shard in 0..shards {
            let (tx, rx) = mpsc::channel::<Msg>();
            let coordinator = coordinator.clone();
            let handle = thread::Builder::new()
                .name(format!("rolecap-propagator-{}", shard))
                .spawn(move || work(&coordinator, rx, shard, shards))?;
            senders.push(tx);
            handles.push(handle);
        }
        tracing::debug!(workers = shards, "propagation workers started");
        Ok(Propagator { senders: Mutex::new(senders), handles: Mutex::new(handles) })
    }

    /// Queue a job on the worker owning its role - fire and forget
    pub fn submit(&self, job: Job) -> Result<()> {
        let senders = self.senders.lock().unwrap_or_else(|p| p.into_inner());
        if senders.is_empty() {
            return Err(stopped());
        }
        let tx = &senders[shard_of(&job.role, senders.len())];
        tx.send(Msg::Job(job)).map_err(|_| stopped())
    }

    /// Block until every job submitted before this call has run.
    pub fn flush(&self) -> Result<()> {
        let acks = {
            let senders = self.senders.lock().unwrap_or_else(|p| p.into_inner());
            if senders.is_empty() {
                return Err(stopped());
            }
            let mut acks = Vec::with_capacity(senders.len());
            for tx in senders.iter() {
                let (ack_tx, ack_rx) = mpsc::channel();
                tx.send(Msg::Flush(ack_tx)).map_err(|_| stopped())?;
                acks.push(ack_rx);
            }
            acks
        };
        for ack in acks {
            ack.recv().map_err(|_| stopped())?;
        }
        Ok(())
    }

    /// Stop accepting jobs, finish queued ones, join the threads.
    pub fn shutdown(&self) {
        self.senders.lock().unwrap_or_else(|p| p.into_inner()).clear();
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|p| p.into_inner()));
        for h in handles {
            let _ = h.join();
        }
    }
}

impl Drop for Propagator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
