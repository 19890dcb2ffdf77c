//! Engine configuration

use std::time::Duration;

use crate::constants::{
    DEFAULT_BASE_DELAY, DEFAULT_BATCH_SIZE, DEFAULT_MAP_SIZE, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY, DEFAULT_RESUME_INTERVAL,
    DEFAULT_WORKERS,
};
use crate::error::{Error, Result};

/// Bounded exponential backoff for directory calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries including the first; at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { max_attempts: DEFAULT_MAX_ATTEMPTS, base_delay: DEFAULT_BASE_DELAY, max_delay: DEFAULT_MAX_DELAY }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on principals per atomic directory write
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// LMDB map size in bytes
    pub map_size: usize,
    /// Propagation worker threads. Each role always lands on the same one.
    pub workers: usize,
    /// How long a worker idles before re-queuing stalled pending markers
    pub resume_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
            map_size: DEFAULT_MAP_SIZE,
            workers: DEFAULT_WORKERS,
            resume_interval: DEFAULT_RESUME_INTERVAL,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `ROLECAP_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut c = EngineConfig::default();
        if let Some(v) = parse::<usize>(&get, "ROLECAP_BATCH_SIZE")? {
            c.batch_size = v;
        }
        if let Some(v) = parse::<u32>(&get, "ROLECAP_MAX_ATTEMPTS")? {
            c.retry.max_attempts = v;
        }
        if let Some(v) = parse::<u64>(&get, "ROLECAP_BACKOFF_MS")? {
            c.retry.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64>(&get, "ROLECAP_MAX_BACKOFF_MS")? {
            c.retry.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse::<usize>(&get, "ROLECAP_MAP_SIZE")? {
            c.map_size = v;
        }
        if let Some(v) = parse::<usize>(&get, "ROLECAP_WORKERS")? {
            c.workers = v;
        }
        if let Some(v) = parse::<u64>(&get, "ROLECAP_RESUME_MS")? {
            c.resume_interval = Duration::from_millis(v);
        }
        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        if self.resume_interval.is_zero() {
            return Err(Error::Config("resume interval must be positive".into()));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(Error::Config(format!(
                "base backoff {:?} exceeds max backoff {:?}",
                self.retry.base_delay, self.retry.max_delay
            )));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|e| Error::Config(format!("{}={:?}: {}", key, raw, e))),
    }
}
