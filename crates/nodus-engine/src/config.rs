//! Pool and loop configuration
//!
//! Both structs deserialize from the runtime's TOML config with every field
//! optional. Pool sizing can also be overridden from the environment.

use crate::error::LoopError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Environment override for the number of core pool threads
pub const ENV_CORE_THREADS: &str = "NODUS_POOL_CORE_THREADS";
/// Environment override for the maximum number of pool threads
pub const ENV_MAX_THREADS: &str = "NODUS_POOL_MAX_THREADS";
/// Environment override for the idle thread timeout, in seconds
pub const ENV_THREAD_TIMEOUT: &str = "NODUS_POOL_THREAD_TIMEOUT";
/// Environment override for the task queue capacity
pub const ENV_QUEUE_SIZE: &str = "NODUS_POOL_QUEUE_SIZE";

/// Worker pool sizing.
///
/// `None` for `max_threads` or `queue_size` means unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Threads kept around even when idle (until core timeout is allowed)
    pub core_threads: usize,
    /// Upper bound on threads, reached only once the queue is full
    pub max_threads: Option<usize>,
    /// Idle time after which a surplus thread exits
    pub keep_alive_secs: u64,
    /// Capacity of the task queue
    pub queue_size: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_threads: num_cpus::get() * 2,
            max_threads: None,
            keep_alive_secs: 15,
            queue_size: None,
        }
    }
}

impl PoolConfig {
    /// Defaults overridden by `NODUS_POOL_*` environment variables
    pub fn from_env() -> Result<Self, LoopError> {
        Self::default().with_env_overrides()
    }

    /// Apply `NODUS_POOL_*` environment variables on top of this config
    pub fn with_env_overrides(mut self) -> Result<Self, LoopError> {
        if let Some(n) = env_usize(ENV_CORE_THREADS)? {
            self.core_threads = n;
        }
        if let Some(n) = env_usize(ENV_MAX_THREADS)? {
            self.max_threads = Some(n);
        }
        if let Some(n) = env_usize(ENV_THREAD_TIMEOUT)? {
            self.keep_alive_secs = n as u64;
        }
        if let Some(n) = env_usize(ENV_QUEUE_SIZE)? {
            self.queue_size = Some(n);
        }
        self.validate()?;
        Ok(self)
    }

    /// Check the sizing is coherent
    pub fn validate(&self) -> Result<(), LoopError> {
        if let Some(max) = self.max_threads {
            if max == 0 {
                return Err(LoopError::Config("max_threads must be at least 1".into()));
            }
            if self.core_threads > max {
                return Err(LoopError::Config(format!(
                    "core_threads ({}) exceeds max_threads ({})",
                    self.core_threads, max
                )));
            }
        }
        Ok(())
    }

    /// Effective maximum thread count
    pub fn max_threads(&self) -> usize {
        self.max_threads.unwrap_or(usize::MAX)
    }

    /// Idle timeout as a duration
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

fn env_usize(key: &str) -> Result<Option<usize>, LoopError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| LoopError::Config(format!("{} must be a non-negative integer, got {:?}", key, raw))),
        Err(_) => Ok(None),
    }
}

/// Event loop configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Instance number, shown in logs and thread-local loop identity
    pub instance: u32,
    /// Directory relative paths resolve against; process cwd when unset
    pub work_dir: Option<PathBuf>,
    /// Drain the whole event queue per pass (`false`: one event per pass)
    pub sync_events: bool,
    /// Native loop version the host was built against
    pub expected_native_version: Option<String>,
    /// Log every dispatched event at debug level
    pub log_events: bool,
    /// Pool sizing, used when the loop owns its pool
    pub pool: PoolConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            instance: 0,
            work_dir: None,
            sync_events: true,
            expected_native_version: None,
            log_events: false,
            pool: PoolConfig::default(),
        }
    }
}
