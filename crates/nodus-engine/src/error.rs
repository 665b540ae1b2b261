//! Error types for the event loop core

use nodus_sdk::CallbackError;
use std::fmt;
use std::io;
use thiserror::Error;

/// Exit code for an uncaught script exception
pub const EXIT_UNCAUGHT: i32 = 1;

/// Exit code when the uncaught-exception handler itself failed
pub const EXIT_HANDLER_FAILED: i32 = 7;

/// Event loop errors
#[derive(Debug, Error)]
pub enum LoopError {
    /// A callback error nobody handled; the loop has been stopped
    #[error("uncaught exception: {0}")]
    Uncaught(UncaughtError),

    /// The native loop is not the version the host was built against
    #[error("native loop version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version the configuration asked for
        expected: String,
        /// Version compiled into this crate
        found: String,
    },

    /// Work was submitted after the pool was shut down
    #[error("worker pool has been shut down")]
    PoolShutdown,

    /// A pool thread could not be spawned
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] io::Error),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl LoopError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            LoopError::Uncaught(e) => e.exit_code,
            _ => EXIT_UNCAUGHT,
        }
    }

    /// The uncaught error, if this is one
    pub fn as_uncaught(&self) -> Option<&UncaughtError> {
        match self {
            LoopError::Uncaught(e) => Some(e),
            _ => None,
        }
    }
}

impl From<UncaughtError> for LoopError {
    fn from(e: UncaughtError) -> Self {
        LoopError::Uncaught(e)
    }
}

/// Root cause of an abnormal loop exit plus everything that failed after it.
#[derive(Debug, Clone)]
pub struct UncaughtError {
    /// First unhandled error
    pub root: CallbackError,
    /// Errors raised later in the same iteration (or during finalization)
    pub suppressed: Vec<CallbackError>,
    /// Process exit code
    pub exit_code: i32,
}

impl UncaughtError {
    /// Wrap a root cause with the default exit code
    pub fn new(root: CallbackError) -> Self {
        Self {
            root,
            suppressed: Vec::new(),
            exit_code: EXIT_UNCAUGHT,
        }
    }

    /// Chain a later failure onto this one
    pub fn suppress(&mut self, error: CallbackError) {
        self.suppressed.push(error);
    }
}

impl fmt::Display for UncaughtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)?;
        if !self.suppressed.is_empty() {
            write!(f, " (+{} suppressed)", self.suppressed.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for UncaughtError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.root)
    }
}

/// Failure of a task submitted to the worker pool
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The job panicked; the worker thread survived
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The job was dropped before it ran (queue cleared or pool shut down)
    #[error("task was cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let mut e = UncaughtError::new(CallbackError::script("boom"));
        assert_eq!(LoopError::from(e.clone()).exit_code(), 1);
        e.exit_code = EXIT_HANDLER_FAILED;
        assert_eq!(LoopError::Uncaught(e).exit_code(), 7);
        assert_eq!(LoopError::PoolShutdown.exit_code(), 1);
    }

    #[test]
    fn test_uncaught_display_counts_suppressed() {
        let mut e = UncaughtError::new(CallbackError::script("first"));
        e.suppress(CallbackError::host("second"));
        assert_eq!(e.to_string(), "first (+1 suppressed)");
    }
}
