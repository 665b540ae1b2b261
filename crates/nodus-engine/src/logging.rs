//! Category loggers
//!
//! A [`Logging`] context hands out one [`Logger`] per component instance. Each
//! logger writes through the `log` facade under the target `nodus::<category>`
//! and prefixes records with a per-category instance id, so two loops in one
//! process stay distinguishable. The context is created by the embedder and
//! passed down; there is no global registry.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Hands out category loggers and owns the debug enable flag
#[derive(Clone, Default)]
pub struct Logging {
    inner: Arc<LoggingInner>,
}

#[derive(Default)]
struct LoggingInner {
    enabled: AtomicBool,
    next_id: Mutex<FxHashMap<String, u32>>,
}

impl Logging {
    /// Create a context; `enabled` turns on debug/trace records
    pub fn new(enabled: bool) -> Self {
        let logging = Self::default();
        logging.inner.enabled.store(enabled, Ordering::Relaxed);
        logging
    }

    /// Whether debug/trace records are emitted by loggers created from now on
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    /// Change the enable flag, returning the previous value
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.inner.enabled.swap(enabled, Ordering::Relaxed)
    }

    /// Create the next logger for `category`
    pub fn get(&self, category: &str) -> Logger {
        let id = {
            let mut ids = self.inner.next_id.lock();
            let next = ids.entry(category.to_string()).or_insert(0);
            let id = *next;
            *next += 1;
            id
        };
        Logger {
            target: Arc::from(format!("nodus::{}", category)),
            id,
            verbose: self.is_enabled(),
        }
    }
}

impl fmt::Debug for Logging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logging")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// A category logger.
///
/// `debug`/`trace` only emit when the context was enabled at creation time;
/// `warn`/`error` always go to the facade.
#[derive(Clone, Debug)]
pub struct Logger {
    target: Arc<str>,
    id: u32,
    verbose: bool,
}

impl Logger {
    /// A logger that drops debug/trace records
    pub fn quiet(category: &str) -> Self {
        Self {
            target: Arc::from(format!("nodus::{}", category)),
            id: 0,
            verbose: false,
        }
    }

    /// `log` target, e.g. `nodus::eventloop`
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Per-category instance id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether debug records would be emitted
    pub fn enabled(&self) -> bool {
        self.verbose && log::log_enabled!(target: &self.target, log::Level::Debug)
    }

    /// Debug record
    pub fn debug(&self, args: fmt::Arguments<'_>) {
        if self.verbose {
            log::debug!(target: &self.target, "[{}] {}", self.id, args);
        }
    }

    /// Trace record
    pub fn trace(&self, args: fmt::Arguments<'_>) {
        if self.verbose {
            log::trace!(target: &self.target, "[{}] {}", self.id, args);
        }
    }

    /// Warning, always emitted
    pub fn warn(&self, args: fmt::Arguments<'_>) {
        log::warn!(target: &self.target, "[{}] {}", self.id, args);
    }

    /// Error, always emitted
    pub fn error(&self, args: fmt::Arguments<'_>) {
        log::error!(target: &self.target, "[{}] {}", self.id, args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_per_category() {
        let logging = Logging::new(true);
        assert_eq!(logging.get("eventloop").id(), 0);
        assert_eq!(logging.get("eventloop").id(), 1);
        assert_eq!(logging.get("pool").id(), 0);
        assert_eq!(logging.get("pool").target(), "nodus::pool");
    }

    #[test]
    fn test_contexts_are_independent() {
        let a = Logging::new(false);
        let b = Logging::new(false);
        a.get("fs");
        a.get("fs");
        assert_eq!(b.get("fs").id(), 0);
    }

    #[test]
    fn test_enable_flag_applies_to_new_loggers() {
        let logging = Logging::new(false);
        let before = logging.get("dns");
        assert!(!logging.set_enabled(true));
        let after = logging.get("dns");
        assert!(!before.verbose);
        assert!(after.verbose);
    }
}
