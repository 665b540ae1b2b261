//! Ref-counted loop liveness
//!
//! Every outstanding piece of background work holds a [`Handle`]. The first
//! handle opened sends a ref pulse to the native loop and the last one closed
//! sends an unref pulse; the native loop re-reads the counter on either pulse.

use super::native::Wakeup;
use crossbeam::channel::Sender;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared liveness counter plus its pulse sender
#[derive(Clone)]
pub struct KeepAliveRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    hooks: AtomicUsize,
    ref_pulses: AtomicU64,
    unref_pulses: AtomicU64,
    pulse: Sender<Wakeup>,
}

impl RegistryInner {
    fn release(&self) {
        // Saturating: handles closed after a forced reset must not wrap
        let prev = self
            .hooks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |h| h.checked_sub(1));
        if prev == Ok(1) {
            self.unref_pulses.fetch_add(1, Ordering::Relaxed);
            let _ = self.pulse.send(Wakeup::Pulse);
        }
    }
}

impl KeepAliveRegistry {
    pub(crate) fn new(pulse: Sender<Wakeup>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                hooks: AtomicUsize::new(0),
                ref_pulses: AtomicU64::new(0),
                unref_pulses: AtomicU64::new(0),
                pulse,
            }),
        }
    }

    /// Open a handle; legal from any thread
    pub fn acquire(&self) -> Handle {
        if self.inner.hooks.fetch_add(1, Ordering::AcqRel) == 0 {
            self.inner.ref_pulses.fetch_add(1, Ordering::Relaxed);
            let _ = self.inner.pulse.send(Wakeup::Pulse);
        }
        Handle {
            registry: self.inner.clone(),
            open: AtomicBool::new(true),
        }
    }

    /// Number of open handles
    pub fn hooks(&self) -> usize {
        self.inner.hooks.load(Ordering::Acquire)
    }

    /// Whether any handle is open
    pub fn is_referenced(&self) -> bool {
        self.hooks() > 0
    }

    /// Ref pulses fired so far
    pub fn ref_pulses(&self) -> u64 {
        self.inner.ref_pulses.load(Ordering::Relaxed)
    }

    /// Unref pulses fired so far
    pub fn unref_pulses(&self) -> u64 {
        self.inner.unref_pulses.load(Ordering::Relaxed)
    }

    /// Forget every open handle. Handles closed afterwards are no-ops.
    pub fn reset(&self) {
        if self.inner.hooks.swap(0, Ordering::AcqRel) > 0 {
            self.inner.unref_pulses.fetch_add(1, Ordering::Relaxed);
            let _ = self.inner.pulse.send(Wakeup::Pulse);
        }
    }
}

impl fmt::Debug for KeepAliveRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeepAliveRegistry")
            .field("hooks", &self.hooks())
            .finish()
    }
}

/// Keep-alive token. Closing is idempotent and dropping closes.
pub struct Handle {
    registry: Arc<RegistryInner>,
    open: AtomicBool,
}

impl Handle {
    /// Release the handle; only the first call has an effect
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.registry.release();
        }
    }

    /// Whether `close` has not been called yet
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("open", &self.is_open()).finish()
    }
}
