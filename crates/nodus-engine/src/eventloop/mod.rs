//! Hybrid event loop
//!
//! One loop thread runs script callbacks; worker threads run blocking work.
//! They meet at three points:
//!
//! - the [`EventQueue`]: workers `post` completions, the loop thread drains them
//! - the [`KeepAliveRegistry`]: outstanding background work keeps the loop alive
//! - the native wake channel: pulses, interrupts and native events unblock the
//!   loop thread's wait
//!
//! ```text
//!  leaf ──acquire()──► Handle ──────────────────────────┐
//!   │                                                   │ drop
//!   └──submit(work)──► WorkerPool ──post(Event)──► EventQueue
//!                                                       │
//!      EventLoop::run ◄── NativeLoop::run ◄─ wake ──────┘
//!         │
//!         └─ process_queued_events ─► DomainRouter bracket ─► Callback
//! ```

mod domain;
mod event;
mod event_loop;
mod exception;
mod keep_alive;
mod native;
mod pool;
mod queue;
mod stats;

pub use domain::DomainRouter;
pub use event::Event;
pub use event_loop::{EventLoop, LoopHandle};
pub use exception::{describe_error, Disposition, RegistrationProbe, UNCAUGHT_EXCEPTION};
pub use keep_alive::{Handle, KeepAliveRegistry};
pub use native::{
    native_callback, DispatchHook, NativeCallback, NativeEvent, NativeHandleId, NativeLoop,
    NATIVE_LOOP_VERSION,
};
pub use pool::{TaskHandle, WorkerPool};
pub use queue::EventQueue;
pub use stats::LoopStats;

use std::cell::Cell;

thread_local! {
    static CURRENT_INSTANCE: Cell<Option<u32>> = const { Cell::new(None) };
}

/// Instance number of the loop whose task is running on this thread.
///
/// Set while a job submitted through [`EventLoop::submit`] runs on a worker, and
/// while a loop is inside [`EventLoop::run`]. `None` elsewhere.
pub fn current_instance() -> Option<u32> {
    CURRENT_INSTANCE.with(|c| c.get())
}

/// Scope guard installing a loop identity on the current thread
pub(crate) struct InstanceScope {
    previous: Option<u32>,
}

impl InstanceScope {
    pub(crate) fn enter(instance: u32) -> Self {
        let previous = CURRENT_INSTANCE.with(|c| c.replace(Some(instance)));
        Self { previous }
    }
}

impl Drop for InstanceScope {
    fn drop(&mut self) {
        CURRENT_INSTANCE.with(|c| c.set(self.previous));
    }
}
