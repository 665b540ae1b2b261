//! Nodus Engine
//!
//! The event loop core of the nodus runtime:
//! - **WorkerPool**: threads for blocking work (`eventloop::pool`)
//! - **EventQueue**: cross-thread FIFO drained on the loop thread (`eventloop::queue`)
//! - **KeepAliveRegistry**: ref-counted loop liveness (`eventloop::keep_alive`)
//! - **NativeLoop**: timers, native handles and the dispatch envelope (`eventloop::native`)
//! - **DomainRouter**: error-isolation scope bracketing (`eventloop::domain`)
//! - **EventLoop**: the orchestrator tying them together (`eventloop::event_loop`)
//!
//! # Example
//!
//! ```rust,ignore
//! use nodus_engine::{EventLoop, LoopConfig, Logging};
//! use nodus_sdk::{callback, Value};
//!
//! let logging = Logging::new(false);
//! let mut event_loop = EventLoop::new(LoopConfig::default(), &logging)?;
//!
//! let handle = event_loop.handle();
//! let token = handle.acquire();
//! event_loop.submit(move || {
//!     let answer = 6 * 7;
//!     handle.post_callback(callback(|_, args| {
//!         println!("answer = {}", args[0]);
//!         Ok(())
//!     }), vec![Value::from(answer)]);
//!     drop(token);
//! })?;
//!
//! event_loop.run()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// Loop, pool and configuration errors
pub mod error;

/// Pool and loop configuration
pub mod config;

/// Category loggers handed out by an explicit logging context
pub mod logging;

/// The event loop and its components
pub mod eventloop;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{LoopConfig, PoolConfig};
pub use error::{LoopError, TaskError, UncaughtError};
pub use eventloop::{
    current_instance, describe_error, native_callback, DispatchHook, Disposition, DomainRouter,
    Event, EventLoop, EventQueue, Handle, KeepAliveRegistry, LoopHandle, LoopStats,
    NativeCallback, NativeEvent, NativeHandleId, NativeLoop, RegistrationProbe, TaskHandle,
    WorkerPool, NATIVE_LOOP_VERSION, UNCAUGHT_EXCEPTION,
};
pub use logging::{Logger, Logging};

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
