//! Nodus Runtime
//!
//! Binds the event loop with the standard library modules and drives a
//! program through its lifecycle: init, `started`, the loop, finalization,
//! `stopped`.
//!
//! # Example
//!
//! ```rust,ignore
//! use nodus_runtime::{Context, Program, Runtime, RuntimeConfig};
//! use nodus_sdk::{callback, CallbackError};
//!
//! struct Hello;
//!
//! impl Program for Hello {
//!     fn init(&mut self, cx: &mut Context<'_>) -> Result<(), CallbackError> {
//!         cx.modules().timers.set_timeout(10.0, callback(|_, _| {
//!             println!("hello");
//!             Ok(())
//!         }), vec![]);
//!         Ok(())
//!     }
//! }
//!
//! nodus_runtime::init_logging(false);
//! let mut runtime = Runtime::new(RuntimeConfig::default())?;
//! let code = runtime.run(&mut Hello)?;
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;

pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use logging::init_logging;
pub use runtime::{Context, Modules, Program, Runtime, RuntimeCloser};
