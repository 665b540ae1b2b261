//! Nodus SDK - boundary types between the event loop core and everything that uses it
//!
//! Leaf modules (fs, dns, zlib, timers) and the embedding script adapter only need the
//! types in this crate to talk to the loop:
//!
//! - [`Value`]: script-visible arguments carried by events
//! - [`Callback`]: an invocable `(name, args)` that may fail with a [`CallbackError`]
//! - [`Domain`]: an error-isolation scope owned by the script layer
//!
//! # Example
//!
//! ```ignore
//! use nodus_sdk::{callback, Value};
//!
//! let cb = callback(|name, args| {
//!     println!("{:?} fired with {} args", name, args.len());
//!     Ok(())
//! });
//! cb.call(Some("fs.stat"), &[Value::Null]).unwrap();
//! ```

#![warn(missing_docs)]

mod callback;
mod error;
mod value;

pub use callback::{callback, Callback, CallbackRef, Domain, DomainRef};
pub use error::{CallbackError, ScriptError};
pub use value::{ErrorValue, Value};
