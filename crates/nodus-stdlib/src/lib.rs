//! Nodus Standard Library
//!
//! Platform-neutral modules built on the event loop primitives:
//! - [`timers`]: `setTimeout`/`setInterval` on native loop timers, `setImmediate` on the queue
//! - [`zlib`]: gzip/deflate compression on the worker pool

#![warn(missing_docs)]

pub mod timers;
pub mod zlib;

pub use timers::{TimerId, Timers};
pub use zlib::{Zlib, ZlibMode};
