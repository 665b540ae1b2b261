//! Nodus POSIX Standard Library
//!
//! Modules that talk to the operating system. Every operation runs on the
//! loop's worker pool and answers with an error-first event:
//! - [`fs`]: `fs.<op>` / `fs.<op>.error`
//! - [`dns`]: `dns.address`, `dns.host` and their `.error` variants

#![warn(missing_docs)]

pub mod dns;
pub mod fs;

pub use dns::{Dns, Family};
pub use fs::Fs;
