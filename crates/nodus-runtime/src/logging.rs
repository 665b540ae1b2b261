//! Process-wide logger installation

use log::LevelFilter;
use std::env;

/// Install `env_logger` as the `log` backend.
///
/// `RUST_LOG` wins when set; otherwise `verbose` turns on debug output for
/// every `nodus::*` category and warnings only are shown. Returns `false` if a
/// logger was already installed.
pub fn init_logging(verbose: bool) -> bool {
    let mut builder = env_logger::Builder::from_default_env();
    if env::var_os("RUST_LOG").is_none() {
        builder.filter_level(LevelFilter::Warn);
        if verbose {
            builder.filter_module("nodus", LevelFilter::Trace);
        }
    }
    builder.format_timestamp_millis().try_init().is_ok()
}
