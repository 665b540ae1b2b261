//! Runtime configuration (`nodus.toml`)
//!
//! ```toml
//! name = "server"
//! embedded = false
//! verbose = false
//!
//! [pool]
//! core_threads = 4
//! max_threads = 16
//!
//! [event_loop]
//! instance = 0
//! sync_events = true
//! ```

use crate::error::RuntimeError;
use nodus_engine::{LoopConfig, PoolConfig};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Environment override for [`RuntimeConfig::verbose`]
pub const ENV_VERBOSE: &str = "NODUS_VERBOSE";

fn default_name() -> String {
    "nodus".to_string()
}

/// Top-level runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Program name, used in log lines
    #[serde(default = "default_name")]
    pub name: String,

    /// Runtime version the program requires, checked at startup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Keep the loop alive until [`RuntimeCloser::close`](crate::RuntimeCloser::close)
    #[serde(default)]
    pub embedded: bool,

    /// Enable debug output from the category loggers
    #[serde(default)]
    pub verbose: bool,

    /// Worker pool sizing
    #[serde(default)]
    pub pool: PoolConfig,

    /// Event loop settings; its own `pool` table is replaced by the top-level one
    #[serde(default)]
    pub event_loop: LoopConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            version: None,
            embedded: false,
            verbose: false,
            pool: PoolConfig::default(),
            event_loop: LoopConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Read and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML config text
    pub fn from_toml_str(content: &str) -> Result<Self, RuntimeError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `NODUS_POOL_*` and `NODUS_VERBOSE` on top of this config
    pub fn with_env_overrides(mut self) -> Result<Self, RuntimeError> {
        self.pool = self.pool.with_env_overrides()?;
        if let Ok(raw) = env::var(ENV_VERBOSE) {
            self.verbose = match raw.trim() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                other => {
                    return Err(RuntimeError::Config(format!(
                        "{} must be a boolean, got {:?}",
                        ENV_VERBOSE, other
                    )))
                }
            };
        }
        Ok(self)
    }

    /// Check the requested version and pool sizing
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if let Some(version) = &self.version {
            if version != nodus_engine::VERSION {
                return Err(RuntimeError::Config(format!(
                    "version mismatch: {} requires '{}', runtime is '{}'",
                    self.name,
                    version,
                    nodus_engine::VERSION
                )));
            }
        }
        self.pool.validate()?;
        Ok(())
    }

    /// Loop configuration with the top-level pool applied
    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            pool: self.pool.clone(),
            ..self.event_loop.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.name, "nodus");
    }

    #[test]
    fn test_parse_tables() {
        let config = RuntimeConfig::from_toml_str(
            r#"
name = "server"
embedded = true

[pool]
core_threads = 2
max_threads = 8
queue_size = 32

[event_loop]
instance = 4
sync_events = false
"#,
        )
        .unwrap();
        assert_eq!(config.name, "server");
        assert!(config.embedded);
        assert_eq!(config.pool.max_threads, Some(8));

        let loop_config = config.loop_config();
        assert_eq!(loop_config.instance, 4);
        assert!(!loop_config.sync_events);
        assert_eq!(loop_config.pool.core_threads, 2);
        assert_eq!(loop_config.pool.queue_size, Some(32));
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(matches!(
            RuntimeConfig::from_toml_str("name = 3"),
            Err(RuntimeError::Toml(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_toml_str("[pool]\ncore_threads = 9\nmax_threads = 2"),
            Err(RuntimeError::Loop(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_toml_str("version = \"0.0.1-nope\""),
            Err(RuntimeError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodus.toml");
        std::fs::write(&path, "verbose = true\n").unwrap();
        assert!(RuntimeConfig::load(&path).unwrap().verbose);
        assert!(matches!(
            RuntimeConfig::load(&dir.path().join("missing.toml")),
            Err(RuntimeError::Io(_))
        ));
    }

    #[test]
    fn test_verbose_env_override() {
        env::set_var(ENV_VERBOSE, "yes");
        let config = RuntimeConfig::default().with_env_overrides().unwrap();
        assert!(config.verbose);

        env::set_var(ENV_VERBOSE, "loud");
        assert!(RuntimeConfig::default().with_env_overrides().is_err());
        env::remove_var(ENV_VERBOSE);
    }
}
