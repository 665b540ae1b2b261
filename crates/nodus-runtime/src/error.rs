//! Runtime error types.

use nodus_engine::LoopError;

/// Errors that can occur while configuring or running a program.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// File I/O error
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML for [`RuntimeConfig`](crate::RuntimeConfig)
    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Config values are inconsistent
    #[error("Config error: {0}")]
    Config(String),

    /// Event loop construction failed or a program error went unhandled
    #[error("{0}")]
    Loop(#[from] LoopError),
}

impl RuntimeError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            RuntimeError::Loop(e) => e.exit_code(),
            _ => nodus_engine::error::EXIT_UNCAUGHT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodus_engine::UncaughtError;
    use nodus_sdk::CallbackError;

    #[test]
    fn test_exit_code_follows_loop_error() {
        let mut uncaught = UncaughtError::new(CallbackError::script("x"));
        uncaught.exit_code = 7;
        assert_eq!(RuntimeError::from(LoopError::from(uncaught)).exit_code(), 7);
        assert_eq!(RuntimeError::Config("bad".into()).exit_code(), 1);
    }
}
