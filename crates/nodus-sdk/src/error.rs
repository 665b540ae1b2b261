//! Errors raised by callbacks

use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;

/// An exception thrown by script code.
///
/// Carries what the script engine knows about the throw site plus any own
/// properties the user attached to the thrown object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptError {
    /// Constructor name (`TypeError`), if the engine reported one separately
    pub name: Option<String>,
    /// Message; may still carry a `Name: message` prefix
    pub message: String,
    /// Source file of the throw site
    pub file: Option<String>,
    /// 1-based line
    pub line: Option<u32>,
    /// 0-based column
    pub column: Option<u32>,
    /// Script stack trace
    pub stack: Option<String>,
    /// User-defined own properties of the thrown object
    pub properties: BTreeMap<String, Value>,
}

impl ScriptError {
    /// Create an error with only a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Set the constructor name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the throw site
    pub fn at(mut self, file: impl Into<String>, line: u32, column: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    /// Set the stack trace
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Attach a user-defined property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", name, self.message)?,
            None => write!(f, "{}", self.message)?,
        }
        if let (Some(file), Some(line)) = (&self.file, self.line) {
            write!(f, " ({}:{}", file, line)?;
            if let Some(column) = self.column {
                write!(f, ":{}", column)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for ScriptError {}

/// Failure of a callback invocation
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallbackError {
    /// Thrown by script code
    #[error("{0}")]
    Script(ScriptError),

    /// Raised by host (native) code, carries no script location
    #[error("{0}")]
    Host(String),

    /// Host-side wrapper around another failure (e.g. "while evaluating main")
    #[error("{context}: {source}")]
    Wrapped {
        /// What the host was doing
        context: String,
        /// Underlying failure
        #[source]
        source: Box<CallbackError>,
    },
}

impl CallbackError {
    /// Shorthand for a script error with just a message
    pub fn script(message: impl Into<String>) -> Self {
        CallbackError::Script(ScriptError::new(message))
    }

    /// Shorthand for a host error
    pub fn host(message: impl Into<String>) -> Self {
        CallbackError::Host(message.into())
    }

    /// Wrap this error with host context
    pub fn wrap(self, context: impl Into<String>) -> Self {
        CallbackError::Wrapped {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The script exception behind this error, looking through one level of
    /// host wrapping. `None` for pure host failures.
    pub fn as_script(&self) -> Option<&ScriptError> {
        match self {
            CallbackError::Script(e) => Some(e),
            CallbackError::Wrapped { source, .. } => match source.as_ref() {
                CallbackError::Script(e) => Some(e),
                _ => None,
            },
            CallbackError::Host(_) => None,
        }
    }
}

impl From<ScriptError> for CallbackError {
    fn from(e: ScriptError) -> Self {
        CallbackError::Script(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_display() {
        let e = ScriptError::new("boom").with_name("TypeError").at("main.js", 3, 7);
        assert_eq!(e.to_string(), "TypeError: boom (main.js:3:7)");
    }

    #[test]
    fn test_as_script_unwraps_one_level() {
        let inner = CallbackError::script("x");
        assert!(inner.as_script().is_some());

        let wrapped = inner.clone().wrap("loading main");
        assert_eq!(wrapped.as_script().map(|e| e.message.as_str()), Some("x"));

        let twice = wrapped.wrap("outer");
        assert!(twice.as_script().is_none());

        assert!(CallbackError::host("io").as_script().is_none());
    }
}
