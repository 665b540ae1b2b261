//! Script-visible data carried by events
//!
//! Events posted from worker threads cannot touch the script heap, so they carry
//! plain owned data. The script adapter converts these into engine values when the
//! callback runs on the loop thread.

use std::collections::BTreeMap;
use std::fmt;
use std::io;

/// Owned, thread-safe script value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// `undefined`
    #[default]
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Bool(bool),
    /// Number (all script numbers are doubles)
    Number(f64),
    /// String
    String(String),
    /// Raw bytes (becomes a Buffer on the script side)
    Bytes(Vec<u8>),
    /// Ordered list
    Array(Vec<Value>),
    /// Plain object with sorted keys
    Object(BTreeMap<String, Value>),
    /// Error object handed to error-first callbacks
    Error(ErrorValue),
}

impl Value {
    /// Build an array from anything convertible into values
    pub fn array<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::Array(items.into_iter().map(Into::into).collect())
    }

    /// Build an object from `(key, value)` pairs
    pub fn object<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// `true` for `undefined`
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// `true` for `null` or `undefined`
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    /// Get as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as number
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as byte slice
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get as array slice
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Get as object map
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Get as error
    pub fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            Value::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Look up a property on an object value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Script `typeof`-style name, used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Bytes(_) => "buffer",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Error(_) => "error",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "<Buffer {} bytes>", b.len()),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Object(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Error(e) => write!(f, "{}", e),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::array(items)
    }
}

impl From<ErrorValue> for Value {
    fn from(e: ErrorValue) -> Self {
        Value::Error(e)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

// ============================================================================
// ErrorValue
// ============================================================================

/// Node-style system error (`err.code`, `err.syscall`, `err.path`).
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    /// Error code such as `ENOENT`
    pub code: String,
    /// Human readable message
    pub message: String,
    /// Failing operation, e.g. `stat`
    pub syscall: Option<String>,
    /// Path the operation was applied to
    pub path: Option<String>,
}

impl ErrorValue {
    /// Create an error with a code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            syscall: None,
            path: None,
        }
    }

    /// Attach the failing syscall
    pub fn with_syscall(mut self, syscall: impl Into<String>) -> Self {
        self.syscall = Some(syscall.into());
        self
    }

    /// Attach the path
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Map an `io::Error` onto the errno-style code scripts expect
    pub fn from_io(err: &io::Error, syscall: &str) -> Self {
        let code = match err.kind() {
            io::ErrorKind::NotFound => "ENOENT",
            io::ErrorKind::PermissionDenied => "EACCES",
            io::ErrorKind::AlreadyExists => "EEXIST",
            io::ErrorKind::InvalidInput => "EINVAL",
            io::ErrorKind::InvalidData => "EINVAL",
            io::ErrorKind::TimedOut => "ETIMEDOUT",
            io::ErrorKind::Interrupted => "EINTR",
            io::ErrorKind::WouldBlock => "EAGAIN",
            io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
            io::ErrorKind::ConnectionReset => "ECONNRESET",
            io::ErrorKind::AddrInUse => "EADDRINUSE",
            io::ErrorKind::UnexpectedEof => "EOF",
            _ => match err.raw_os_error() {
                Some(39) | Some(66) => "ENOTEMPTY",
                Some(20) => "ENOTDIR",
                Some(21) => "EISDIR",
                _ => "EIO",
            },
        };
        Self::new(code, err.to_string()).with_syscall(syscall)
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(syscall) = &self.syscall {
            write!(f, ", {}", syscall)?;
        }
        if let Some(path) = &self.path {
            write!(f, " '{}'", path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(3), Value::Number(3.0));
        assert_eq!(Value::from("a").as_str(), Some("a"));
        assert_eq!(Value::from(None::<String>), Value::Null);
        assert_eq!(
            Value::from(vec!["x".to_string()]),
            Value::Array(vec![Value::String("x".into())])
        );
    }

    #[test]
    fn test_object_lookup() {
        let v = Value::object([("line", Value::from(4)), ("file", Value::from("a.js"))]);
        assert_eq!(v.get("line").and_then(Value::as_f64), Some(4.0));
        assert!(v.get("missing").is_none());
        assert_eq!(v.to_string(), "{file: a.js, line: 4}");
    }

    #[test]
    fn test_error_value_from_io() {
        let err = io::Error::new(io::ErrorKind::NotFound, "no such file");
        let ev = ErrorValue::from_io(&err, "stat").with_path("/nope");
        assert_eq!(ev.code, "ENOENT");
        assert_eq!(ev.syscall.as_deref(), Some("stat"));
        assert_eq!(ev.to_string(), "ENOENT: no such file, stat '/nope'");
    }
}
