//! Uncaught-exception protocol
//!
//! Decides whether a callback error is handled by the script layer:
//! 1. the registration probe is asked whether an `uncaughtException`
//!    listener exists (a failing probe counts as no listener)
//! 2. with no listener and no active domain the error is unhandled
//! 3. without a handler the error is unhandled
//! 4. only script errors can be described; host errors are unhandled
//! 5. the structured description goes to the handler; the error is handled
//!    iff the handler returns normally

use crate::logging::Logger;
use nodus_sdk::{CallbackError, CallbackRef, ScriptError, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Event name the probe is asked about
pub const UNCAUGHT_EXCEPTION: &str = "uncaughtException";

/// Asks the script layer whether listeners exist for an event name
pub type RegistrationProbe = Arc<dyn Fn(&str) -> Result<bool, CallbackError> + Send + Sync>;

/// Outcome of offering an error to the protocol
#[derive(Debug)]
pub enum Disposition {
    /// The handler took it
    Handled,
    /// Nobody took it
    Unhandled,
    /// The handler was called and failed itself
    HandlerFailed(CallbackError),
}

impl Disposition {
    /// Whether the error was handled
    pub fn is_handled(&self) -> bool {
        matches!(self, Disposition::Handled)
    }
}

/// Probe and handler installed by the script layer
#[derive(Default)]
pub(crate) struct ExceptionProtocol {
    probe: Option<RegistrationProbe>,
    handler: Option<CallbackRef>,
}

impl ExceptionProtocol {
    pub(crate) fn install(&mut self, probe: RegistrationProbe, handler: CallbackRef) {
        self.probe = Some(probe);
        self.handler = Some(handler);
    }

    /// Offer `error` to the script layer; `in_domain` tells whether a domain is active
    pub(crate) fn offer(&self, error: &CallbackError, in_domain: bool, log: &Logger) -> Disposition {
        let registered = match &self.probe {
            Some(probe) => match probe(UNCAUGHT_EXCEPTION) {
                Ok(registered) => registered,
                Err(e) => {
                    log.debug(format_args!("listener probe failed: {}", e));
                    false
                }
            },
            None => false,
        };

        if (!registered || self.handler.is_none()) && !in_domain {
            log.debug(format_args!("no uncaught exception handler for: {}", error));
            return Disposition::Unhandled;
        }

        let Some(handler) = &self.handler else {
            log.debug(format_args!("no uncaught exception handler installed for: {}", error));
            return Disposition::Unhandled;
        };

        let Some(script) = error.as_script() else {
            log.debug(format_args!("host error is not routable: {}", error));
            return Disposition::Unhandled;
        };

        match handler.call(Some(UNCAUGHT_EXCEPTION), &[describe_error(script)]) {
            Ok(()) => Disposition::Handled,
            Err(e) => {
                log.debug(format_args!("uncaught exception handler failed: {}", e));
                Disposition::HandlerFailed(e)
            }
        }
    }
}

/// Structured description handed to the uncaught-exception handler.
///
/// Keys: `filename`, `line`, `column`, `stack`, `name`, `message`, followed by
/// the error's own properties for keys not already present. Without an
/// explicit name, a `Name: message` prefix is split off the message.
pub fn describe_error(error: &ScriptError) -> Value {
    let mut desc = BTreeMap::new();
    desc.insert("filename".to_string(), Value::from(error.file.clone()));
    desc.insert("line".to_string(), Value::from(error.line));
    desc.insert("column".to_string(), Value::from(error.column));
    desc.insert(
        "stack".to_string(),
        Value::from(error.stack.clone().unwrap_or_default()),
    );

    let (name, message) = match &error.name {
        Some(name) => (Some(name.clone()), error.message.trim().to_string()),
        None => match error.message.split_once(':') {
            Some((name, message)) => (Some(name.trim().to_string()), message.trim().to_string()),
            None => (None, error.message.trim().to_string()),
        },
    };
    if let Some(name) = name {
        desc.insert("name".to_string(), Value::from(name));
    }
    desc.insert("message".to_string(), Value::from(message));

    for (key, value) in &error.properties {
        desc.entry(key.clone()).or_insert_with(|| value.clone());
    }
    Value::Object(desc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodus_sdk::callback;
    use parking_lot::Mutex;

    fn log() -> Logger {
        Logger::quiet("eventloop")
    }

    fn recording_handler() -> (CallbackRef, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let handler = callback(move |_, args| {
            seen2.lock().push(args[0].clone());
            Ok(())
        });
        (handler, seen)
    }

    #[test]
    fn test_describe_splits_message() {
        let err = ScriptError::new("TypeError: x is not a function")
            .at("app.js", 12, 4)
            .with_stack("at app.js:12:4")
            .with_property("code", "E_X")
            .with_property("line", 99);
        let desc = describe_error(&err);
        assert_eq!(desc.get("name").and_then(Value::as_str), Some("TypeError"));
        assert_eq!(desc.get("message").and_then(Value::as_str), Some("x is not a function"));
        assert_eq!(desc.get("filename").and_then(Value::as_str), Some("app.js"));
        assert_eq!(desc.get("line").and_then(Value::as_f64), Some(12.0));
        assert_eq!(desc.get("column").and_then(Value::as_f64), Some(4.0));
        assert_eq!(desc.get("code").and_then(Value::as_str), Some("E_X"));
    }

    #[test]
    fn test_describe_explicit_name_keeps_colons() {
        let err = ScriptError::new("bad: input").with_name("RangeError");
        let desc = describe_error(&err);
        assert_eq!(desc.get("name").and_then(Value::as_str), Some("RangeError"));
        assert_eq!(desc.get("message").and_then(Value::as_str), Some("bad: input"));
        assert_eq!(desc.get("filename"), Some(&Value::Null));
    }

    #[test]
    fn test_unregistered_without_domain_is_unhandled() {
        let (handler, seen) = recording_handler();
        let mut protocol = ExceptionProtocol::default();
        protocol.install(Arc::new(|_: &str| Ok(false)), handler);
        let d = protocol.offer(&CallbackError::script("E"), false, &log());
        assert!(matches!(d, Disposition::Unhandled));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_registered_handler_sees_description() {
        let (handler, seen) = recording_handler();
        let mut protocol = ExceptionProtocol::default();
        protocol.install(Arc::new(|event: &str| Ok(event == UNCAUGHT_EXCEPTION)), handler);
        let err = CallbackError::script("Error: nope").wrap("while running timer");
        assert!(protocol.offer(&err, false, &log()).is_handled());
        let seen = seen.lock();
        assert_eq!(seen[0].get("message").and_then(Value::as_str), Some("nope"));
    }

    #[test]
    fn test_domain_routes_even_without_listener() {
        let (handler, seen) = recording_handler();
        let mut protocol = ExceptionProtocol::default();
        protocol.install(Arc::new(|_: &str| Ok(false)), handler);
        assert!(protocol.offer(&CallbackError::script("E"), true, &log()).is_handled());
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_host_errors_are_unhandled() {
        let (handler, seen) = recording_handler();
        let mut protocol = ExceptionProtocol::default();
        protocol.install(Arc::new(|_: &str| Ok(true)), handler);
        assert!(!protocol.offer(&CallbackError::host("io"), false, &log()).is_handled());
        assert!(!protocol.offer(&CallbackError::host("io"), true, &log()).is_handled());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_failing_probe_counts_as_unregistered() {
        let (handler, seen) = recording_handler();
        let mut protocol = ExceptionProtocol::default();
        protocol.install(Arc::new(|_: &str| Err(CallbackError::script("probe"))), handler);
        assert!(!protocol.offer(&CallbackError::script("E"), false, &log()).is_handled());
        assert!(seen.lock().is_empty());

        assert!(protocol.offer(&CallbackError::script("E"), true, &log()).is_handled());
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_domain_without_handler_is_unhandled() {
        let protocol = ExceptionProtocol::default();
        assert!(!protocol.offer(&CallbackError::script("E"), true, &log()).is_handled());
    }

    #[test]
    fn test_failing_handler() {
        let mut protocol = ExceptionProtocol::default();
        protocol.install(
            Arc::new(|_: &str| Ok(true)),
            callback(|_, _| Err(CallbackError::script("handler blew up"))),
        );
        let d = protocol.offer(&CallbackError::script("E"), false, &log());
        assert!(matches!(d, Disposition::HandlerFailed(_)));
    }
}
