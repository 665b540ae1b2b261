//! Events posted to the loop

use nodus_sdk::{CallbackError, CallbackRef, DomainRef, Value};
use std::fmt;

/// A callback invocation scheduled for the loop thread.
///
/// Built on any thread, consumed exactly once by the loop thread.
#[derive(Clone)]
pub struct Event {
    name: Option<String>,
    callback: CallbackRef,
    domain: Option<DomainRef>,
    args: Vec<Value>,
}

impl Event {
    /// Named event without a domain
    pub fn new(name: impl Into<String>, callback: CallbackRef, args: Vec<Value>) -> Self {
        Self {
            name: Some(name.into()),
            callback,
            domain: None,
            args,
        }
    }

    /// Unnamed event (e.g. `nextTick`)
    pub fn anonymous(callback: CallbackRef, args: Vec<Value>) -> Self {
        Self {
            name: None,
            callback,
            domain: None,
            args,
        }
    }

    /// Attach the domain the callback must run in
    pub fn in_domain(mut self, domain: Option<DomainRef>) -> Self {
        self.domain = domain;
        self
    }

    /// Diagnostic name
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Domain the callback runs in
    pub fn domain(&self) -> Option<&DomainRef> {
        self.domain.as_ref()
    }

    /// Callback arguments
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Invoke the callback with the event's name and arguments
    pub fn invoke(&self) -> Result<(), CallbackError> {
        self.callback.call(self.name.as_deref(), &self.args)
    }

    /// Render for diagnostics; arguments only when `verbose`
    pub fn describe(&self, verbose: bool) -> String {
        let mut out = self.name.clone().unwrap_or_else(|| "<anonymous>".to_string());
        if verbose && !self.args.is_empty() {
            out.push('(');
            for (i, arg) in self.args.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&arg.to_string());
            }
            out.push(')');
        }
        out
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe(cfg!(debug_assertions)))
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("domain", &self.domain.is_some())
            .field("args", &self.args)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodus_sdk::callback;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_invoke_passes_name_and_args() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let event = Event::new(
            "fs.stat",
            callback(move |name, args| {
                assert_eq!(name, Some("fs.stat"));
                seen2.store(args.len(), Ordering::SeqCst);
                Ok(())
            }),
            vec![Value::Null, Value::from(1)],
        );
        event.invoke().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_describe() {
        let cb = callback(|_, _| Ok(()));
        let event = Event::new("dns.address", cb.clone(), vec![Value::Null, Value::from("::1")]);
        assert_eq!(event.describe(false), "dns.address");
        assert_eq!(event.describe(true), "dns.address(null, ::1)");
        assert_eq!(Event::anonymous(cb, vec![]).describe(true), "<anonymous>");
    }
}
