//! Callback and Domain traits: what the loop calls into the script layer for

use crate::error::CallbackError;
use crate::value::Value;
use std::sync::Arc;

/// An invocable `(name, args)` pair target.
///
/// Callbacks are created on whatever thread schedules work and always run on the
/// loop thread, so they must be `Send + Sync`.
pub trait Callback: Send + Sync {
    /// Invoke the callback. `name` is the diagnostic event name, if any.
    fn call(&self, name: Option<&str>, args: &[Value]) -> Result<(), CallbackError>;
}

impl<F> Callback for F
where
    F: Fn(Option<&str>, &[Value]) -> Result<(), CallbackError> + Send + Sync,
{
    fn call(&self, name: Option<&str>, args: &[Value]) -> Result<(), CallbackError> {
        self(name, args)
    }
}

/// Shared callback reference
pub type CallbackRef = Arc<dyn Callback>;

/// Wrap a closure as a [`CallbackRef`]
pub fn callback<F>(f: F) -> CallbackRef
where
    F: Fn(Option<&str>, &[Value]) -> Result<(), CallbackError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// An error-isolation scope owned by the script layer.
///
/// The loop never creates or destroys domains; it only asks whether one was
/// disposed and brackets a single callback invocation with `enter`/`exit`.
pub trait Domain: Send + Sync {
    /// Whether the scope has been disposed (its pending callbacks are dropped)
    fn is_disposed(&self) -> bool;

    /// Make this scope the active one
    fn enter(&self);

    /// Leave this scope
    fn exit(&self);
}

/// Shared domain reference
pub type DomainRef = Arc<dyn Domain>;
