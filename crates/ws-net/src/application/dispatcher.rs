//! Event dispatcher: event kind → ordered list of handlers.
//!
//! A connection owns (a shared reference to) one dispatcher for its message
//! events, and the server owns a second one for `client_connect` and
//! `client_disconnect`.  Both are the same generic type; only the target
//! passed to the handlers differs.
//!
//! # Handler failures
//!
//! A handler returning `Err` or panicking is logged and skipped; the
//! remaining handlers still run and the connection keeps serving.  A buggy
//! callback therefore never takes down a connection, let alone the server.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::error;
use ws_core::EventKind;

/// A registered callback.  Receives the emitting target and the payload
/// (empty for `client_connect` / `client_disconnect`).
pub type Handler<T> = Arc<dyn Fn(&T, &[u8]) -> anyhow::Result<()> + Send + Sync>;

/// Thread-safe handler table.
pub struct Dispatcher<T> {
    handlers: RwLock<HashMap<EventKind, Vec<Handler<T>>>>,
}

impl<T> Default for Dispatcher<T> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> Dispatcher<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `handler` to the list for `kind`.  Registration order is
    /// invocation order.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&T, &[u8]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Invokes every handler for `kind`, in registration order, on the
    /// calling task.  Returns the number of handlers that completed with `Ok`.
    ///
    /// The handler list is copied out before the first call, so a handler
    /// may itself register new handlers; those take effect from the next
    /// emit on.
    pub fn emit(&self, kind: EventKind, target: &T, payload: &[u8]) -> usize {
        let snapshot: Vec<Handler<T>> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut succeeded = 0;
        for handler in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(target, payload))) {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(e)) => error!(event = %kind, "handler failed: {e:#}"),
                Err(panic) => error!(event = %kind, "handler panicked: {}", panic_message(&*panic)),
            }
        }
        succeeded
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
