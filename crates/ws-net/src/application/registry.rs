//! Registry of live connections.
//!
//! The server inserts a connection right after its handshake succeeds and
//! removes it exactly once when its receive loop ends.  This is the only
//! state shared across connections; every access goes through one lock.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ws_core::ConnectionId;

/// Lock-guarded map from [`ConnectionId`] to a connection handle.
///
/// Generic over the handle type so the bookkeeping can be tested without
/// sockets.
#[derive(Debug)]
pub struct ConnectionRegistry<T> {
    entries: Mutex<HashMap<ConnectionId, T>>,
}

impl<T> Default for ConnectionRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> ConnectionRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `conn`, returning any entry previously stored under `id`.
    pub fn insert(&self, id: ConnectionId, conn: T) -> Option<T> {
        self.lock().insert(id, conn)
    }

    /// Removes and returns the entry for `id`.  A second call for the same
    /// id returns `None`.
    pub fn remove(&self, id: &ConnectionId) -> Option<T> {
        self.lock().remove(id)
    }

    /// Point-in-time copy of every live connection.
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Runs `f` on every entry while holding the lock, so no connection can
    /// be added or removed part-way through.  `f` must not call back into
    /// the registry.
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        for conn in self.lock().values() {
            f(conn);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, T>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
