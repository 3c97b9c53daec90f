//! Book-keeping of live connections.
//!
//! Every accepted connection registers a cancellation token under a fresh
//! id; shutting the server down cancels them all. Guards unregister on
//! drop so the registry never leaks entries for finished connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, CancellationToken>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a new connection and returns its guard.
    pub fn register(self: &Arc<Self>) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.connections
            .lock()
            .expect("registry lock")
            .insert(id, token.clone());
        ConnectionGuard {
            registry: Arc::clone(self),
            id,
            token,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.lock().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels every registered connection.
    pub fn close_all(&self) {
        let connections = self.connections.lock().expect("registry lock");
        for token in connections.values() {
            token.cancel();
        }
    }

    fn unregister(&self, id: u64) {
        self.connections.lock().expect("registry lock").remove(&id);
    }
}

/// Handle held by a connection task for its registry entry.
#[derive(Debug)]
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    id: u64,
    token: CancellationToken,
}

impl ConnectionGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
