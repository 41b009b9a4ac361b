use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;
use uuid::Uuid;

/// A server's active connections, keyed by a per-connection id. Connections remove themselves
///  through their release callback when their read loop ends.
pub struct ConnectionSet<T> {
    connections: Mutex<FxHashMap<Uuid, Arc<T>>>,
}

impl<T> Default for ConnectionSet<T> {
    fn default() -> Self {
        ConnectionSet {
            connections: Mutex::new(FxHashMap::default()),
        }
    }
}

impl<T> ConnectionSet<T> {
    pub fn insert(&self, id: Uuid, connection: Arc<T>) {
        trace!("adding connection {}", id);
        self.connections.lock().insert(id, connection);
    }

    pub fn remove(&self, id: &Uuid) -> Option<Arc<T>> {
        trace!("removing connection {}", id);
        self.connections.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns all connections, e.g. to close them without holding the lock
    pub fn drain(&self) -> Vec<Arc<T>> {
        self.connections.lock()
            .drain()
            .map(|(_, c)| c)
            .collect()
    }
}
