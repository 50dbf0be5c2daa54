//! Registry of live peer connections

use crate::network::peer::{PeerConnection, PeerId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Thread-safe map of connection id to connection
///
/// The registry owns every registered connection. Callers act on peers
/// through [`get`](Self::get), [`snapshot`](Self::snapshot) and
/// [`remove`](Self::remove) and should not keep the returned handles
/// across a removal.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, Arc<PeerConnection>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection under its id
    pub fn add(&self, conn: Arc<PeerConnection>) {
        let id = conn.id();
        self.peers.write().insert(id, conn);
        log::debug!("Registered peer {}", id);
    }

    /// Remove a connection, returning it if it was present
    pub fn remove(&self, id: &PeerId) -> Option<Arc<PeerConnection>> {
        let removed = self.peers.write().remove(id);
        if removed.is_some() {
            log::debug!("Unregistered peer {}", id);
        }
        removed
    }

    pub fn get(&self, id: &PeerId) -> Option<Arc<PeerConnection>> {
        self.peers.read().get(id).cloned()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().contains_key(id)
    }

    /// Point-in-time copy of every connection
    pub fn snapshot(&self) -> Vec<Arc<PeerConnection>> {
        self.peers.read().values().cloned().collect()
    }

    /// Snapshot restricted to connections we dialed
    pub fn outbound(&self) -> Vec<Arc<PeerConnection>> {
        self.peers
            .read()
            .values()
            .filter(|conn| conn.is_outbound())
            .cloned()
            .collect()
    }

    /// Empty the registry, handing back what it held
    pub fn drain(&self) -> Vec<Arc<PeerConnection>> {
        self.peers.write().drain().map(|(_, conn)| conn).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
