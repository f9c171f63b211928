//! Connected-peer bookkeeping for a [`crate::replication::Replicator`].
//!
//! No teacher module tracks a peer set explicitly (the teacher's replicator is out of tree);
//! grounded in the crate's own [`crate::extensions::PeerId`] opaque-id convention and in the
//! general shape of `common::PeerState` style per-peer bookkeeping used across the pack.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub use crate::extensions::PeerId;

/// A live peer connection, identified by an opaque id assigned on `add`.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: PeerId,
}

impl PeerHandle {
    /// This peer's id.
    pub fn id(&self) -> PeerId {
        self.id
    }
}

/// The set of currently connected peers for one log.
#[derive(Debug)]
pub struct PeerSet {
    next_id: AtomicU64,
    ids: Arc<Mutex<Vec<PeerId>>>,
}

impl PeerSet {
    /// An empty peer set.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ids: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a new peer, returning its handle.
    pub fn add(&self) -> PeerHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.ids.lock().unwrap().push(id);
        PeerHandle { id }
    }

    /// Remove a peer by id.
    pub fn remove(&self, id: PeerId) {
        self.ids.lock().unwrap().retain(|&existing| existing != id);
    }

    /// Currently connected peer ids.
    pub fn ids(&self) -> Vec<PeerId> {
        self.ids.lock().unwrap().clone()
    }
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_track_membership() {
        let peers = PeerSet::new();
        let a = peers.add();
        let b = peers.add();
        assert_eq!(peers.ids(), vec![a.id(), b.id()]);

        peers.remove(a.id());
        assert_eq!(peers.ids(), vec![b.id()]);
    }
}
