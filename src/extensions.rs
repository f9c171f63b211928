//! Named extension channels multiplexed over the replication protocol — `spec.md` §4.1's
//! `extensions` registry and GLOSSARY's "Extension: a named side-channel multiplexed over the
//! replication protocol".
//!
//! No teacher module covers this (the teacher's `replicate/` only implements the core block
//! wire protocol, with no extension mechanism). Grounded in the crate's own broadcast-based
//! event pattern (`event.rs`, `async-broadcast`) for fan-out, and in `common::PeerState`-style
//! peer bookkeeping for per-peer dispatch, generalized to a name-keyed handler table.

use std::collections::HashMap;
use std::sync::Arc;

use async_lock::Mutex;

/// Opaque identifier for a connected replication peer, assigned by the
/// [`crate::replication::Replicator`] when a peer is added.
pub type PeerId = u64;

/// Callback invoked when a message arrives on a registered extension from a given peer.
pub type ExtensionHandler = Arc<dyn Fn(PeerId, &[u8]) + Send + Sync>;

/// A single named extension's local handler, if one is registered.
struct Slot {
    handler: Option<ExtensionHandler>,
}

/// The shared extension registry attached to a Log: `spec.md` §4.1 `extensions`. Registering a
/// name here is what gets advertised to peers on `peer-add` per §4.9.
#[derive(Clone, Default)]
pub struct Extensions {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Extensions(..)")
    }
}

impl Extensions {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named extension, attaching (or replacing) its local handler. Returns the
    /// previously-registered handler's name set, so the replicator can decide whether a fresh
    /// advertisement to peers is needed.
    pub async fn register(&self, name: impl Into<String>, handler: ExtensionHandler) {
        let mut slots = self.slots.lock().await;
        slots.insert(
            name.into(),
            Slot {
                handler: Some(handler),
            },
        );
    }

    /// Declare an extension name with no local handler — still advertised to peers, but
    /// incoming messages on it are silently dropped.
    pub async fn declare(&self, name: impl Into<String>) {
        let mut slots = self.slots.lock().await;
        slots.entry(name.into()).or_insert(Slot { handler: None });
    }

    /// Remove a registered extension.
    pub async fn unregister(&self, name: &str) {
        self.slots.lock().await.remove(name);
    }

    /// Names currently registered, for advertisement to a newly added peer (`spec.md` §4.9).
    pub async fn names(&self) -> Vec<String> {
        self.slots.lock().await.keys().cloned().collect()
    }

    /// Dispatch an incoming extension message from `peer` to its registered handler, if any.
    /// Returns whether a handler ran.
    pub async fn dispatch(&self, name: &str, peer: PeerId, message: &[u8]) -> bool {
        let handler = {
            let slots = self.slots.lock().await;
            slots.get(name).and_then(|slot| slot.handler.clone())
        };
        match handler {
            Some(handler) => {
                handler(peer, message);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[async_std::test]
    async fn register_and_dispatch_runs_handler() {
        let extensions = Extensions::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        extensions
            .register(
                "chat",
                Arc::new(move |_peer, _msg| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;

        assert_eq!(extensions.names().await, vec!["chat".to_string()]);
        assert!(extensions.dispatch("chat", 1, b"hi").await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(!extensions.dispatch("unknown", 1, b"hi").await);
    }

    #[async_std::test]
    async fn declared_without_handler_is_advertised_but_inert() {
        let extensions = Extensions::new();
        extensions.declare("silent").await;
        assert!(!extensions.dispatch("silent", 1, b"x").await);
    }
}
