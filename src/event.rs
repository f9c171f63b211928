//! Session event model — `spec.md` §6's "Events emitted by a session".
//!
//! Grounded in the teacher's `replication::events::{Event, Events}` broadcast-channel pattern
//! (best-effort `async_broadcast` fan-out with an inactive receiver kept around to hold the
//! channel open), generalized from the teacher's narrower core-to-replicator event set to the
//! full session-facing event set the façade must emit.

use async_broadcast::{broadcast, InactiveReceiver, Receiver, Sender};

use crate::extensions::PeerId;

/// Queue depth before the broadcast channel starts dropping the oldest unread event. Matches
/// the teacher's `MAX_EVENT_QUEUE_CAPACITY`.
const MAX_EVENT_QUEUE_CAPACITY: usize = 32;

/// An event a session may emit, per `spec.md` §6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The session (and its underlying Core) finished opening.
    Ready,
    /// The session closed. `is_last` is true when this was the last session sharing the Core,
    /// meaning storage was also released.
    Close {
        /// Whether this was the last open session on the log.
        is_last: bool,
    },
    /// A local or replicated append extended the log.
    Append,
    /// The log was truncated, starting a new fork.
    Truncate {
        /// New length after truncation.
        start: u64,
        /// Fork number after truncation.
        fork: u64,
    },
    /// A block was downloaded from a peer.
    Download {
        /// Index of the downloaded block.
        index: u64,
        /// Byte length of the downloaded block.
        byte_length: u64,
        /// Peer the block came from.
        from: PeerId,
    },
    /// A block was uploaded to a peer.
    Upload {
        /// Index of the uploaded block.
        index: u64,
        /// Byte length of the uploaded block.
        byte_length: u64,
        /// Peer the block was sent to.
        from: PeerId,
    },
    /// A peer was added to the replicator's peer set.
    PeerAdd {
        /// The newly added peer.
        peer: PeerId,
    },
    /// A peer was removed from the replicator's peer set.
    PeerRemove {
        /// The removed peer.
        peer: PeerId,
    },
}

/// The shared broadcast channel a Log's sessions subscribe to. One `Events` is held per Core
/// (shared by every session attached to it), mirroring the teacher's per-core `Events`.
#[derive(Debug)]
pub struct Events {
    sender: Sender<Event>,
    // Kept around so the channel stays open even while no session is actively subscribed.
    _inactive_receiver: InactiveReceiver<Event>,
}

impl Events {
    /// A fresh event channel with no subscribers yet.
    pub fn new() -> Self {
        let (mut sender, receiver) = broadcast(MAX_EVENT_QUEUE_CAPACITY);
        sender.set_await_active(false);
        let mut inactive_receiver = receiver.deactivate();
        inactive_receiver.set_overflow(true);
        Self {
            sender,
            _inactive_receiver: inactive_receiver,
        }
    }

    /// Broadcast an event to every subscribed session. Best effort: if no session is currently
    /// subscribed, the event is simply dropped, matching the teacher's rationale that no
    /// replicator/session being attached isn't itself an error.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.try_broadcast(event);
    }

    /// Subscribe a new session to this log's events.
    pub fn subscribe(&self) -> Receiver<Event> {
        self.sender.new_receiver()
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[async_std::test]
    async fn subscribed_session_receives_emitted_events() {
        let events = Events::new();
        let mut receiver = events.subscribe();

        events.emit(Event::Append);
        let received = receiver.next().await;
        assert_eq!(received, Some(Event::Append));
    }

    #[async_std::test]
    async fn emit_with_no_subscribers_does_not_panic() {
        let events = Events::new();
        events.emit(Event::Ready);
    }
}
