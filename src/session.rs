//! The public log façade and session multiplexing — `spec.md` §2's "Log façade & Session",
//! the 60%-of-budget component this crate exists to implement. `Core`, `Replicator`, storage
//! and crypto are the external collaborators it orchestrates (`spec.md` §6).
//!
//! No single teacher file plays this role (the teacher's `Hypercore<T>` in `core.rs` is closer
//! to this crate's own `core::Core`, with no session layer above it); grounded instead in the
//! teacher's general shape for shared, lock-guarded state (`replication::SharedCore`) and its
//! `Events`/broadcast pattern, generalized upward into the multi-session façade `spec.md` §3-§5
//! describe. Per `DESIGN.md`, the synchronous accessors `spec.md` §5 lists (`length`,
//! `byteLength`, `fork`, `writable`) become `async` here: unlike the single-threaded JS runtime
//! the original design assumes, this façade's Core is reached through an `async_lock::Mutex`
//! shared by every session, so even a plain counter read must await the lock.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_broadcast::Receiver;
use ed25519_dalek::VerifyingKey;
use random_access_storage::RandomAccess;
use tracing::instrument;

use crate::core::{AppendOutcome, Core, Info};
use crate::crypto::discovery_key;
use crate::encoding::{BatchEncoder, PerValueBatchEncoder, RawEncoding, ValueEncoding};
use crate::encryption::PADDING;
use crate::error::LogError;
use crate::event::{Event, Events};
use crate::extensions::{ExtensionHandler, Extensions, PeerId};
use crate::replication::{
    CoreInfo, CoreMethods, DownloadRange, PeerHandle, RangeHandle, Replicator, SharedCore,
};

/// An immutable `(length, byteLength, fork)` triple pinned at session creation — `spec.md`
/// §4.7. While pinned, the owning session's observed counters never change even as the shared
/// Core keeps growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Length pinned at snapshot time.
    pub length: u64,
    /// Byte length pinned at snapshot time.
    pub byte_length: u64,
    /// Fork pinned at snapshot time.
    pub fork: u64,
}

/// Options accepted by [`Log::get`] — `spec.md` §4.3.
#[derive(Clone)]
pub struct GetOptions {
    /// If `false`, return `Ok(None)` immediately instead of waiting on a remote fetch when the
    /// block isn't present locally. Defaults to `true`.
    pub wait: bool,
    /// Override this call's value encoding, instead of the session's configured one.
    pub value_encoding: Option<Arc<dyn ValueEncoding>>,
    /// Called with the missing index right before a remote fetch is attempted, letting a caller
    /// register a download range or otherwise prioritize the request (`spec.md` §4.3 step 4).
    pub onwait: Option<Arc<dyn Fn(u64) + Send + Sync>>,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            wait: true,
            value_encoding: None,
            onwait: None,
        }
    }
}

/// State shared by every session on one log: the Core, its event bus, extension registry and
/// replicator. Released when the last session closes (`spec.md` §3's Session lifecycle).
struct Shared<T>
where
    T: RandomAccess<Error = Box<dyn std::error::Error + Send + Sync>> + Debug + Send,
{
    core: SharedCore<T>,
    events: Arc<Events>,
    extensions: Extensions,
    replicator: Replicator<T>,
    session_count: AtomicUsize,
}

/// A handle onto a log, sharing its Core, Replicator, extensions and key material with every
/// other session on the same log (`spec.md` §3's Session). The first `Log` constructed for a
/// Core (via [`crate::builder::LogBuilder::build`]) is the root session; further sessions come
/// from [`Log::session`] or [`Log::snapshot`].
pub struct Log<T>
where
    T: RandomAccess<Error = Box<dyn std::error::Error + Send + Sync>> + Debug + Send,
{
    shared: Arc<Shared<T>>,
    value_encoding: Arc<dyn ValueEncoding>,
    encode_batch: Option<Arc<dyn BatchEncoder>>,
    snapshot: Option<Snapshot>,
    closed: AtomicBool,
}

impl<T> Log<T>
where
    T: RandomAccess<Error = Box<dyn std::error::Error + Send + Sync>> + Debug + Send,
{
    pub(crate) fn from_core(core: Core<T>, extensions: Extensions) -> Self {
        let events = Arc::new(Events::new());
        let shared_core = SharedCore::from(core);
        let replicator = Replicator::new(shared_core.clone(), events.clone(), extensions.clone());
        let shared = Arc::new(Shared {
            core: shared_core,
            events,
            extensions,
            replicator,
            session_count: AtomicUsize::new(1),
        });
        shared.events.emit(Event::Ready);
        Self {
            shared,
            value_encoding: Arc::new(RawEncoding),
            encode_batch: None,
            snapshot: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Create a sibling session sharing this log's Core, Replicator and extension registry
    /// (`spec.md` §4.1's capability-passing, minus a fresh `ready` — that only fires once per
    /// Log, on the root session).
    pub fn session(&self) -> Self {
        self.shared.session_count.fetch_add(1, Ordering::SeqCst);
        Self {
            shared: self.shared.clone(),
            value_encoding: Arc::new(RawEncoding),
            encode_batch: None,
            snapshot: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Create a child session pinned to this log's current counters (`spec.md` §4.7). The
    /// pinned session inherits this session's value encoding.
    pub async fn snapshot(&self) -> Self {
        let info = self.shared.core.info().await;
        self.shared.session_count.fetch_add(1, Ordering::SeqCst);
        Self {
            shared: self.shared.clone(),
            value_encoding: self.value_encoding.clone(),
            encode_batch: self.encode_batch.clone(),
            snapshot: Some(Snapshot {
                length: info.length,
                byte_length: info.byte_length,
                fork: info.fork,
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// This session's pinned snapshot, if it has one.
    pub fn pinned(&self) -> Option<Snapshot> {
        self.snapshot
    }

    /// Apply a value encoding to this session (`spec.md` §4.1's `valueEncoding` option).
    pub fn with_value_encoding(mut self, encoding: Arc<dyn ValueEncoding>) -> Self {
        self.value_encoding = encoding;
        self
    }

    /// Override per-block encoding with a whole-batch encoder at append time (`spec.md` §4.1's
    /// `encodeBatch` option).
    pub fn with_encode_batch(mut self, encoder: Arc<dyn BatchEncoder>) -> Self {
        self.encode_batch = Some(encoder);
        self
    }

    /// Current counters, respecting this session's pinned snapshot if any.
    pub async fn info(&self) -> Info {
        if let Some(snapshot) = self.snapshot {
            let writable = self.shared.core.info().await.writable;
            return Info {
                length: snapshot.length,
                byte_length: snapshot.byte_length,
                fork: snapshot.fork,
                writable,
            };
        }
        self.shared.core.info().await
    }

    /// Current length, respecting a pinned snapshot.
    pub async fn length(&self) -> u64 {
        self.info().await.length
    }

    /// Current byte length, respecting a pinned snapshot.
    pub async fn byte_length(&self) -> u64 {
        self.info().await.byte_length
    }

    /// Current fork, respecting a pinned snapshot.
    pub async fn fork(&self) -> u64 {
        self.info().await.fork
    }

    /// Whether this log has a signer attached.
    pub async fn writable(&self) -> bool {
        self.shared.core.info().await.writable
    }

    /// This log's public key.
    pub async fn public_key(&self) -> VerifyingKey {
        self.shared.core.key_pair().await.public
    }

    /// This log's discovery key, safe to share with peers who don't yet know the public key.
    pub async fn discovery_key(&self) -> [u8; 32] {
        let public = self.public_key().await;
        discovery_key(&public.to_bytes())
    }

    /// The fixed per-block padding length (`spec.md` §5's `padding` accessor). Always `0`: block
    /// encryption here derives its nonce from `(index, fork)` rather than a stored prefix.
    pub fn padding(&self) -> u8 {
        PADDING
    }

    /// Currently connected replication peers.
    pub fn peers(&self) -> Vec<PeerId> {
        self.shared.replicator.peers()
    }

    /// Whether `index` is present locally (`spec.md` §4.3 step 4's bitfield check), clamped to
    /// a pinned snapshot's length.
    pub async fn has(&self, index: u64) -> bool {
        if let Some(snapshot) = self.snapshot {
            if index >= snapshot.length {
                return false;
            }
        }
        self.shared.core.has(index).await
    }

    /// Read the block at `index` (`spec.md` §4.3).
    #[instrument(skip(self, opts), err)]
    pub async fn get(&self, index: u64, opts: GetOptions) -> Result<Option<Vec<u8>>, LogError> {
        if let Some(snapshot) = self.snapshot {
            if index >= snapshot.length {
                return Ok(None);
            }
        }
        let raw = match self.shared.core.get(index).await? {
            Some(bytes) => bytes,
            None if !opts.wait => return Ok(None),
            None => {
                if let Some(onwait) = &opts.onwait {
                    onwait(index);
                }
                self.fetch_from_any_peer(index).await?
            }
        };
        let encoding = opts.value_encoding.unwrap_or_else(|| self.value_encoding.clone());
        encoding.decode(&raw)
    }

    /// Try every connected peer in turn until one answers `requestBlock` with a proof that
    /// verifies — the wait-and-fetch half of `spec.md` §4.3 step 4, driven by
    /// [`crate::replication::Replicator::request_block`].
    async fn fetch_from_any_peer(&self, index: u64) -> Result<Vec<u8>, LogError> {
        let peers = self.shared.replicator.peers();
        if peers.is_empty() {
            return Err(LogError::PeerRequestFailed {
                context: format!("block {index} is not available locally and no replication peer is connected"),
            });
        }
        let mut last_error = None;
        for peer in peers {
            match self.shared.replicator.request_block(peer, index).await {
                Ok(bytes) => return Ok(bytes),
                Err(error) => last_error = Some(error),
            }
        }
        Err(last_error.unwrap_or_else(|| LogError::PeerRequestFailed {
            context: format!("block {index} could not be fetched from any connected peer"),
        }))
    }

    /// Append one or more blocks (`spec.md` §4.4). Requires `writable`.
    #[instrument(skip(self, values), err)]
    pub async fn append(&self, values: Vec<Vec<u8>>) -> Result<AppendOutcome, LogError> {
        let encoded = match &self.encode_batch {
            Some(encoder) => encoder.encode_batch(&values)?,
            None => PerValueBatchEncoder {
                encoding: self.value_encoding.as_ref(),
            }
            .encode_batch(&values)?,
        };
        let outcome = self.shared.core.append(&encoded).await?;
        self.shared.events.emit(Event::Append);
        self.shared.replicator.broadcast_info().await;
        Ok(outcome)
    }

    /// Truncate to `new_length`, starting a new fork (`spec.md` §4.5). `Core` always bumps the
    /// fork by exactly one; an arbitrary explicit target fork isn't supported by the in-memory
    /// tree, a deliberate simplification over `spec.md`'s `fork` parameter (see `DESIGN.md`).
    #[instrument(skip(self), err)]
    pub async fn truncate(&self, new_length: u64) -> Result<(), LogError> {
        self.shared.core.truncate(new_length).await?;
        let fork = self.shared.core.info().await.fork;
        self.shared.events.emit(Event::Truncate {
            start: new_length,
            fork,
        });
        self.shared.replicator.broadcast_info().await;
        Ok(())
    }

    /// Translate a byte offset into `(block_index, relative_offset)` (`spec.md` §4.6).
    pub async fn seek(&self, bytes: u64) -> Option<(u64, u64)> {
        let core = self.shared.core.0.lock().await;
        core.seek(bytes)
    }

    /// The deterministic hash of the Merkle roots at `length` (defaults to the current length)
    /// — `spec.md` §4.13.
    pub async fn tree_hash(&self, length: Option<u64>) -> [u8; 32] {
        let core = self.shared.core.0.lock().await;
        core.tree_hash(length)
    }

    /// Read a user-data entry (`spec.md` §4.13).
    pub async fn get_user_data(&self, key: &str) -> Option<Vec<u8>> {
        let core = self.shared.core.0.lock().await;
        core.get_user_data(key)
    }

    /// Set (or clear, with `value: None`) a user-data entry.
    pub async fn set_user_data(&self, key: String, value: Option<Vec<u8>>) -> Result<(), LogError> {
        let mut core = self.shared.core.0.lock().await;
        core.set_user_data(key, value).await
    }

    /// Register (or replace) a local handler for a named extension channel, advertised to peers
    /// (`spec.md` §4.1's `extensions`, §4.9's advertisement-on-peer-add).
    pub async fn register_extension(&self, name: impl Into<String>, handler: ExtensionHandler) {
        self.shared.extensions.register(name, handler).await;
    }

    /// Declare an extension with no local handler — still advertised, incoming messages dropped.
    pub async fn declare_extension(&self, name: impl Into<String>) {
        self.shared.extensions.declare(name).await;
    }

    /// Remove a registered extension.
    pub async fn unregister_extension(&self, name: &str) {
        self.shared.extensions.unregister(name).await;
    }

    /// Join the replication protocol over `stream`: perform the handshake, register the
    /// resulting peer and advertise every declared extension to it (`spec.md` §4.11's
    /// `replicate`). The caller supplies the already-connected transport; everything from the
    /// Noise handshake onward is driven by [`crate::replication::protocol`].
    pub async fn replicate<S>(&self, stream: S, is_initiator: bool) -> Result<PeerHandle, LogError>
    where
        S: futures::io::AsyncRead + futures::io::AsyncWrite + Unpin + Send + 'static,
    {
        self.shared.replicator.join_protocol(stream, is_initiator).await
    }

    /// Register a peer with no stream of its own — for callers that exchange proofs out of
    /// band (e.g. over a transport this crate doesn't drive) and only need the peer-set
    /// bookkeeping and `peer-add` event `spec.md` §4.9 describes.
    pub fn add_peer(&self) -> PeerHandle {
        self.shared.replicator.add_peer()
    }

    /// Detach a replication peer (`spec.md` §4.9's `peer-remove`).
    pub fn remove_peer(&self, peer: PeerId) {
        self.shared.replicator.remove_peer(peer);
    }

    /// Register a download range (`spec.md` §4.12). Returns a handle whose destruction via
    /// [`Log::cancel_download`] cancels it.
    pub async fn download(&self, range: DownloadRange) -> RangeHandle {
        self.shared.replicator.add_range(range).await
    }

    /// Cancel a previously registered download range.
    pub async fn cancel_download(&self, handle: &RangeHandle) {
        self.shared.replicator.destroy_range(handle).await;
    }

    /// Read and answer one pending request from `peer` over its joined stream (`spec.md` §6's
    /// `requestBlock`/`requestSeek`/`requestUpgrade` serving side, plus extension dispatch).
    /// Callers that accept incoming peers via [`Log::replicate`] drive this in a loop per peer.
    pub async fn serve_request(&self, peer: PeerId) -> Result<(), LogError> {
        self.shared.replicator.serve_request(peer).await
    }

    /// Build a proof for a locally-held block, to answer a peer's request (`spec.md` §6's
    /// `requestBlock` serving side).
    pub async fn create_proof(
        &self,
        index: u64,
        upgrade_length: u64,
    ) -> Result<Option<crate::replication::Proof>, LogError> {
        self.shared
            .replicator
            .create_proof(
                Some(crate::replication::RequestBlock { index }),
                Some(crate::replication::RequestUpgrade {
                    length: upgrade_length,
                }),
            )
            .await
    }

    /// Verify and apply a block a peer sent in response to a request, emitting `download` on
    /// success (`spec.md` §6's `requestBlock`/`onupdate` value-present path).
    pub async fn apply_remote_block(&self, from: PeerId, proof: crate::replication::Proof) -> Result<bool, LogError> {
        self.shared.replicator.apply_remote_block(from, proof).await
    }

    /// Subscribe to this log's events (`spec.md` §6's "Events emitted by a session").
    pub fn subscribe(&self) -> Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Close this session. Idempotent: a second call is a no-op. Emits `close(is_last)`, where
    /// `is_last` is true only for the session that brought the log's session count to zero
    /// (`spec.md` §3's lifecycle, §5's ordering guarantee on the final close).
    #[instrument(skip(self), err)]
    pub async fn close(&self) -> Result<(), LogError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let remaining = self.shared.session_count.fetch_sub(1, Ordering::SeqCst) - 1;
        self.shared.events.emit(Event::Close {
            is_last: remaining == 0,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::LogBuilder;
    use futures::StreamExt;

    #[async_std::test]
    async fn append_and_get_round_trip_through_a_session() {
        let log = LogBuilder::memory().await.unwrap();
        log.append(vec![b"hello".to_vec()]).await.unwrap();
        let value = log.get(0, GetOptions::default()).await.unwrap();
        assert_eq!(value, Some(b"hello".to_vec()));
    }

    #[async_std::test]
    async fn get_with_wait_false_returns_none_for_missing_block() {
        let log = LogBuilder::memory().await.unwrap();
        let opts = GetOptions {
            wait: false,
            value_encoding: None,
            onwait: None,
        };
        assert_eq!(log.get(0, opts).await.unwrap(), None);
    }

    #[async_std::test]
    async fn get_with_wait_true_errors_for_missing_block() {
        let log = LogBuilder::memory().await.unwrap();
        let result = log.get(0, GetOptions::default()).await;
        assert!(matches!(result, Err(LogError::PeerRequestFailed { .. })));
    }

    #[async_std::test]
    async fn sibling_session_shares_appended_data() {
        let log = LogBuilder::memory().await.unwrap();
        log.append(vec![b"shared".to_vec()]).await.unwrap();
        let sibling = log.session();
        assert_eq!(sibling.length().await, 1);
        assert_eq!(
            sibling.get(0, GetOptions::default()).await.unwrap(),
            Some(b"shared".to_vec())
        );
    }

    #[async_std::test]
    async fn snapshot_stays_pinned_past_further_appends() {
        let log = LogBuilder::memory().await.unwrap();
        log.append(vec![b"one".to_vec()]).await.unwrap();
        let snapshot = log.snapshot().await;
        log.append(vec![b"two".to_vec()]).await.unwrap();

        assert_eq!(snapshot.length().await, 1);
        assert_eq!(log.length().await, 2);
        assert_eq!(snapshot.has(1).await, false);
    }

    #[async_std::test]
    async fn truncate_emits_truncate_event_with_bumped_fork() {
        let log = LogBuilder::memory().await.unwrap();
        log.append(vec![b"a".to_vec(), b"b".to_vec()]).await.unwrap();
        let mut events = log.subscribe();

        log.truncate(1).await.unwrap();

        let mut saw_truncate = false;
        while let Some(event) = events.next().await {
            if let Event::Truncate { start, fork } = event {
                assert_eq!(start, 1);
                assert_eq!(fork, 1);
                saw_truncate = true;
                break;
            }
        }
        assert!(saw_truncate);
    }

    #[async_std::test]
    async fn close_is_idempotent_and_marks_last_session() {
        let log = LogBuilder::memory().await.unwrap();
        let mut events = log.subscribe();
        log.close().await.unwrap();
        log.close().await.unwrap();

        let mut saw_last_close = false;
        while let Some(event) = events.next().await {
            if let Event::Close { is_last } = event {
                assert!(is_last);
                saw_last_close = true;
                break;
            }
        }
        assert!(saw_last_close);
    }
}
