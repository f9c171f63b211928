//! External interface for replication: a Core shared across sessions and peers, plus the
//! peer set/download-range bookkeeping the façade drives (`spec.md` §6's "Replicator contract
//! (consumed)").
//!
//! Grounded in the teacher's `replication::{SharedCore, CoreInfo, CoreMethods,
//! ReplicationMethods}` (`shared_core.rs`), generalized from a concrete `Hypercore` to the
//! crate's generic [`crate::core::Core<T>`].

pub mod peer;
pub mod protocol;
pub mod range;

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use async_lock::Mutex;
use random_access_storage::RandomAccess;

use crate::core::{AppendOutcome, Core, Info};
use crate::crypto::PartialKeypair;
use crate::error::LogError;
use crate::event::{Event, Events};
use crate::extensions::Extensions;
use crate::tree::{BlockProof, Node};

pub use peer::{PeerHandle, PeerId, PeerSet};
pub use protocol::DuplexStream;
pub use range::{DownloadRange, RangeHandle};

/// A request for a single block, with the sender's known missing-node count — kept for
/// parity with `spec.md` §6's `requestBlock`/`missing_nodes` shape even though this crate's
/// in-memory tree has no separate node store to count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestBlock {
    /// Requested block index.
    pub index: u64,
}

/// A request to resolve a byte offset to `(index, relative_offset)`, per `spec.md` §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSeek {
    /// Byte offset being sought.
    pub bytes: u64,
}

/// A request to adopt a new upgrade (length, roots) at a claimed length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestUpgrade {
    /// Length the remote claims to have reached.
    pub length: u64,
}

/// An inclusion proof, plus the signed roots it was checked against — the unit exchanged
/// between peers to authenticate a block (`spec.md` §6's `Proof`). `roots`/`signature`/`fork`
/// are what let the receiver authenticate `block_proof` against the writer's key instead of
/// trusting a self-derived root: see `Core::verify_and_apply_proof`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    /// Raw block bytes being proven.
    pub block: Vec<u8>,
    /// The proof itself.
    pub block_proof: BlockProof,
    /// Length the proof was built against.
    pub upgrade_length: u64,
    /// Fork the proof was built against.
    pub fork: u64,
    /// Merkle roots at `upgrade_length`, as claimed by the prover.
    pub roots: Vec<Node>,
    /// ed25519 signature over `(hash_roots(roots), upgrade_length, fork)`.
    pub signature: [u8; 64],
}

/// A `Core` shared by every session on a log, and by the replicator driving its peers.
#[derive(Clone)]
pub struct SharedCore<T>(pub Arc<Mutex<Core<T>>>)
where
    T: RandomAccess<Error = Box<dyn std::error::Error + Send + Sync>> + Debug + Send;

impl<T> std::fmt::Debug for SharedCore<T>
where
    T: RandomAccess<Error = Box<dyn std::error::Error + Send + Sync>> + Debug + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedCore(..)")
    }
}

impl<T> From<Core<T>> for SharedCore<T>
where
    T: RandomAccess<Error = Box<dyn std::error::Error + Send + Sync>> + Debug + Send,
{
    fn from(core: Core<T>) -> Self {
        SharedCore(Arc::new(Mutex::new(core)))
    }
}

/// Methods related to just this core's information (`spec.md` §6 `core.tree.{length,
/// byteLength, fork}` and `core.defaultSign`/key material).
pub trait CoreInfo {
    /// Current counters.
    fn info(&self) -> impl Future<Output = Info> + Send;
    /// This core's key pair.
    fn key_pair(&self) -> impl Future<Output = PartialKeypair> + Send;
}

impl<T> CoreInfo for SharedCore<T>
where
    T: RandomAccess<Error = Box<dyn std::error::Error + Send + Sync>> + Debug + Send,
{
    fn info(&self) -> impl Future<Output = Info> + Send {
        async move { self.0.lock().await.info() }
    }

    fn key_pair(&self) -> impl Future<Output = PartialKeypair> + Send {
        async move {
            let core = self.0.lock().await;
            PartialKeypair {
                public: *core.public_key(),
                secret: None,
            }
        }
    }
}

/// Methods needed to drive replication against a shared core (`spec.md` §6's consumed
/// `Core`/`Replicator` surface, the part the façade calls through).
pub trait ReplicationMethods: CoreInfo + Send {
    /// ref `Core::verify_and_apply_proof`.
    fn verify_and_apply_proof(
        &self,
        proof: &Proof,
    ) -> impl Future<Output = Result<bool, LogError>> + Send;

    /// ref `Core::create_proof`.
    fn create_proof(
        &self,
        block: Option<RequestBlock>,
        upgrade: Option<RequestUpgrade>,
    ) -> impl Future<Output = Result<Option<Proof>, LogError>> + Send;
}

impl<T> ReplicationMethods for SharedCore<T>
where
    T: RandomAccess<Error = Box<dyn std::error::Error + Send + Sync>> + Debug + Send,
{
    fn verify_and_apply_proof(
        &self,
        proof: &Proof,
    ) -> impl Future<Output = Result<bool, LogError>> + Send {
        async move {
            let mut core = self.0.lock().await;
            core.verify_and_apply_proof(
                proof.block_proof.index,
                proof.block.clone(),
                &proof.block_proof,
                proof.upgrade_length,
                proof.fork,
                &proof.roots,
                &proof.signature,
            )
            .await
        }
    }

    /// Builds a proof scoped to this core's own current length: the single-slot header only
    /// ever holds a signature for the writer's latest full length (`SPEC_FULL.md` §E), so a
    /// requested upgrade length narrower than that is served at the core's current length
    /// instead — the receiver still ends up with an authenticated root, just not necessarily the
    /// exact length it asked for.
    fn create_proof(
        &self,
        block: Option<RequestBlock>,
        upgrade: Option<RequestUpgrade>,
    ) -> impl Future<Output = Result<Option<Proof>, LogError>> + Send {
        async move {
            let _ = upgrade;
            let block = match block {
                Some(block) => block,
                None => return Ok(None),
            };
            let mut core = self.0.lock().await;
            let upgrade_length = core.length();
            let block_proof = match core.create_proof(block.index, upgrade_length) {
                Some(proof) => proof,
                None => return Ok(None),
            };
            let bytes = match core.get(block.index).await? {
                Some(bytes) => bytes,
                None => return Ok(None),
            };
            let signature = match core.root_signature() {
                Some(signature) => signature,
                None => return Ok(None),
            };
            let signature: [u8; 64] = signature.try_into().map_err(|_| LogError::CryptoError {
                context: "stored root signature has the wrong length".to_string(),
            })?;
            let roots = core.roots(Some(upgrade_length));
            let fork = core.fork();

            Ok(Some(Proof {
                block: bytes,
                block_proof,
                upgrade_length,
                fork,
                roots,
                signature,
            }))
        }
    }
}

/// Core methods a session needs, independent of replication — `spec.md` §4.3/§4.4's
/// `get`/`append`/`has`, generalized so callers that only hold a [`SharedCore`] (rather than
/// an owned `Core`) can still drive the façade.
pub trait CoreMethods: CoreInfo {
    /// Whether `index` is present locally.
    fn has(&self, index: u64) -> impl Future<Output = bool> + Send;
    /// Fetch a block's raw bytes.
    fn get(&self, index: u64) -> impl Future<Output = Result<Option<Vec<u8>>, LogError>> + Send;
    /// Append one or more blocks.
    fn append(&self, values: &[Vec<u8>]) -> impl Future<Output = Result<AppendOutcome, LogError>> + Send;
    /// Truncate to a shorter length.
    fn truncate(&self, new_length: u64) -> impl Future<Output = Result<(), LogError>> + Send;
}

impl<T> CoreMethods for SharedCore<T>
where
    T: RandomAccess<Error = Box<dyn std::error::Error + Send + Sync>> + Debug + Send,
{
    fn has(&self, index: u64) -> impl Future<Output = bool> + Send {
        async move { self.0.lock().await.has(index) }
    }

    fn get(&self, index: u64) -> impl Future<Output = Result<Option<Vec<u8>>, LogError>> + Send {
        async move { self.0.lock().await.get(index).await }
    }

    fn append(&self, values: &[Vec<u8>]) -> impl Future<Output = Result<AppendOutcome, LogError>> + Send {
        async move { self.0.lock().await.append(values).await }
    }

    fn truncate(&self, new_length: u64) -> impl Future<Output = Result<(), LogError>> + Send {
        async move { self.0.lock().await.truncate(new_length).await }
    }
}

/// Peer set, connected streams, download ranges and broadcast plumbing for one log —
/// `spec.md` §6's `Replicator` consumed contract (`joinProtocol`, `addRange`, `broadcastInfo`,
/// `peers`).
pub struct Replicator<T>
where
    T: RandomAccess<Error = Box<dyn std::error::Error + Send + Sync>> + Debug + Send,
{
    core: SharedCore<T>,
    events: Arc<Events>,
    extensions: Extensions,
    peers: PeerSet,
    ranges: Mutex<Vec<DownloadRange>>,
    streams: Mutex<HashMap<PeerId, Box<dyn DuplexStream>>>,
}

impl<T> Replicator<T>
where
    T: RandomAccess<Error = Box<dyn std::error::Error + Send + Sync>> + Debug + Send,
{
    /// A replicator with no peers yet, attached to `core`'s event bus and `extensions`'
    /// registry so newly joined peers get a fresh advertisement (`spec.md` §4.9).
    pub fn new(core: SharedCore<T>, events: Arc<Events>, extensions: Extensions) -> Self {
        Self {
            core,
            events,
            extensions,
            peers: PeerSet::new(),
            ranges: Mutex::new(Vec::new()),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Register a newly connected peer with no stream attached yet, emitting `peer-add`
    /// (`spec.md` §4.9). Prefer [`Replicator::join_protocol`] when an actual duplex stream is
    /// available; this bare registration is for callers (and tests) that only need peer-set
    /// bookkeeping.
    pub fn add_peer(&self) -> PeerHandle {
        let peer = self.peers.add();
        self.events.emit(Event::PeerAdd { peer: peer.id() });
        peer
    }

    /// Perform the handshake over `stream`, register the resulting peer, advertise every
    /// currently-registered extension name to it (`spec.md` §4.9), and keep the stream so
    /// [`Replicator::request_block`]/[`Replicator::serve_request`]/[`Replicator::broadcast_info`]
    /// can drive it — the local half of `spec.md` §4.11's `joinProtocol`.
    pub async fn join_protocol<S>(&self, mut stream: S, is_initiator: bool) -> Result<PeerHandle, LogError>
    where
        S: DuplexStream + 'static,
    {
        protocol::perform_handshake(&mut stream, is_initiator).await?;

        let peer = self.add_peer();
        for name in self.extensions.names().await {
            protocol::write_message(&mut stream, &protocol::Message::ExtensionAnnounce { name }).await?;
        }
        self.streams.lock().await.insert(peer.id(), Box::new(stream));
        Ok(peer)
    }

    /// Remove a peer, emitting `peer-remove`.
    pub async fn remove_peer(&self, peer: PeerId) {
        self.peers.remove(peer);
        self.streams.lock().await.remove(&peer);
        self.events.emit(Event::PeerRemove { peer });
    }

    /// Currently connected peers.
    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.ids()
    }

    /// Register a download range (`spec.md` §4.12). Returns a handle whose `destroy` cancels it.
    pub async fn add_range(&self, range: DownloadRange) -> RangeHandle {
        let id = range.id();
        self.ranges.lock().await.push(range);
        RangeHandle::new(id)
    }

    /// Cancel a previously registered range.
    pub async fn destroy_range(&self, handle: &RangeHandle) {
        self.ranges.lock().await.retain(|r| r.id() != handle.id());
    }

    /// Verify and apply a proof a peer already sent (e.g. unsolicited, or fetched by a caller
    /// driving its own transport) — the validating half of `spec.md` §6's `requestBlock`.
    pub async fn apply_remote_block(&self, from: PeerId, proof: Proof) -> Result<bool, LogError> {
        let byte_length = proof.block.len() as u64;
        let index = proof.block_proof.index;
        let applied = self.core.verify_and_apply_proof(&proof).await?;
        if applied {
            self.events.emit(Event::Download {
                index,
                byte_length,
                from,
            });
        }
        Ok(applied)
    }

    /// Request a block from `peer` over its joined stream, verify the returned proof and apply
    /// it — the requesting half of `spec.md` §6's `requestBlock`, used by `Log::get`'s
    /// wait-and-fetch path (`spec.md` §4.3 step 4).
    pub async fn request_block(&self, peer: PeerId, index: u64) -> Result<Vec<u8>, LogError> {
        let mut streams = self.streams.lock().await;
        let stream = streams.get_mut(&peer).ok_or_else(|| LogError::PeerRequestFailed {
            context: format!("peer {peer} has no joined replication stream"),
        })?;

        protocol::write_message(
            stream,
            &protocol::Message::RequestBlock {
                block: RequestBlock { index },
                upgrade: None,
            },
        )
        .await?;
        let reply = protocol::read_message(stream).await?;
        drop(streams);

        match reply {
            protocol::Message::Data(proof) => {
                let block = proof.block.clone();
                let applied = self.apply_remote_block(peer, proof).await?;
                if !applied {
                    return Err(LogError::InvalidSignature {
                        context: format!("peer {peer} sent a block {index} proof that failed verification"),
                    });
                }
                Ok(block)
            }
            protocol::Message::NotFound => Err(LogError::PeerRequestFailed {
                context: format!("peer {peer} does not have block {index}"),
            }),
            _ => Err(LogError::InvalidStream {
                context: "unexpected reply to RequestBlock".to_string(),
            }),
        }
    }

    /// Ask `peer` whether it has a longer log than this one (`spec.md` §6's `requestUpgrade`).
    pub async fn request_upgrade(&self, peer: PeerId) -> Result<bool, LogError> {
        let mut streams = self.streams.lock().await;
        let stream = streams.get_mut(&peer).ok_or_else(|| LogError::PeerRequestFailed {
            context: format!("peer {peer} has no joined replication stream"),
        })?;
        protocol::write_message(stream, &protocol::Message::RequestUpgrade).await?;
        let reply = protocol::read_message(stream).await?;
        drop(streams);

        match reply {
            protocol::Message::UpgradeInfo { length, .. } => Ok(length > self.core.info().await.length),
            _ => Err(LogError::InvalidStream {
                context: "unexpected reply to RequestUpgrade".to_string(),
            }),
        }
    }

    /// Ask `peer` to resolve a byte offset (`spec.md` §4.6/§6's `requestSeek`).
    pub async fn request_seek(&self, peer: PeerId, bytes: u64) -> Result<(u64, u64), LogError> {
        let mut streams = self.streams.lock().await;
        let stream = streams.get_mut(&peer).ok_or_else(|| LogError::PeerRequestFailed {
            context: format!("peer {peer} has no joined replication stream"),
        })?;
        protocol::write_message(stream, &protocol::Message::RequestSeek(RequestSeek { bytes })).await?;
        let reply = protocol::read_message(stream).await?;
        drop(streams);

        match reply {
            protocol::Message::SeekInfo { index, offset } => Ok((index, offset)),
            _ => Err(LogError::InvalidStream {
                context: "unexpected reply to RequestSeek".to_string(),
            }),
        }
    }

    /// Read and answer one incoming message from `peer`'s joined stream — the serving side of
    /// `requestBlock`/`requestSeek`/`requestUpgrade`, and the dispatch point for extension
    /// messages (`spec.md` §4.1's `extensions`).
    pub async fn serve_request(&self, peer: PeerId) -> Result<(), LogError> {
        let mut streams = self.streams.lock().await;
        let stream = streams.get_mut(&peer).ok_or_else(|| LogError::PeerRequestFailed {
            context: format!("peer {peer} has no joined replication stream"),
        })?;
        let message = protocol::read_message(stream).await?;

        match message {
            protocol::Message::RequestBlock { block, upgrade } => {
                let proof = self.core.create_proof(Some(block), upgrade).await?;
                let reply = match proof {
                    Some(proof) => protocol::Message::Data(proof),
                    None => protocol::Message::NotFound,
                };
                protocol::write_message(stream, &reply).await
            }
            protocol::Message::RequestSeek(seek) => {
                let info = match self.core.0.lock().await.seek(seek.bytes) {
                    Some((index, offset)) => protocol::Message::SeekInfo { index, offset },
                    None => protocol::Message::NotFound,
                };
                protocol::write_message(stream, &info).await
            }
            protocol::Message::RequestUpgrade => {
                let info = self.core.info().await;
                protocol::write_message(
                    stream,
                    &protocol::Message::UpgradeInfo {
                        length: info.length,
                        fork: info.fork,
                    },
                )
                .await
            }
            protocol::Message::Extension { name, payload } => {
                self.extensions.dispatch(&name, peer, &payload).await;
                Ok(())
            }
            protocol::Message::Have { .. } | protocol::Message::ExtensionAnnounce { .. } => Ok(()),
            protocol::Message::Data(_) | protocol::Message::NotFound | protocol::Message::UpgradeInfo { .. } | protocol::Message::SeekInfo { .. } => {
                Err(LogError::InvalidStream {
                    context: "unsolicited reply-shaped message on incoming side".to_string(),
                })
            }
        }
    }

    /// Broadcast the current log length to every joined peer (`spec.md` §4.8). Per-peer write
    /// failures are logged and skipped rather than aborting the whole broadcast.
    pub async fn broadcast_info(&self) {
        let info = self.core.info().await;
        let mut streams = self.streams.lock().await;
        for (peer, stream) in streams.iter_mut() {
            let message = protocol::Message::Have {
                start: 0,
                length: info.length,
            };
            if let Err(error) = protocol::write_message(stream, &message).await {
                tracing::warn!(peer = *peer, %error, "broadcast_info: failed to notify peer");
            }
        }
    }

    /// Build a proof for a block this side holds, to answer a peer's `requestBlock` — the
    /// serving half of `spec.md` §6's `requestBlock`/`broadcastBlock`.
    pub async fn create_proof(
        &self,
        block: Option<RequestBlock>,
        upgrade: Option<RequestUpgrade>,
    ) -> Result<Option<Proof>, LogError> {
        self.core.create_proof(block, upgrade).await
    }
}
