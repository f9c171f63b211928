//! Wire protocol: a Noise handshake to secure the duplex stream, then length-prefixed
//! `compact_encoding` messages carrying block/upgrade/seek requests and their proofs.
//!
//! Grounded in the sibling pack repo `MODULUSREBUS-libdata/protocol/src/noise/handshake.rs`
//! (`snow`-based `Noise_XX_25519_ChaChaPoly_BLAKE2b` handshake, `dangerously_get_raw_split` via
//! the `risky-raw-split` feature) — `spec.md` §4.11 calls this "construct a secure stream,
//! build a protocol" without specifying the handshake pattern itself, so the sibling's is reused
//! verbatim rather than invented.

use compact_encoding::{CompactEncoding, EncodingError, State};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use rand::RngCore;
use snow::{Builder, HandshakeState};

use crate::error::LogError;
use crate::replication::{PeerId, Proof, RequestBlock, RequestSeek, RequestUpgrade};
use crate::tree::{BlockProof, Node};

const HANDSHAKE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2b";
const CIPHER_KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 24;
const MAX_FRAME_LENGTH: u32 = 64 * 1024 * 1024;

/// A stream a [`crate::replication::Replicator`] can hold onto and drive — any transport that
/// is readable, writable and safe to move between peer tasks.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<S> DuplexStream for S where S: AsyncRead + AsyncWrite + Unpin + Send {}

/// Session keys derived once the handshake completes — matches the sibling's `Outcome` shape,
/// trimmed to what this crate's framing actually uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Whether this side initiated the handshake.
    pub is_initiator: bool,
    /// The remote's static public key.
    pub remote_pubkey: Vec<u8>,
    /// Transmit-direction split key.
    pub split_tx: [u8; CIPHER_KEY_LENGTH],
    /// Receive-direction split key.
    pub split_rx: [u8; CIPHER_KEY_LENGTH],
}

fn build_handshake_state(is_initiator: bool) -> Result<(HandshakeState, snow::Keypair), LogError> {
    let map_err = |e: snow::Error| LogError::CryptoError {
        context: e.to_string(),
    };
    let builder: Builder<'_> = Builder::new(HANDSHAKE_PATTERN.parse().map_err(map_err)?);
    let key_pair = builder.generate_keypair().map_err(map_err)?;
    let builder = builder.local_private_key(&key_pair.private);
    let state = if is_initiator {
        builder.build_initiator().map_err(map_err)?
    } else {
        builder.build_responder().map_err(map_err)?
    };
    Ok((state, key_pair))
}

/// Drives a single Noise XX handshake to completion over whatever transport the caller supplies
/// the raw bytes from/to.
pub struct Handshake {
    state: HandshakeState,
    is_initiator: bool,
    local_nonce: [u8; NONCE_LENGTH],
    tx_buf: Vec<u8>,
    rx_buf: Vec<u8>,
    complete: bool,
    did_receive: bool,
}

impl Handshake {
    /// Start a fresh handshake, initiator or responder.
    pub fn new(is_initiator: bool) -> Result<Self, LogError> {
        let (state, _keypair) = build_handshake_state(is_initiator)?;
        let mut local_nonce = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut local_nonce);
        Ok(Self {
            state,
            is_initiator,
            local_nonce,
            tx_buf: vec![0u8; 512],
            rx_buf: vec![0u8; 512],
            complete: false,
            did_receive: false,
        })
    }

    /// Whether the handshake has completed key exchange.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The initiator sends the first message; the responder waits.
    pub fn start(&mut self) -> Result<Option<Vec<u8>>, LogError> {
        if !self.is_initiator {
            return Ok(None);
        }
        let len = self.send()?;
        Ok(Some(self.tx_buf[..len].to_vec()))
    }

    fn send(&mut self) -> Result<usize, LogError> {
        self.state
            .write_message(&self.local_nonce, &mut self.tx_buf)
            .map_err(|e| LogError::CryptoError {
                context: e.to_string(),
            })
    }

    fn recv(&mut self, msg: &[u8]) -> Result<usize, LogError> {
        self.state
            .read_message(msg, &mut self.rx_buf)
            .map_err(|e| LogError::CryptoError {
                context: e.to_string(),
            })
    }

    /// Feed an incoming handshake message, returning the next outgoing one (if any).
    pub fn read(&mut self, msg: &[u8]) -> Result<Option<Vec<u8>>, LogError> {
        if self.complete {
            return Err(LogError::InvalidStream {
                context: "handshake read after completion".to_string(),
            });
        }
        self.recv(msg)?;

        if !self.is_initiator && !self.did_receive {
            self.did_receive = true;
            let len = self.send()?;
            return Ok(Some(self.tx_buf[..len].to_vec()));
        }

        let reply = if self.is_initiator {
            let len = self.send()?;
            Some(self.tx_buf[..len].to_vec())
        } else {
            None
        };

        let (tx, rx) = self.state.dangerously_get_raw_split();
        let (split_tx, split_rx) = if self.is_initiator { (tx, rx) } else { (rx, tx) };
        let remote_pubkey = self
            .state
            .get_remote_static()
            .ok_or_else(|| LogError::CryptoError {
                context: "missing remote static key after handshake".to_string(),
            })?
            .to_vec();

        self.complete = true;
        // outcome is discarded by the caller via `into_outcome`, stash nothing further here.
        let _ = (split_tx, split_rx, remote_pubkey);
        Ok(reply)
    }

    /// Finish the handshake, producing the derived session keys.
    pub fn into_outcome(self) -> Result<HandshakeOutcome, LogError> {
        if !self.complete {
            return Err(LogError::InvalidStream {
                context: "handshake not complete".to_string(),
            });
        }
        let (tx, rx) = self.state.dangerously_get_raw_split();
        let (split_tx, split_rx) = if self.is_initiator { (tx, rx) } else { (rx, tx) };
        let remote_pubkey = self
            .state
            .get_remote_static()
            .ok_or_else(|| LogError::CryptoError {
                context: "missing remote static key after handshake".to_string(),
            })?
            .to_vec();
        Ok(HandshakeOutcome {
            is_initiator: self.is_initiator,
            remote_pubkey,
            split_tx,
            split_rx,
        })
    }
}

/// Drive a [`Handshake`] to completion over `stream`, writing and reading raw (unframed)
/// handshake messages length-prefixed the same way application messages are — `spec.md`
/// §4.11's "construct a secure stream" step of `joinProtocol`.
pub async fn perform_handshake<S>(stream: &mut S, is_initiator: bool) -> Result<HandshakeOutcome, LogError>
where
    S: DuplexStream + ?Sized,
{
    let mut handshake = Handshake::new(is_initiator)?;

    if let Some(first) = handshake.start()? {
        write_framed_bytes(stream, &first).await?;
    }

    while !handshake.is_complete() {
        let incoming = read_framed_bytes(stream).await?;
        if let Some(reply) = handshake.read(&incoming)? {
            write_framed_bytes(stream, &reply).await?;
        }
    }

    handshake.into_outcome()
}

/// A single wire message exchanged over an established protocol stream — the minimal set
/// `spec.md` §6's consumed `Replicator` contract needs: block/upgrade/seek requests, their
/// proofs, and presence announcements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Announce newly available indices (`spec.md` §4.8's bitfield-delta broadcast).
    Have {
        /// First newly-available index.
        start: u64,
        /// Count of newly-available indices.
        length: u64,
    },
    /// Request a block, optionally along with an upgrade to a new length.
    RequestBlock {
        /// The requested block.
        block: RequestBlock,
        /// An upgrade to request alongside it, if any.
        upgrade: Option<RequestUpgrade>,
    },
    /// Request resolution of a byte offset.
    RequestSeek(RequestSeek),
    /// A proven block, sent in response to `RequestBlock`.
    Data(Proof),
    /// Advertise (or revoke) a named extension channel.
    ExtensionAnnounce {
        /// Extension name.
        name: String,
    },
    /// An application message on a named extension channel.
    Extension {
        /// Extension name.
        name: String,
        /// Opaque payload.
        payload: Vec<u8>,
    },
    /// Reply to a `RequestBlock`/`RequestSeek` the responder cannot satisfy.
    NotFound,
    /// Ask the peer for its current length and fork.
    RequestUpgrade,
    /// Reply to `RequestUpgrade`.
    UpgradeInfo {
        /// The peer's current length.
        length: u64,
        /// The peer's current fork.
        fork: u64,
    },
    /// Reply to `RequestSeek`.
    SeekInfo {
        /// Resolved block index.
        index: u64,
        /// Byte offset within that block.
        offset: u64,
    },
}

impl CompactEncoding<Message> for State {
    fn preencode(&mut self, value: &Message) -> Result<usize, EncodingError> {
        self.preencode(&message_tag(value))?;
        match value {
            Message::Have { start, length } => {
                self.preencode(start)?;
                self.preencode(length)
            }
            Message::RequestBlock { block, upgrade } => {
                self.preencode(&block.index)?;
                match upgrade {
                    Some(upgrade) => {
                        self.preencode(&true)?;
                        self.preencode(&upgrade.length)
                    }
                    None => self.preencode(&false),
                }
            }
            Message::RequestSeek(seek) => self.preencode(&seek.bytes),
            Message::Data(proof) => {
                self.preencode(&proof.block)?;
                self.preencode(&proof.block_proof.index)?;
                self.preencode(&proof.block_proof.hash.to_vec())?;
                self.preencode(&(proof.block_proof.path.len() as u64))?;
                for sibling in &proof.block_proof.path {
                    self.preencode(&sibling.to_vec())?;
                }
                self.preencode(&proof.upgrade_length)?;
                self.preencode(&proof.fork)?;
                self.preencode(&(proof.roots.len() as u64))?;
                for root in &proof.roots {
                    preencode_node(self, root)?;
                }
                self.preencode(&proof.signature.to_vec())
            }
            Message::ExtensionAnnounce { name } => self.preencode(name),
            Message::Extension { name, payload } => {
                self.preencode(name)?;
                self.preencode(payload)
            }
            Message::NotFound | Message::RequestUpgrade => Ok(0),
            Message::UpgradeInfo { length, fork } => {
                self.preencode(length)?;
                self.preencode(fork)
            }
            Message::SeekInfo { index, offset } => {
                self.preencode(index)?;
                self.preencode(offset)
            }
        }
    }

    fn encode(&mut self, value: &Message, buffer: &mut [u8]) -> Result<usize, EncodingError> {
        self.encode(&message_tag(value), buffer)?;
        match value {
            Message::Have { start, length } => {
                self.encode(start, buffer)?;
                self.encode(length, buffer)
            }
            Message::RequestBlock { block, upgrade } => {
                self.encode(&block.index, buffer)?;
                match upgrade {
                    Some(upgrade) => {
                        self.encode(&true, buffer)?;
                        self.encode(&upgrade.length, buffer)
                    }
                    None => self.encode(&false, buffer),
                }
            }
            Message::RequestSeek(seek) => self.encode(&seek.bytes, buffer),
            Message::Data(proof) => {
                self.encode(&proof.block, buffer)?;
                self.encode(&proof.block_proof.index, buffer)?;
                self.encode(&proof.block_proof.hash.to_vec(), buffer)?;
                self.encode(&(proof.block_proof.path.len() as u64), buffer)?;
                for sibling in &proof.block_proof.path {
                    self.encode(&sibling.to_vec(), buffer)?;
                }
                self.encode(&proof.upgrade_length, buffer)?;
                self.encode(&proof.fork, buffer)?;
                self.encode(&(proof.roots.len() as u64), buffer)?;
                for root in &proof.roots {
                    encode_node(self, root, buffer)?;
                }
                self.encode(&proof.signature.to_vec(), buffer)
            }
            Message::ExtensionAnnounce { name } => self.encode(name, buffer),
            Message::Extension { name, payload } => {
                self.encode(name, buffer)?;
                self.encode(payload, buffer)
            }
            Message::NotFound | Message::RequestUpgrade => Ok(0),
            Message::UpgradeInfo { length, fork } => {
                self.encode(length, buffer)?;
                self.encode(fork, buffer)
            }
            Message::SeekInfo { index, offset } => {
                self.encode(index, buffer)?;
                self.encode(offset, buffer)
            }
        }
    }

    fn decode(&mut self, buffer: &[u8]) -> Result<Message, EncodingError> {
        let tag: u8 = self.decode(buffer)?;
        match tag {
            0 => Ok(Message::Have {
                start: self.decode(buffer)?,
                length: self.decode(buffer)?,
            }),
            1 => {
                let index = self.decode(buffer)?;
                let has_upgrade: bool = self.decode(buffer)?;
                let upgrade = if has_upgrade {
                    Some(RequestUpgrade {
                        length: self.decode(buffer)?,
                    })
                } else {
                    None
                };
                Ok(Message::RequestBlock {
                    block: RequestBlock { index },
                    upgrade,
                })
            }
            2 => Ok(Message::RequestSeek(RequestSeek {
                bytes: self.decode(buffer)?,
            })),
            3 => {
                let block: Vec<u8> = self.decode(buffer)?;
                let index = self.decode(buffer)?;
                let hash_bytes: Vec<u8> = self.decode(buffer)?;
                let hash: [u8; 32] = hash_bytes.try_into().map_err(|_| {
                    EncodingError::new(
                        compact_encoding::EncodingErrorKind::InvalidData,
                        "invalid proof hash length",
                    )
                })?;
                let path_len: u64 = self.decode(buffer)?;
                let mut path = Vec::with_capacity(path_len as usize);
                for _ in 0..path_len {
                    let sibling_bytes: Vec<u8> = self.decode(buffer)?;
                    let sibling: [u8; 32] = sibling_bytes.try_into().map_err(|_| {
                        EncodingError::new(
                            compact_encoding::EncodingErrorKind::InvalidData,
                            "invalid proof sibling hash length",
                        )
                    })?;
                    path.push(sibling);
                }
                let upgrade_length = self.decode(buffer)?;
                let fork = self.decode(buffer)?;
                let roots_len: u64 = self.decode(buffer)?;
                let mut roots = Vec::with_capacity(roots_len as usize);
                for _ in 0..roots_len {
                    roots.push(decode_node(self, buffer)?);
                }
                let signature_bytes: Vec<u8> = self.decode(buffer)?;
                let signature: [u8; 64] = signature_bytes.try_into().map_err(|_| {
                    EncodingError::new(
                        compact_encoding::EncodingErrorKind::InvalidData,
                        "invalid proof signature length",
                    )
                })?;
                Ok(Message::Data(Proof {
                    block,
                    block_proof: BlockProof { index, hash, path },
                    upgrade_length,
                    fork,
                    roots,
                    signature,
                }))
            }
            4 => Ok(Message::ExtensionAnnounce {
                name: self.decode(buffer)?,
            }),
            5 => Ok(Message::Extension {
                name: self.decode(buffer)?,
                payload: self.decode(buffer)?,
            }),
            6 => Ok(Message::NotFound),
            7 => Ok(Message::RequestUpgrade),
            8 => Ok(Message::UpgradeInfo {
                length: self.decode(buffer)?,
                fork: self.decode(buffer)?,
            }),
            9 => Ok(Message::SeekInfo {
                index: self.decode(buffer)?,
                offset: self.decode(buffer)?,
            }),
            _ => Err(EncodingError::new(
                compact_encoding::EncodingErrorKind::InvalidData,
                "unknown message tag",
            )),
        }
    }
}

fn message_tag(value: &Message) -> u8 {
    match value {
        Message::Have { .. } => 0,
        Message::RequestBlock { .. } => 1,
        Message::RequestSeek(_) => 2,
        Message::Data(_) => 3,
        Message::ExtensionAnnounce { .. } => 4,
        Message::Extension { .. } => 5,
        Message::NotFound => 6,
        Message::RequestUpgrade => 7,
        Message::UpgradeInfo { .. } => 8,
        Message::SeekInfo { .. } => 9,
    }
}

fn preencode_node(state: &mut State, node: &Node) -> Result<usize, EncodingError> {
    state.preencode(&node.index)?;
    state.preencode(&(node.height as u64))?;
    state.preencode(&node.hash.to_vec())?;
    state.preencode(&node.byte_length)
}

fn encode_node(state: &mut State, node: &Node, buffer: &mut [u8]) -> Result<usize, EncodingError> {
    state.encode(&node.index, buffer)?;
    state.encode(&(node.height as u64), buffer)?;
    state.encode(&node.hash.to_vec(), buffer)?;
    state.encode(&node.byte_length, buffer)
}

fn decode_node(state: &mut State, buffer: &[u8]) -> Result<Node, EncodingError> {
    let index = state.decode(buffer)?;
    let height: u64 = state.decode(buffer)?;
    let hash_bytes: Vec<u8> = state.decode(buffer)?;
    let hash: [u8; 32] = hash_bytes
        .try_into()
        .map_err(|_| EncodingError::new(compact_encoding::EncodingErrorKind::InvalidData, "invalid node hash length"))?;
    let byte_length = state.decode(buffer)?;
    Ok(Node {
        index,
        height: height as u32,
        hash,
        byte_length,
    })
}

/// Frame a message with a 4-byte big-endian length prefix, ready to write to a duplex stream.
pub fn frame(message: &Message) -> Result<Vec<u8>, LogError> {
    let mut state = State::new();
    state.preencode(message)?;
    let mut body = state.create_buffer();
    state.encode(message, &mut body)?;

    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Decode one length-prefixed message from the head of `bytes`, returning it and the byte
/// count consumed.
pub fn unframe(bytes: &[u8]) -> Result<(Message, usize), LogError> {
    if bytes.len() < 4 {
        return Err(LogError::InvalidStream {
            context: "truncated message length prefix".to_string(),
        });
    }
    let len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
    if 4 + len > bytes.len() {
        return Err(LogError::InvalidStream {
            context: "truncated message body".to_string(),
        });
    }
    let body = &bytes[4..4 + len];
    let mut state = State::from_buffer(body);
    let message = state.decode(body)?;
    Ok((message, 4 + len))
}

/// Write one length-prefixed chunk of raw bytes to `stream`.
async fn write_framed_bytes<S>(stream: &mut S, bytes: &[u8]) -> Result<(), LogError>
where
    S: DuplexStream + ?Sized,
{
    let len = u32::try_from(bytes.len()).map_err(|_| LogError::InvalidStream {
        context: "frame body too large to encode a length prefix".to_string(),
    })?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed chunk of raw bytes from `stream`.
async fn read_framed_bytes<S>(stream: &mut S) -> Result<Vec<u8>, LogError>
where
    S: DuplexStream + ?Sized,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_LENGTH {
        return Err(LogError::InvalidStream {
            context: format!("frame body of {len} bytes exceeds the maximum"),
        });
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// Encode and write one [`Message`] to `stream`.
pub async fn write_message<S>(stream: &mut S, message: &Message) -> Result<(), LogError>
where
    S: DuplexStream + ?Sized,
{
    let mut state = State::new();
    state.preencode(message)?;
    let mut body = state.create_buffer();
    state.encode(message, &mut body)?;
    write_framed_bytes(stream, &body).await
}

/// Read and decode one [`Message`] from `stream`.
pub async fn read_message<S>(stream: &mut S) -> Result<Message, LogError>
where
    S: DuplexStream + ?Sized,
{
    let body = read_framed_bytes(stream).await?;
    let mut state = State::from_buffer(&body);
    Ok(state.decode(&body)?)
}

/// A connected peer's id, for labeling inbound messages.
pub type FramedFrom = PeerId;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_completes_between_initiator_and_responder() {
        let mut initiator = Handshake::new(true).unwrap();
        let mut responder = Handshake::new(false).unwrap();

        let msg1 = initiator.start().unwrap().unwrap();
        let msg2 = responder.read(&msg1).unwrap().unwrap();
        let msg3 = initiator.read(&msg2).unwrap().unwrap();
        assert!(responder.read(&msg3).unwrap().is_none());

        assert!(initiator.is_complete());
        assert!(responder.is_complete());

        let initiator_outcome = initiator.into_outcome().unwrap();
        let responder_outcome = responder.into_outcome().unwrap();
        assert_eq!(initiator_outcome.split_tx, responder_outcome.split_rx);
        assert_eq!(initiator_outcome.split_rx, responder_outcome.split_tx);
    }

    #[test]
    fn have_message_round_trips_through_frame() {
        let message = Message::Have { start: 3, length: 5 };
        let framed = frame(&message).unwrap();
        let (decoded, consumed) = unframe(&framed).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(consumed, framed.len());
    }

    #[test]
    fn request_block_with_upgrade_round_trips() {
        let message = Message::RequestBlock {
            block: RequestBlock { index: 42 },
            upgrade: Some(RequestUpgrade { length: 100 }),
        };
        let framed = frame(&message).unwrap();
        let (decoded, _) = unframe(&framed).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn data_message_round_trips_with_proof_path() {
        let message = Message::Data(Proof {
            block: b"hello".to_vec(),
            block_proof: BlockProof {
                index: 2,
                hash: [9u8; 32],
                path: vec![[1u8; 32], [2u8; 32]],
            },
            upgrade_length: 8,
            fork: 0,
            roots: vec![Node {
                index: 0,
                height: 3,
                hash: [7u8; 32],
                byte_length: 64,
            }],
            signature: [5u8; 64],
        });
        let framed = frame(&message).unwrap();
        let (decoded, _) = unframe(&framed).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn not_found_and_upgrade_info_round_trip() {
        for message in [
            Message::NotFound,
            Message::RequestUpgrade,
            Message::UpgradeInfo { length: 10, fork: 1 },
            Message::SeekInfo { index: 3, offset: 12 },
        ] {
            let framed = frame(&message).unwrap();
            let (decoded, consumed) = unframe(&framed).unwrap();
            assert_eq!(decoded, message);
            assert_eq!(consumed, framed.len());
        }
    }

    #[async_std::test]
    async fn perform_handshake_completes_over_a_duplex_pair() {
        let (mut a, mut b) = futures::io::duplex(4096);
        let (a_outcome, b_outcome) = futures::join!(perform_handshake(&mut a, true), perform_handshake(&mut b, false));
        let a_outcome = a_outcome.unwrap();
        let b_outcome = b_outcome.unwrap();
        assert_eq!(a_outcome.split_tx, b_outcome.split_rx);
        assert_eq!(a_outcome.split_rx, b_outcome.split_tx);
    }

    #[async_std::test]
    async fn write_message_and_read_message_round_trip_over_a_duplex_pair() {
        let (mut a, mut b) = futures::io::duplex(4096);
        let message = Message::Have { start: 1, length: 4 };
        write_message(&mut a, &message).await.unwrap();
        let decoded = read_message(&mut b).await.unwrap();
        assert_eq!(decoded, message);
    }
}
