//! Persisted log header: key material, user-data and tree state, written to the storage
//! factory's `Store::Oplog` file.
//!
//! Grounded in the teacher's `oplog::header::{Header, HeaderTree}` (`compact-encoding` based
//! header layout: public key, key pair, user-data vector, tree fork/length/root/signature). Per
//! `SPEC_FULL.md` §E this keeps a single header slot instead of the teacher's dual-slot,
//! CRC-checksummed rotation (which exists there to survive a torn write mid-rewrite); a single
//! `crc32fast` checksum over the encoded header is kept so a torn write is at least detected.

use compact_encoding::{CompactEncoding, EncodingError, State};

use crate::crypto::PartialKeypair;
use crate::error::LogError;
use crate::tree::MerkleTree;
use ed25519_dalek::{SigningKey, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH};

/// The tree-state slice of the header: enough to reconstruct a [`MerkleTree`]'s root without
/// replaying every leaf.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeaderTree {
    /// Current fork.
    pub fork: u64,
    /// Current length.
    pub length: u64,
    /// Hash of the current Merkle roots (`hash_roots`), empty when the log is empty.
    pub root_hash: Vec<u8>,
    /// Signature over `(root_hash, length, fork)`, empty when the log is empty or read-only.
    pub signature: Vec<u8>,
}

/// A key-value pair in the header's user-data vector (`spec.md` §4.13).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDataEntry {
    /// Entry key.
    pub key: String,
    /// Entry value.
    pub value: Vec<u8>,
}

/// The full persisted oplog header.
#[derive(Debug, Clone)]
pub struct Header {
    /// The log's public key.
    pub key: [u8; 32],
    /// This log's key pair (secret absent for a read-only log).
    pub key_pair: PartialKeypair,
    /// Arbitrary application key-value pairs, set via `setUserData`/`getUserData`.
    pub user_data: Vec<UserDataEntry>,
    /// Tree state needed to reopen without replaying every block.
    pub tree: HeaderTree,
}

impl Header {
    /// A fresh header for a newly created log.
    pub fn new(key_pair: PartialKeypair) -> Self {
        let key = key_pair.public.to_bytes();
        Self {
            key,
            key_pair,
            user_data: Vec::new(),
            tree: HeaderTree::default(),
        }
    }

    /// Refresh the tree-state slice from a live [`MerkleTree`], ahead of a flush.
    pub fn sync_tree(&mut self, tree: &MerkleTree, root_hash: Vec<u8>, signature: Vec<u8>) {
        self.tree = HeaderTree {
            fork: tree.fork,
            length: tree.length(),
            root_hash,
            signature,
        };
    }

    /// Look up a user-data entry by key.
    pub fn get_user_data(&self, key: &str) -> Option<&[u8]> {
        self.user_data
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.value.as_slice())
    }

    /// Insert or replace a user-data entry. `value: None` removes the entry.
    pub fn set_user_data(&mut self, key: String, value: Option<Vec<u8>>) {
        self.user_data.retain(|entry| entry.key != key);
        if let Some(value) = value {
            self.user_data.push(UserDataEntry { key, value });
        }
    }

    /// Encode the header with a leading CRC32 over its body, so a torn write is detectable on
    /// reopen.
    pub fn encode(&self) -> Result<Vec<u8>, LogError> {
        let mut state = State::new();
        state.preencode(self)?;
        let mut body = state.create_buffer();
        state.encode(self, &mut body)?;

        let checksum = crc32fast::hash(&body);
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&checksum.to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a header previously written by [`Header::encode`], rejecting a checksum mismatch.
    pub fn decode(bytes: &[u8]) -> Result<Self, LogError> {
        if bytes.len() < 4 {
            return Err(LogError::CorruptStorage {
                store: crate::storage::Store::Oplog,
                context: Some("oplog header shorter than its checksum prefix".to_string()),
            });
        }
        let (checksum_bytes, body) = bytes.split_at(4);
        let expected = u32::from_be_bytes(checksum_bytes.try_into().unwrap());
        if crc32fast::hash(body) != expected {
            return Err(LogError::InvalidChecksum {
                context: "oplog header checksum mismatch".to_string(),
            });
        }
        let mut state = State::from_buffer(body);
        let header: Header = state.decode(body)?;
        Ok(header)
    }
}

impl CompactEncoding<Header> for State {
    fn preencode(&mut self, value: &Header) -> Result<usize, EncodingError> {
        self.preencode_fixed_32()?;
        self.preencode(&value.key_pair)?;
        self.preencode(&value.user_data)?;
        self.preencode(&value.tree)
    }

    fn encode(&mut self, value: &Header, buffer: &mut [u8]) -> Result<usize, EncodingError> {
        self.encode_fixed_32(&value.key, buffer)?;
        self.encode(&value.key_pair, buffer)?;
        self.encode(&value.user_data, buffer)?;
        self.encode(&value.tree, buffer)
    }

    fn decode(&mut self, buffer: &[u8]) -> Result<Header, EncodingError> {
        let key: Box<[u8]> = self.decode_fixed_32(buffer)?;
        let key_pair: PartialKeypair = self.decode(buffer)?;
        let user_data: Vec<UserDataEntry> = self.decode(buffer)?;
        let tree: HeaderTree = self.decode(buffer)?;
        Ok(Header {
            key: key.as_ref().try_into().expect("fixed 32 byte decode"),
            key_pair,
            user_data,
            tree,
        })
    }
}

impl CompactEncoding<HeaderTree> for State {
    fn preencode(&mut self, value: &HeaderTree) -> Result<usize, EncodingError> {
        self.preencode(&value.fork)?;
        self.preencode(&value.length)?;
        self.preencode(&value.root_hash)?;
        self.preencode(&value.signature)
    }

    fn encode(&mut self, value: &HeaderTree, buffer: &mut [u8]) -> Result<usize, EncodingError> {
        self.encode(&value.fork, buffer)?;
        self.encode(&value.length, buffer)?;
        self.encode(&value.root_hash, buffer)?;
        self.encode(&value.signature, buffer)
    }

    fn decode(&mut self, buffer: &[u8]) -> Result<HeaderTree, EncodingError> {
        Ok(HeaderTree {
            fork: self.decode(buffer)?,
            length: self.decode(buffer)?,
            root_hash: self.decode(buffer)?,
            signature: self.decode(buffer)?,
        })
    }
}

impl CompactEncoding<UserDataEntry> for State {
    fn preencode(&mut self, value: &UserDataEntry) -> Result<usize, EncodingError> {
        self.preencode(&value.key)?;
        self.preencode(&value.value)
    }

    fn encode(&mut self, value: &UserDataEntry, buffer: &mut [u8]) -> Result<usize, EncodingError> {
        self.encode(&value.key, buffer)?;
        self.encode(&value.value, buffer)
    }

    fn decode(&mut self, buffer: &[u8]) -> Result<UserDataEntry, EncodingError> {
        Ok(UserDataEntry {
            key: self.decode(buffer)?,
            value: self.decode(buffer)?,
        })
    }
}

/// Stored the way the teacher's oplog header stores a partial key pair: the public key as one
/// length-prefixed byte string, the secret key (with the public key appended, so decode doesn't
/// need a second source of truth) as another, empty when the log is read-only.
impl CompactEncoding<PartialKeypair> for State {
    fn preencode(&mut self, value: &PartialKeypair) -> Result<usize, EncodingError> {
        let public_key_bytes: Box<[u8]> = value.public.to_bytes().to_vec().into_boxed_slice();
        self.preencode(&public_key_bytes)?;
        match &value.secret {
            Some(_) => self.add_end(1 + SECRET_KEY_LENGTH + PUBLIC_KEY_LENGTH),
            None => self.add_end(1),
        }
    }

    fn encode(&mut self, value: &PartialKeypair, buffer: &mut [u8]) -> Result<usize, EncodingError> {
        let public_key_bytes: Box<[u8]> = value.public.to_bytes().to_vec().into_boxed_slice();
        self.encode(&public_key_bytes, buffer)?;
        match &value.secret {
            Some(secret) => {
                let mut secret_key_bytes = Vec::with_capacity(SECRET_KEY_LENGTH + PUBLIC_KEY_LENGTH);
                secret_key_bytes.extend_from_slice(&secret.to_bytes());
                secret_key_bytes.extend_from_slice(&public_key_bytes);
                let secret_key_bytes: Box<[u8]> = secret_key_bytes.into_boxed_slice();
                self.encode(&secret_key_bytes, buffer)
            }
            None => self.set_byte_to_buffer(0, buffer),
        }
    }

    fn decode(&mut self, buffer: &[u8]) -> Result<PartialKeypair, EncodingError> {
        let public_key_bytes: Box<[u8]> = self.decode(buffer)?;
        let public_key_bytes: [u8; PUBLIC_KEY_LENGTH] = public_key_bytes[0..PUBLIC_KEY_LENGTH]
            .try_into()
            .map_err(|_| {
                EncodingError::new(
                    compact_encoding::EncodingErrorKind::InvalidData,
                    "invalid public key length in oplog header",
                )
            })?;
        let public = VerifyingKey::from_bytes(&public_key_bytes).map_err(|_| {
            EncodingError::new(
                compact_encoding::EncodingErrorKind::InvalidData,
                "invalid ed25519 public key in oplog header",
            )
        })?;

        let secret_key_bytes: Box<[u8]> = self.decode(buffer)?;
        let secret = if secret_key_bytes.is_empty() {
            None
        } else {
            let secret_key_bytes: [u8; SECRET_KEY_LENGTH] = secret_key_bytes[0..SECRET_KEY_LENGTH]
                .try_into()
                .map_err(|_| {
                    EncodingError::new(
                        compact_encoding::EncodingErrorKind::InvalidData,
                        "truncated secret key in oplog header",
                    )
                })?;
            Some(SigningKey::from_bytes(&secret_key_bytes))
        };

        Ok(PartialKeypair { public, secret })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    #[test]
    fn header_round_trips_through_encode_decode() {
        let key_pair = generate_keypair();
        let mut header = Header::new(key_pair);
        header.set_user_data("hello".to_string(), Some(b"world".to_vec()));

        let bytes = header.encode().unwrap();
        let decoded = Header::decode(&bytes).unwrap();

        assert_eq!(decoded.key, header.key);
        assert_eq!(decoded.get_user_data("hello"), Some(b"world".as_slice()));
        assert!(decoded.key_pair.secret.is_some());
    }

    #[test]
    fn corrupt_checksum_is_rejected() {
        let key_pair = generate_keypair();
        let header = Header::new(key_pair);
        let mut bytes = header.encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(Header::decode(&bytes).is_err());
    }

    #[test]
    fn read_only_key_pair_round_trips_without_secret() {
        let key_pair = generate_keypair();
        let public_only = PartialKeypair::public_only(key_pair.public);
        let header = Header::new(public_only);

        let bytes = header.encode().unwrap();
        let decoded = Header::decode(&bytes).unwrap();
        assert!(decoded.key_pair.secret.is_none());
    }
}
