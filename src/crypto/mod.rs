//! Cryptographic capabilities: hashing, signing and discovery-key derivation.
//!
//! Grounded in `crypto/hash.rs` and `crypto/merkle.rs` of the teacher repo, updated to the
//! RustCrypto `blake2` crate (the teacher's own `blake2-rfc` dependency carries a TODO asking
//! for exactly this swap once public-key hashing support landed upstream).

mod hash;
mod keys;

pub use hash::{discovery_key, hash_leaf, hash_parent, hash_roots};
pub use keys::{generate_keypair, PartialKeypair};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::LogError;

/// Capability bundle used to hash, sign and verify a log. Implementors other than
/// [`DefaultCrypto`] let callers plug in alternate primitives (see `spec.md` §4.1 `crypto` option).
pub trait CryptoProvider: std::fmt::Debug + Send + Sync {
    /// Hash a leaf block's bytes.
    fn hash_leaf(&self, data: &[u8]) -> [u8; 32] {
        hash_leaf(data)
    }

    /// Combine two child hashes into a parent hash.
    fn hash_parent(&self, left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
        hash_parent(left, right)
    }

    /// Derive the discovery key for a public key.
    fn discovery_key(&self, public_key: &[u8; 32]) -> [u8; 32] {
        discovery_key(public_key)
    }

    /// Sign a message with the given secret key.
    fn sign(&self, secret: &SigningKey, message: &[u8]) -> Signature {
        secret.sign(message)
    }

    /// Verify a message's signature against a public key.
    fn verify(
        &self,
        public: &VerifyingKey,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), LogError> {
        public
            .verify(message, signature)
            .map_err(|e| LogError::InvalidSignature {
                context: e.to_string(),
            })
    }
}

/// The default crypto capability: BLAKE2b hashing, ed25519 signing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCrypto;

impl CryptoProvider for DefaultCrypto {}
