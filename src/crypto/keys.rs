//! Key pair handling, mirroring the teacher's `storage_v10::PartialKeypair`.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;

/// Key pair where, for read-only logs, the secret key is absent.
#[derive(Debug)]
pub struct PartialKeypair {
    /// Public key identifying the log.
    pub public: VerifyingKey,
    /// Secret key. `None` means the log (or this session) is read-only.
    pub secret: Option<SigningKey>,
}

impl Clone for PartialKeypair {
    fn clone(&self) -> Self {
        PartialKeypair {
            public: self.public,
            secret: self.secret.as_ref().map(|s| SigningKey::from_bytes(&s.to_bytes())),
        }
    }
}

impl PartialKeypair {
    /// A keypair with only a public key, suitable for a read-only log.
    pub fn public_only(public: VerifyingKey) -> Self {
        Self {
            public,
            secret: None,
        }
    }
}

/// Generate a new ed25519 key pair suitable for a writable log.
pub fn generate_keypair() -> PartialKeypair {
    let signing_key = SigningKey::generate(&mut OsRng);
    PartialKeypair {
        public: signing_key.verifying_key(),
        secret: Some(signing_key),
    }
}
