//! Error taxonomy for the log façade and its storage/crypto collaborators.

use compact_encoding::EncodingError;
use thiserror::Error;

use crate::Store;

/// Errors returned by public operations on a [`crate::Log`] or [`crate::Session`].
#[derive(Error, Debug)]
pub enum LogError {
    /// A constructor or builder argument was malformed.
    #[error("Bad argument. {context}")]
    BadArgument {
        /// Extra context for the bad argument.
        context: String,
    },
    /// A public key of the wrong size was supplied and no custom crypto capability overrides it.
    #[error("Key must be exactly 32 bytes, got {len}")]
    InvalidKey {
        /// The length that was actually supplied.
        len: usize,
    },
    /// `replicate()` was given neither a usable outer stream nor enough information to build one.
    #[error("Stream is not usable for replication. {context}")]
    InvalidStream {
        /// Extra context.
        context: String,
    },
    /// `append`/`truncate` was called on a session with no signer configured.
    #[error("log is not writable: no signer is configured")]
    NotWritable,
    /// `session()` was called while the log is in the process of closing.
    #[error("session requested on a log that is closing")]
    SessionClosing,
    /// A signature failed to verify.
    #[error("given signature was invalid. {context}")]
    InvalidSignature {
        /// Extra context.
        context: String,
    },
    /// A stored checksum did not match recomputed data.
    #[error("invalid checksum. {context}")]
    InvalidChecksum {
        /// Extra context.
        context: String,
    },
    /// A store was expected to hold data but was empty.
    #[error("empty storage: {store:?}")]
    EmptyStorage {
        /// The store that was found empty.
        store: Store,
    },
    /// A store held data that could not be parsed.
    #[error("corrupt storage: {store:?}.{}", .context.as_ref().map_or_else(String::new, |c| format!(" {c}")))]
    CorruptStorage {
        /// The store that was corrupt.
        store: Store,
        /// Extra context.
        context: Option<String>,
    },
    /// A request made of the replicator did not complete (e.g. its range was destroyed).
    #[error("peer request failed. {context}")]
    PeerRequestFailed {
        /// Extra context.
        context: String,
    },
    /// A cryptographic operation (encryption, decryption, derivation) failed.
    #[error("cryptographic operation failed. {context}")]
    CryptoError {
        /// Extra context.
        context: String,
    },
    /// An unrecoverable I/O error propagated from storage.
    #[error("unrecoverable input/output error occurred.{}", .context.as_ref().map_or_else(String::new, |c| format!(" {c}")))]
    Io {
        /// Extra context.
        context: Option<String>,
        /// The original I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl From<std::io::Error> for LogError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            context: None,
            source: err,
        }
    }
}

impl From<EncodingError> for LogError {
    fn from(err: EncodingError) -> Self {
        Self::CorruptStorage {
            store: Store::Oplog,
            context: Some(format!("encoding failed: {err}")),
        }
    }
}
