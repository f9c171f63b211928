#![cfg_attr(nightly, deny(missing_docs))]
#![cfg_attr(nightly, feature(external_doc))]
#![cfg_attr(nightly, doc(include = "../README.md"))]

//! A secure, append-only, cryptographically-verifiable log that can be replicated
//! peer-to-peer with partial-trust participants. Each log is identified by a public key; only
//! the holder of the matching secret key may extend it, while any peer may verify, read and
//! relay blocks.
//!
//! The public entry point is [`builder::LogBuilder`], which opens a [`session::Log`] — the
//! façade that multiplexes sessions over one shared [`core::Core`] and [`replication::Replicator`].

pub mod builder;
pub mod cache;
pub mod core;
pub mod crypto;
pub mod encoding;
pub mod encryption;
mod error;
pub mod event;
pub mod extensions;
pub mod replication;
pub mod session;
pub mod storage;
pub mod tree;

mod bitfield;
mod oplog;

pub use builder::LogBuilder;
pub use core::{AppendOutcome, Core, Info};
pub use crypto::PartialKeypair;
pub use error::LogError;
pub use event::Event;
pub use session::{GetOptions, Log, Snapshot};
pub use storage::{Storage, Store};

/// A specialized `Result` type for this crate's fallible operations.
pub type Result<T> = std::result::Result<T, LogError>;
