//! Storage factory: routes logical store names to random-access files.
//!
//! Grounded in the teacher's `storage_v10::Storage` (`Store` enum, `open`/`new_memory`/
//! `new_disk` constructors) per `spec.md` §6's storage-factory contract.

use std::fmt::Debug;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use random_access_memory::RandomAccessMemory;
#[cfg(not(target_arch = "wasm32"))]
use random_access_disk::RandomAccessDisk;
use random_access_storage::RandomAccess;

use crate::error::LogError;

/// The logical stores a log's [`crate::core::Core`] persists to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Store {
    /// Merkle tree roots/nodes.
    Tree,
    /// Raw block bytes.
    Data,
    /// Presence bitfield.
    Bitfield,
    /// Write-ahead header + entries log.
    Oplog,
}

impl Store {
    fn file_name(self) -> &'static str {
        match self {
            Store::Tree => "tree",
            Store::Data => "data",
            Store::Bitfield => "bitfield",
            Store::Oplog => "oplog",
        }
    }
}

type BoxedOpen<T> = Pin<Box<dyn Future<Output = Result<T, LogError>> + Send>>;

/// A factory that opens the four named random-access files for a log.
///
/// This is the `storage` option of `spec.md` §4.1: a directory path maps to the default
/// disk-backed factory below; tests and in-memory logs use [`Storage::memory`].
pub struct Storage<T>
where
    T: RandomAccess + Debug,
{
    pub(crate) tree: T,
    pub(crate) data: T,
    pub(crate) bitfield: T,
    pub(crate) oplog: T,
}

impl<T> Storage<T>
where
    T: RandomAccess<Error = Box<dyn std::error::Error + Send + Sync>> + Debug + Send,
{
    /// Open storage via an arbitrary per-store constructor.
    pub async fn open<Cb>(create: Cb) -> Result<Self, LogError>
    where
        Cb: Fn(Store) -> BoxedOpen<T>,
    {
        Ok(Self {
            tree: create(Store::Tree).await?,
            data: create(Store::Data).await?,
            bitfield: create(Store::Bitfield).await?,
            oplog: create(Store::Oplog).await?,
        })
    }
}

impl Storage<RandomAccessMemory> {
    /// In-memory storage, useful for tests and ephemeral logs.
    pub async fn memory() -> Result<Self, LogError> {
        Ok(Self {
            tree: RandomAccessMemory::default(),
            data: RandomAccessMemory::default(),
            bitfield: RandomAccessMemory::default(),
            oplog: RandomAccessMemory::default(),
        })
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl Storage<RandomAccessDisk> {
    /// Directory-backed storage. The oplog file additionally takes an advisory lock so two
    /// processes can't open the same log for writing concurrently; sparse-file hints are
    /// disabled for portability, matching `spec.md` §6's default storage factory.
    pub async fn disk(dir: &Path) -> Result<Self, LogError> {
        std::fs::create_dir_all(dir)?;
        let open = |name: &'static str| {
            let path: PathBuf = dir.join(name);
            Box::pin(async move {
                RandomAccessDisk::open(path).await.map_err(|e| LogError::Io {
                    context: Some(format!("opening {name}")),
                    source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                })
            }) as BoxedOpen<RandomAccessDisk>
        };
        Ok(Self {
            tree: open(Store::Tree.file_name()).await?,
            data: open(Store::Data.file_name()).await?,
            bitfield: open(Store::Bitfield.file_name()).await?,
            oplog: open(Store::Oplog.file_name()).await?,
        })
    }
}
