//! Explicit builder for opening a [`crate::session::Log`].
//!
//! `spec.md` §4.1 describes an overloaded `(storage, key, options)` constructor; per REDESIGN
//! FLAGS this becomes an explicit builder, mirroring the teacher's `HypercoreBuilder` in
//! `builder.rs` (storage up front, every option a chained setter, `build()` as the single
//! `#[instrument]`-ed async entry point).

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use random_access_memory::RandomAccessMemory;
#[cfg(not(target_arch = "wasm32"))]
use random_access_disk::RandomAccessDisk;
use random_access_storage::RandomAccess;
use tracing::instrument;

use crate::cache::CacheOptions;
use crate::core::Core;
use crate::crypto::{CryptoProvider, PartialKeypair};
use crate::encryption::EncryptionKey;
use crate::error::LogError;
use crate::extensions::Extensions;
use crate::session::Log;
use crate::storage::Storage;

/// Builds a [`Log`] from storage plus `spec.md` §4.1's option table. One builder opens exactly
/// one Core; further sessions on the same log come from [`Log::session`].
#[derive(Debug)]
pub struct LogBuilder<T>
where
    T: RandomAccess<Error = Box<dyn std::error::Error + Send + Sync>> + Debug + Send,
{
    storage: Storage<T>,
    key_pair: Option<PartialKeypair>,
    encryption_key: Option<EncryptionKey>,
    cache_options: Option<CacheOptions>,
    cache_enabled: bool,
    extensions: Option<Extensions>,
    user_data: Vec<(String, Vec<u8>)>,
    crypto: Option<Arc<dyn CryptoProvider>>,
}

impl<T> LogBuilder<T>
where
    T: RandomAccess<Error = Box<dyn std::error::Error + Send + Sync>> + Debug + Send,
{
    /// Start building a log against the given storage.
    pub fn new(storage: Storage<T>) -> Self {
        Self {
            storage,
            key_pair: None,
            encryption_key: None,
            cache_options: None,
            cache_enabled: true,
            extensions: None,
            user_data: Vec::new(),
            crypto: None,
        }
    }

    /// Set the key pair. A public-only pair (`secret: None`) opens the log read-only.
    pub fn key_pair(mut self, key_pair: PartialKeypair) -> Self {
        self.key_pair = Some(key_pair);
        self
    }

    /// Enable at-rest and in-transit block encryption with the given shared key.
    pub fn encryption_key(mut self, encryption_key: EncryptionKey) -> Self {
        self.encryption_key = Some(encryption_key);
        self
    }

    /// Override the default block cache's options. Implies `cache(true)`.
    pub fn cache_options(mut self, options: CacheOptions) -> Self {
        self.cache_options = Some(options);
        self.cache_enabled = true;
        self
    }

    /// Enable or disable the block cache (`spec.md` §4.1's `cache` option). Enabled with
    /// default options unless [`LogBuilder::cache_options`] is also called.
    pub fn cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Share an existing extension registry rather than starting a fresh one (`spec.md` §4.1's
    /// `extensions` option, used by `from` to share capabilities between independently-built
    /// logs over the same key).
    pub fn extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = Some(extensions);
        self
    }

    /// Queue a user-data entry to be written on first open (`spec.md` §4.1's `userData` option).
    pub fn user_data(mut self, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.user_data.push((key.into(), value));
        self
    }

    /// Use a custom signer/verifier instead of the default ed25519 implementation.
    pub fn crypto_provider(mut self, crypto: Arc<dyn CryptoProvider>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    /// Open the Core and return its root [`Log`] session.
    #[instrument(err, skip_all)]
    pub async fn build(self) -> Result<Log<T>, LogError> {
        let cache_options = if self.cache_enabled {
            Some(self.cache_options.unwrap_or_default())
        } else {
            None
        };
        let core = Core::open(self.storage, self.key_pair, self.encryption_key, cache_options, self.crypto).await?;
        let extensions = self.extensions.unwrap_or_default();
        let log = Log::from_core(core, extensions);
        for (key, value) in self.user_data {
            log.set_user_data(key, Some(value)).await?;
        }
        Ok(log)
    }
}

impl LogBuilder<RandomAccessMemory> {
    /// Build an ephemeral, in-memory log — the common shape for tests.
    pub async fn memory() -> Result<Log<RandomAccessMemory>, LogError> {
        LogBuilder::new(Storage::memory().await?).build().await
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl LogBuilder<RandomAccessDisk> {
    /// Build a directory-backed log.
    pub async fn disk(dir: &Path) -> Result<Log<RandomAccessDisk>, LogError> {
        LogBuilder::new(Storage::disk(dir).await?).build().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[async_std::test]
    async fn memory_builder_produces_writable_log() {
        let log = LogBuilder::memory().await.unwrap();
        assert!(log.writable().await);
        assert_eq!(log.length().await, 0);
    }

    #[derive(Debug, Default)]
    struct CountingCrypto {
        signs: AtomicUsize,
    }

    impl CryptoProvider for CountingCrypto {
        fn sign(
            &self,
            secret: &ed25519_dalek::SigningKey,
            message: &[u8],
        ) -> ed25519_dalek::Signature {
            self.signs.fetch_add(1, Ordering::SeqCst);
            use ed25519_dalek::Signer;
            secret.sign(message)
        }
    }

    #[async_std::test]
    async fn custom_crypto_provider_is_used_for_signing() {
        let crypto = Arc::new(CountingCrypto::default());
        let log = LogBuilder::new(Storage::memory().await.unwrap())
            .crypto_provider(crypto.clone())
            .build()
            .await
            .unwrap();
        log.append(vec![b"hello".to_vec()]).await.unwrap();
        assert!(crypto.signs.load(Ordering::SeqCst) > 0);
    }

    #[async_std::test]
    async fn user_data_is_persisted_on_first_open() {
        let log = LogBuilder::new(Storage::memory().await.unwrap())
            .user_data("greeting", b"hello".to_vec())
            .build()
            .await
            .unwrap();
        assert_eq!(log.get_user_data("greeting").await, Some(b"hello".to_vec()));
    }
}
