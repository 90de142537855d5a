//! Process-wide key-encryption-key cache.
//!
//! The KEK is 32 random bytes wrapped by the configured KMS and persisted as
//! `(wrapped, iv)` in settings. [`KekCache`] loads it once per process:
//! `tokio::sync::OnceCell::get_or_try_init` lets exactly one task run the
//! initializer while concurrent callers wait for its result. Across processes
//! the wrapped KEK is written with a create-only insert, so a second process
//! that loses the race unwraps the winner's KEK instead of its own.
//!
//! A cache built [`with_seal_gate`](KekCache::with_seal_gate) refuses to hand
//! out the KEK while the vault is sealed, even if it was loaded earlier.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::info;
use zeroize::Zeroize;

use crate::crypto::{self, EncryptionKey};
use crate::error::KmsError;
use crate::kms::KmsProvider;
use crate::store::SettingsStore;
use crate::unseal::SealState;

/// Settings key of the wrapped KEK.
pub const WRAPPED_KEK_SETTING: &str = "vault-kek-wrapped";

/// KMS key name the KEK is wrapped under.
pub const KEK_KEY_NAME: &str = "vault-kek";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WrappedKekRecord {
    wrapped: String,
    iv: String,
    key_name: String,
    key_version: u32,
    algorithm: String,
}

/// Lazily initialized, shared KEK.
pub struct KekCache {
    kms: Arc<dyn KmsProvider>,
    settings: SettingsStore,
    cell: OnceCell<EncryptionKey>,
    seal: Option<Arc<SealState>>,
}

impl KekCache {
    /// Create an empty cache. Nothing is loaded until [`get`](Self::get).
    #[must_use]
    pub fn new(kms: Arc<dyn KmsProvider>, settings: SettingsStore) -> Self {
        Self {
            kms,
            settings,
            cell: OnceCell::new(),
            seal: None,
        }
    }

    /// Refuse [`get`](Self::get) whenever `seal` is sealed.
    #[must_use]
    pub fn with_seal_gate(mut self, seal: Arc<SealState>) -> Self {
        self.seal = Some(seal);
        self
    }

    /// Return the KEK, loading or creating it on first call.
    ///
    /// # Errors
    ///
    /// - [`KmsError::Sealed`] if the cache is gated and the vault is sealed.
    /// - Any other [`KmsError`] if the KMS cannot wrap/unwrap or settings
    ///   fail. A failed initialization leaves the cache empty so a later
    ///   call retries.
    pub async fn get(&self) -> Result<&EncryptionKey, KmsError> {
        if let Some(seal) = &self.seal {
            if !seal.is_unsealed().await {
                return Err(KmsError::Sealed);
            }
        }
        self.cell.get_or_try_init(|| self.load_or_create()).await
    }

    /// Whether the KEK has been loaded in this process.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    async fn load_or_create(&self) -> Result<EncryptionKey, KmsError> {
        if let Some(record) = self.settings.get::<WrappedKekRecord>(WRAPPED_KEK_SETTING).await? {
            return self.unwrap(&record).await;
        }

        let kek = EncryptionKey::generate();
        let wrapped = self.kms.wrap_key(KEK_KEY_NAME, kek.as_bytes()).await?;
        let record = WrappedKekRecord {
            wrapped: crypto::encode_b64(&wrapped.wrapped),
            iv: crypto::encode_b64(&wrapped.iv),
            key_name: wrapped.key_name,
            key_version: wrapped.key_version,
            algorithm: wrapped.algorithm,
        };

        if self.settings.set_if_absent(WRAPPED_KEK_SETTING, &record).await? {
            info!(provider = self.kms.provider_name(), "generated new vault KEK");
            return Ok(kek);
        }

        let winner = self
            .settings
            .get::<WrappedKekRecord>(WRAPPED_KEK_SETTING)
            .await?
            .ok_or_else(|| KmsError::KeyNotFound {
                name: WRAPPED_KEK_SETTING.to_owned(),
            })?;
        self.unwrap(&winner).await
    }

    async fn unwrap(&self, record: &WrappedKekRecord) -> Result<EncryptionKey, KmsError> {
        let wrapped = crypto::decode_b64("wrapped", &record.wrapped)?;
        let iv = crypto::decode_b64("iv", &record.iv)?;
        let mut raw = self.kms.unwrap_key(&record.key_name, &wrapped, &iv).await?;
        let key = EncryptionKey::from_slice(&raw);
        raw.zeroize();
        info!(provider = self.kms.provider_name(), "vault KEK unwrapped");
        Ok(key?)
    }
}

impl fmt::Debug for KekCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KekCache")
            .field("loaded", &self.is_loaded())
            .field("gated", &self.seal.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::kms::LocalKms;
    use ivf_vault_storage::MemoryBackend;

    fn parts() -> (Arc<dyn KmsProvider>, SettingsStore) {
        let settings = SettingsStore::new(Arc::new(MemoryBackend::new()));
        let kms: Arc<dyn KmsProvider> = Arc::new(LocalKms::new(settings.clone(), EncryptionKey::generate()));
        (kms, settings)
    }

    #[tokio::test]
    async fn concurrent_cold_start_yields_one_kek() {
        let (kms, settings) = parts();
        let cache = Arc::new(KekCache::new(kms, settings));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let c = cache.clone();
            handles.push(tokio::spawn(async move { *c.get().await.unwrap().as_bytes() }));
        }
        let mut seen = Vec::new();
        for h in handles {
            seen.push(h.await.unwrap());
        }
        assert!(seen.windows(2).all(|w| w[0] == w[1]));
        assert!(cache.is_loaded());
    }

    #[tokio::test]
    async fn second_cache_unwraps_persisted_kek() {
        let (kms, settings) = parts();
        let first = KekCache::new(kms.clone(), settings.clone());
        let second = KekCache::new(kms, settings);
        let a = *first.get().await.unwrap().as_bytes();
        let b = *second.get().await.unwrap().as_bytes();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn not_loaded_until_first_get() {
        let (kms, settings) = parts();
        let cache = KekCache::new(kms, settings.clone());
        assert!(!cache.is_loaded());
        let stored: Option<serde_json::Value> = settings.get(WRAPPED_KEK_SETTING).await.unwrap();
        assert!(stored.is_none());
    }

    #[tokio::test]
    async fn gated_cache_follows_seal_state() {
        let (kms, settings) = parts();
        let seal = Arc::new(SealState::new());
        let cache = KekCache::new(kms, settings).with_seal_gate(seal.clone());

        assert!(matches!(cache.get().await, Err(KmsError::Sealed)));
        assert!(!cache.is_loaded());

        seal.unseal(EncryptionKey::generate()).await;
        let loaded = *cache.get().await.unwrap().as_bytes();

        seal.seal().await;
        assert!(matches!(cache.get().await, Err(KmsError::Sealed)));

        seal.unseal(EncryptionKey::generate()).await;
        assert_eq!(*cache.get().await.unwrap().as_bytes(), loaded);
    }
}
