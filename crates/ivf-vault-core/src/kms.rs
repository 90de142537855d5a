//! Key management providers.
//!
//! [`KmsProvider`] is the boundary to whatever holds root key material:
//! named keys with versions, encrypt/decrypt, and key wrap/unwrap for
//! envelope encryption. [`LocalKms`] keeps its keys in the settings store,
//! sealed under a root key supplied by configuration. Cloud and HSM backends
//! are not implemented here; a deployment injects a client that implements
//! [`KmsProvider`] and [`KmsBackend::build`] slots it into the matching
//! variant.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use zeroize::Zeroize;

use crate::crypto::{self, EncryptionKey};
use crate::error::{CryptoError, KmsError};
use crate::store::SettingsStore;

/// Algorithm label attached to every local wrap/encrypt result.
pub const LOCAL_ALGORITHM: &str = "AES-256-GCM";

/// Metadata about a managed key. Never includes key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub name: String,
    pub version: u32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub provider: String,
}

/// A key wrapped by a KMS key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub wrapped: Vec<u8>,
    pub iv: Vec<u8>,
    pub key_name: String,
    pub key_version: u32,
    pub algorithm: String,
}

/// Data encrypted by a KMS key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmsCiphertext {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub key_name: String,
    pub key_version: u32,
    pub algorithm: String,
}

/// Key name used for purpose-scoped encrypt/decrypt, e.g. `purpose-data`.
#[must_use]
pub fn purpose_key_name(purpose: &str) -> String {
    format!("purpose-{}", purpose.to_ascii_lowercase())
}

/// Provider-agnostic KMS operations.
#[async_trait::async_trait]
pub trait KmsProvider: Send + Sync {
    /// Provider name, e.g. `Local`, `Azure`.
    fn provider_name(&self) -> &str;

    /// Whether the provider is reachable. Failures report `false`.
    async fn is_healthy(&self) -> bool;

    /// Create a new key.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError`] if the key exists or the provider fails.
    async fn create_key(&self, name: &str) -> Result<KeyInfo, KmsError>;

    /// Key metadata, or `None` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError`] if the provider fails.
    async fn key_info(&self, name: &str) -> Result<Option<KeyInfo>, KmsError>;

    /// All managed keys.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError`] if the provider fails.
    async fn list_keys(&self) -> Result<Vec<KeyInfo>, KmsError>;

    /// Create a new version of a key. Old versions remain usable for decrypt.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::KeyNotFound`] if the key does not exist.
    async fn rotate_key(&self, name: &str) -> Result<KeyInfo, KmsError>;

    /// Encrypt data under the named key.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError`] if the provider fails.
    async fn encrypt(&self, key_name: &str, plaintext: &[u8]) -> Result<KmsCiphertext, KmsError>;

    /// Decrypt data produced by [`encrypt`](KmsProvider::encrypt).
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::Crypto`] if no version of the key authenticates it.
    async fn decrypt(&self, key_name: &str, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>, KmsError>;

    /// Wrap key material under the named key.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError`] if the provider fails.
    async fn wrap_key(&self, key_name: &str, key: &[u8]) -> Result<WrappedKey, KmsError>;

    /// Unwrap key material produced by [`wrap_key`](KmsProvider::wrap_key).
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::Crypto`] if no version of the key authenticates it.
    async fn unwrap_key(&self, key_name: &str, wrapped: &[u8], iv: &[u8]) -> Result<Vec<u8>, KmsError>;
}

// ── Local provider ───────────────────────────────────────────────────

/// Settings record for one local key version. The material is sealed under
/// the provider's root key.
#[derive(Clone, Serialize, Deserialize)]
struct LocalKeyRecord {
    name: String,
    version: u32,
    enabled: bool,
    created_at: DateTime<Utc>,
    rotated_at: Option<DateTime<Utc>>,
    archived: bool,
    material: String,
    material_iv: String,
}

impl LocalKeyRecord {
    fn info(&self) -> KeyInfo {
        KeyInfo {
            name: self.name.clone(),
            version: self.version,
            enabled: self.enabled,
            created_at: self.created_at,
            rotated_at: self.rotated_at,
            provider: "Local".to_owned(),
        }
    }
}

const LOCAL_KEY_PREFIX: &str = "kms-key-";

/// AES-256-GCM key store kept in vault settings.
pub struct LocalKms {
    settings: SettingsStore,
    root: EncryptionKey,
}

impl LocalKms {
    /// Create a local provider whose key material is sealed under `root`.
    #[must_use]
    pub fn new(settings: SettingsStore, root: EncryptionKey) -> Self {
        Self { settings, root }
    }

    fn setting_name(name: &str) -> String {
        format!("{LOCAL_KEY_PREFIX}{name}")
    }

    fn archive_name(name: &str, version: u32) -> String {
        format!("{LOCAL_KEY_PREFIX}{name}-v{version}")
    }

    fn seal_material(&self, name: &str, version: u32, created_at: DateTime<Utc>) -> Result<LocalKeyRecord, KmsError> {
        let key = EncryptionKey::generate();
        let sealed = crypto::encrypt(&self.root, key.as_bytes())?;
        Ok(LocalKeyRecord {
            name: name.to_owned(),
            version,
            enabled: true,
            created_at,
            rotated_at: None,
            archived: false,
            material: sealed.ciphertext_b64(),
            material_iv: sealed.nonce_b64(),
        })
    }

    fn open_material(&self, record: &LocalKeyRecord) -> Result<EncryptionKey, KmsError> {
        let mut raw = crypto::decrypt_b64(&self.root, &record.material, &record.material_iv)?;
        let key = EncryptionKey::from_slice(&raw);
        raw.zeroize();
        Ok(key?)
    }

    async fn load(&self, name: &str) -> Result<Option<LocalKeyRecord>, KmsError> {
        Ok(self.settings.get(&Self::setting_name(name)).await?)
    }

    async fn load_or_create(&self, name: &str) -> Result<LocalKeyRecord, KmsError> {
        if let Some(record) = self.load(name).await? {
            return Ok(record);
        }
        let record = self.seal_material(name, 1, Utc::now())?;
        if self.settings.set_if_absent(&Self::setting_name(name), &record).await? {
            info!(key = %name, "local KMS key created");
            return Ok(record);
        }
        // Another writer created it first; use theirs.
        self.load(name)
            .await?
            .ok_or_else(|| KmsError::KeyNotFound { name: name.to_owned() })
    }

    /// Current key first, then archived versions newest to oldest.
    async fn candidate_keys(&self, name: &str) -> Result<Vec<EncryptionKey>, KmsError> {
        let current = self
            .load(name)
            .await?
            .ok_or_else(|| KmsError::KeyNotFound { name: name.to_owned() })?;
        let mut keys = vec![self.open_material(&current)?];
        for v in (1..current.version).rev() {
            if let Some(old) = self.settings.get::<LocalKeyRecord>(&Self::archive_name(name, v)).await? {
                keys.push(self.open_material(&old)?);
            }
        }
        Ok(keys)
    }

    async fn open_with_any(&self, name: &str, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>, KmsError> {
        let mut last = None;
        for key in self.candidate_keys(name).await? {
            match crypto::decrypt(&key, ciphertext, iv) {
                Ok(plain) => return Ok(plain),
                Err(e) => last = Some(e),
            }
        }
        Err(KmsError::Crypto(last.unwrap_or(CryptoError::Decryption {
            reason: "no key versions available".to_owned(),
        })))
    }
}

impl fmt::Debug for LocalKms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKms")
            .field("root", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl KmsProvider for LocalKms {
    #[allow(clippy::unnecessary_literal_bound)]
    fn provider_name(&self) -> &str {
        "Local"
    }

    async fn is_healthy(&self) -> bool {
        self.settings.names(LOCAL_KEY_PREFIX).await.is_ok()
    }

    async fn create_key(&self, name: &str) -> Result<KeyInfo, KmsError> {
        let record = self.seal_material(name, 1, Utc::now())?;
        if !self.settings.set_if_absent(&Self::setting_name(name), &record).await? {
            return Err(KmsError::Unavailable {
                provider: "Local".to_owned(),
                reason: format!("key '{name}' already exists"),
            });
        }
        info!(key = %name, "local KMS key created");
        Ok(record.info())
    }

    async fn key_info(&self, name: &str) -> Result<Option<KeyInfo>, KmsError> {
        Ok(self.load(name).await?.map(|r| r.info()))
    }

    async fn list_keys(&self) -> Result<Vec<KeyInfo>, KmsError> {
        let mut out = Vec::new();
        for setting in self.settings.names(LOCAL_KEY_PREFIX).await? {
            if let Some(record) = self.settings.get::<LocalKeyRecord>(&setting).await? {
                if !record.archived {
                    out.push(record.info());
                }
            }
        }
        Ok(out)
    }

    async fn rotate_key(&self, name: &str) -> Result<KeyInfo, KmsError> {
        let current = self
            .load(name)
            .await?
            .ok_or_else(|| KmsError::KeyNotFound { name: name.to_owned() })?;

        let mut archived = current.clone();
        archived.archived = true;
        self.settings
            .set(&Self::archive_name(name, current.version), &archived)
            .await?;

        let mut next = self.seal_material(name, current.version.saturating_add(1), current.created_at)?;
        next.rotated_at = Some(Utc::now());
        self.settings.set(&Self::setting_name(name), &next).await?;
        info!(key = %name, version = next.version, "local KMS key rotated");
        Ok(next.info())
    }

    async fn encrypt(&self, key_name: &str, plaintext: &[u8]) -> Result<KmsCiphertext, KmsError> {
        let record = self.load_or_create(key_name).await?;
        let key = self.open_material(&record)?;
        let sealed = crypto::encrypt(&key, plaintext)?;
        Ok(KmsCiphertext {
            ciphertext: sealed.ciphertext,
            iv: sealed.nonce.to_vec(),
            key_name: key_name.to_owned(),
            key_version: record.version,
            algorithm: LOCAL_ALGORITHM.to_owned(),
        })
    }

    async fn decrypt(&self, key_name: &str, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>, KmsError> {
        self.open_with_any(key_name, ciphertext, iv).await
    }

    async fn wrap_key(&self, key_name: &str, key: &[u8]) -> Result<WrappedKey, KmsError> {
        let out = self.encrypt(key_name, key).await?;
        Ok(WrappedKey {
            wrapped: out.ciphertext,
            iv: out.iv,
            key_name: out.key_name,
            key_version: out.key_version,
            algorithm: out.algorithm,
        })
    }

    async fn unwrap_key(&self, key_name: &str, wrapped: &[u8], iv: &[u8]) -> Result<Vec<u8>, KmsError> {
        self.open_with_any(key_name, wrapped, iv).await
    }
}

// ── Backend selection ────────────────────────────────────────────────

/// Which KMS backend the deployment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KmsKind {
    Local,
    Azure,
    Aws,
    HashiCorp,
}

impl KmsKind {
    /// Canonical provider name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "Local",
            Self::Azure => "Azure",
            Self::Aws => "AWS",
            Self::HashiCorp => "HashiCorp",
        }
    }
}

impl fmt::Display for KmsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KmsKind {
    type Err = KmsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "azure" => Ok(Self::Azure),
            "aws" => Ok(Self::Aws),
            "hashicorp" | "vault" => Ok(Self::HashiCorp),
            other => Err(KmsError::Unavailable {
                provider: other.to_owned(),
                reason: "unknown KMS provider kind".to_owned(),
            }),
        }
    }
}

/// The configured KMS backend. One variant per provider kind, selected once
/// by [`KmsBackend::build`].
pub enum KmsBackend {
    Local(LocalKms),
    Azure(Arc<dyn KmsProvider>),
    Aws(Arc<dyn KmsProvider>),
    HashiCorp(Arc<dyn KmsProvider>),
}

impl KmsBackend {
    /// Build the backend for `kind`.
    ///
    /// `Local` needs `local_root`; the remote kinds need an injected client.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::Unavailable`] if the required input is missing.
    pub fn build(
        kind: KmsKind,
        settings: SettingsStore,
        local_root: Option<EncryptionKey>,
        remote: Option<Arc<dyn KmsProvider>>,
    ) -> Result<Self, KmsError> {
        let missing_client = || KmsError::Unavailable {
            provider: kind.as_str().to_owned(),
            reason: "no client configured for this provider".to_owned(),
        };
        match kind {
            KmsKind::Local => {
                let root = local_root.ok_or_else(|| KmsError::Unavailable {
                    provider: "Local".to_owned(),
                    reason: "no local root key configured".to_owned(),
                })?;
                Ok(Self::Local(LocalKms::new(settings, root)))
            }
            KmsKind::Azure => Ok(Self::Azure(remote.ok_or_else(missing_client)?)),
            KmsKind::Aws => Ok(Self::Aws(remote.ok_or_else(missing_client)?)),
            KmsKind::HashiCorp => Ok(Self::HashiCorp(remote.ok_or_else(missing_client)?)),
        }
    }

    /// The kind of this backend.
    #[must_use]
    pub fn kind(&self) -> KmsKind {
        match self {
            Self::Local(_) => KmsKind::Local,
            Self::Azure(_) => KmsKind::Azure,
            Self::Aws(_) => KmsKind::Aws,
            Self::HashiCorp(_) => KmsKind::HashiCorp,
        }
    }

    fn inner(&self) -> &dyn KmsProvider {
        match self {
            Self::Local(local) => local,
            Self::Azure(p) | Self::Aws(p) | Self::HashiCorp(p) => p.as_ref(),
        }
    }
}

impl fmt::Debug for KmsBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmsBackend")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl KmsProvider for KmsBackend {
    fn provider_name(&self) -> &str {
        self.inner().provider_name()
    }

    async fn is_healthy(&self) -> bool {
        self.inner().is_healthy().await
    }

    async fn create_key(&self, name: &str) -> Result<KeyInfo, KmsError> {
        self.inner().create_key(name).await
    }

    async fn key_info(&self, name: &str) -> Result<Option<KeyInfo>, KmsError> {
        self.inner().key_info(name).await
    }

    async fn list_keys(&self) -> Result<Vec<KeyInfo>, KmsError> {
        self.inner().list_keys().await
    }

    async fn rotate_key(&self, name: &str) -> Result<KeyInfo, KmsError> {
        self.inner().rotate_key(name).await
    }

    async fn encrypt(&self, key_name: &str, plaintext: &[u8]) -> Result<KmsCiphertext, KmsError> {
        self.inner().encrypt(key_name, plaintext).await
    }

    async fn decrypt(&self, key_name: &str, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>, KmsError> {
        self.inner().decrypt(key_name, ciphertext, iv).await
    }

    async fn wrap_key(&self, key_name: &str, key: &[u8]) -> Result<WrappedKey, KmsError> {
        self.inner().wrap_key(key_name, key).await
    }

    async fn unwrap_key(&self, key_name: &str, wrapped: &[u8], iv: &[u8]) -> Result<Vec<u8>, KmsError> {
        self.inner().unwrap_key(key_name, wrapped, iv).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ivf_vault_storage::MemoryBackend;

    fn local() -> LocalKms {
        LocalKms::new(
            SettingsStore::new(Arc::new(MemoryBackend::new())),
            EncryptionKey::generate(),
        )
    }

    #[tokio::test]
    async fn wrap_unwrap_roundtrip_creates_key_on_demand() {
        let kms = local();
        let dek = EncryptionKey::generate();
        let wrapped = kms.wrap_key("vault-kek", dek.as_bytes()).await.unwrap();
        assert_eq!(wrapped.key_version, 1);
        assert_eq!(wrapped.algorithm, LOCAL_ALGORITHM);

        let plain = kms.unwrap_key("vault-kek", &wrapped.wrapped, &wrapped.iv).await.unwrap();
        assert_eq!(plain, dek.as_bytes());
    }

    #[tokio::test]
    async fn create_key_twice_fails() {
        let kms = local();
        kms.create_key("k").await.unwrap();
        assert!(kms.create_key("k").await.is_err());
    }

    #[tokio::test]
    async fn rotate_keeps_old_ciphertext_decryptable() {
        let kms = local();
        let before = kms.encrypt("purpose-data", b"old").await.unwrap();
        let info = kms.rotate_key("purpose-data").await.unwrap();
        assert_eq!(info.version, 2);
        assert!(info.rotated_at.is_some());

        let after = kms.encrypt("purpose-data", b"new").await.unwrap();
        assert_eq!(after.key_version, 2);
        assert_eq!(kms.decrypt("purpose-data", &before.ciphertext, &before.iv).await.unwrap(), b"old");
        assert_eq!(kms.decrypt("purpose-data", &after.ciphertext, &after.iv).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn rotate_missing_key_is_not_found() {
        let kms = local();
        assert!(matches!(
            kms.rotate_key("nope").await,
            Err(KmsError::KeyNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn list_keys_hides_archives() {
        let kms = local();
        kms.create_key("a").await.unwrap();
        kms.rotate_key("a").await.unwrap();
        kms.create_key("b").await.unwrap();
        let names: Vec<String> = kms.list_keys().await.unwrap().into_iter().map(|k| k.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn unwrap_under_different_root_fails() {
        let storage = Arc::new(MemoryBackend::new());
        let a = LocalKms::new(SettingsStore::new(storage.clone()), EncryptionKey::generate());
        let b = LocalKms::new(SettingsStore::new(storage), EncryptionKey::generate());
        let wrapped = a.wrap_key("k", &[7u8; 32]).await.unwrap();
        assert!(matches!(
            b.unwrap_key("k", &wrapped.wrapped, &wrapped.iv).await,
            Err(KmsError::Crypto(_))
        ));
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("azure".parse::<KmsKind>().unwrap(), KmsKind::Azure);
        assert_eq!("HashiCorp".parse::<KmsKind>().unwrap(), KmsKind::HashiCorp);
        assert_eq!("LOCAL".parse::<KmsKind>().unwrap(), KmsKind::Local);
        assert!("gcp".parse::<KmsKind>().is_err());
    }

    #[tokio::test]
    async fn build_remote_without_client_is_unavailable() {
        let settings = SettingsStore::new(Arc::new(MemoryBackend::new()));
        let err = KmsBackend::build(KmsKind::Aws, settings.clone(), None, None).unwrap_err();
        assert!(matches!(err, KmsError::Unavailable { .. }));

        let local = KmsBackend::build(KmsKind::Local, settings, Some(EncryptionKey::generate()), None).unwrap();
        assert_eq!(local.kind(), KmsKind::Local);
        assert_eq!(local.provider_name(), "Local");
        assert!(local.is_healthy().await);
    }

    #[tokio::test]
    async fn remote_variant_delegates_to_client() {
        let settings = SettingsStore::new(Arc::new(MemoryBackend::new()));
        let client: Arc<dyn KmsProvider> = Arc::new(local());
        let backend = KmsBackend::build(KmsKind::Azure, settings, None, Some(client)).unwrap();
        assert_eq!(backend.kind(), KmsKind::Azure);
        let wrapped = backend.wrap_key("k", b"abc").await.unwrap();
        assert_eq!(backend.unwrap_key("k", &wrapped.wrapped, &wrapped.iv).await.unwrap(), b"abc");
    }
}
