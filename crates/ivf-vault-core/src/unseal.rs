//! Seal state and multi-provider auto-unseal.
//!
//! The vault master key is derived from an operator password with
//! HKDF-SHA256 over a vault-wide random salt. Each configured unseal
//! provider wraps that same master key with its own KMS backend, so any one
//! of them can bring the vault up.
//!
//! # Security model
//!
//! - The master password is never stored. Only KMS-wrapped copies of the
//!   derived key are kept, under `unseal-wrapped-<provider id>`.
//! - A verifier (a fixed plaintext sealed under the master key) lets every
//!   configure and unseal prove it holds the same key as the first one.
//! - The unsealed key lives only in [`SealState`] and is zeroized when the
//!   vault is sealed again.
//!
//! Settings used: `unseal-providers` (priority-ordered descriptor list),
//! `unseal-salt`, `unseal-verifier`, `unseal-wrapped-<id>`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::audit::{AuditEntry, AuditTrail};
use crate::crypto::{self, EncryptionKey};
use crate::error::UnsealError;
use crate::kms::KmsProvider;
use crate::siem::{EventPublisher, SecurityEvent, Severity};
use crate::store::SettingsStore;

const PROVIDERS_SETTING: &str = "unseal-providers";
const WRAPPED_PREFIX: &str = "unseal-wrapped-";
const SALT_SETTING: &str = "unseal-salt";
const VERIFIER_SETTING: &str = "unseal-verifier";
const MASTER_KEY_INFO: &[u8] = b"ivf-vault-unseal-master";
const VERIFIER_PLAINTEXT: &[u8] = b"ivf-vault-unseal-check";
const DEFAULT_KEY_NAME: &str = "vault-unseal";
const SOURCE: &str = "UnsealOrchestrator";

/// Provider id used by the implicit attempt when no providers are configured.
pub const DEFAULT_PROVIDER_ID: &str = "default";

// ── seal state ───────────────────────────────────────────────────────

/// Holds the master key while the vault is unsealed.
pub struct SealState {
    key: RwLock<Option<EncryptionKey>>,
}

impl SealState {
    /// A sealed state.
    #[must_use]
    pub fn new() -> Self {
        Self { key: RwLock::new(None) }
    }

    pub async fn unseal(&self, key: EncryptionKey) {
        *self.key.write().await = Some(key);
    }

    /// Drop the master key. `EncryptionKey` zeroizes on drop.
    pub async fn seal(&self) {
        *self.key.write().await = None;
    }

    pub async fn is_unsealed(&self) -> bool {
        self.key.read().await.is_some()
    }

    /// Short fingerprint of the loaded master key, for operators comparing
    /// instances. `None` while sealed.
    pub async fn key_check(&self) -> Option<String> {
        self.key
            .read()
            .await
            .as_ref()
            .map(|k| hex::encode(&Sha256::digest(k.as_bytes())[..8]))
    }
}

impl Default for SealState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SealState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealState").finish_non_exhaustive()
    }
}

// ── provider model ───────────────────────────────────────────────────

/// Descriptor for a new or replaced unseal provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsealProviderConfig {
    pub provider_id: String,
    /// Registered backend type, e.g. `Local`, `Azure`.
    pub provider_type: String,
    /// Lower is tried first.
    pub priority: i32,
    /// KMS key that wraps the master key.
    pub key_identifier: String,
    pub settings: BTreeMap<String, String>,
}

/// A configured provider as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredProvider {
    pub provider_id: String,
    pub provider_type: String,
    pub priority: i32,
    pub key_identifier: String,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    pub configured_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Serialize, Deserialize)]
struct WrappedMaster {
    wrapped: String,
    iv: String,
    key_name: String,
    key_version: u32,
    algorithm: String,
    configured_at: DateTime<Utc>,
}

#[derive(Clone, Serialize, Deserialize)]
struct Verifier {
    ciphertext: String,
    nonce: String,
}

/// Outcome of [`UnsealOrchestrator::auto_unseal`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsealResult {
    pub success: bool,
    pub provider_id: Option<String>,
    pub error: Option<String>,
    pub attempts_total: u32,
}

/// Live availability of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub provider_id: String,
    pub provider_type: String,
    pub priority: i32,
    pub available: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

// ── orchestrator ─────────────────────────────────────────────────────

/// Configures unseal providers and unseals the vault through them.
pub struct UnsealOrchestrator {
    settings: SettingsStore,
    seal: Arc<SealState>,
    /// Lowercased provider type → backend.
    backends: HashMap<String, Arc<dyn KmsProvider>>,
    default_backend: Arc<dyn KmsProvider>,
    events: Arc<dyn EventPublisher>,
    audit: Arc<AuditTrail>,
    providers_lock: Mutex<()>,
}

impl UnsealOrchestrator {
    /// `default_backend` serves the implicit attempt and is also registered
    /// under its own provider name.
    #[must_use]
    pub fn new(
        settings: SettingsStore,
        seal: Arc<SealState>,
        default_backend: Arc<dyn KmsProvider>,
        events: Arc<dyn EventPublisher>,
        audit: Arc<AuditTrail>,
    ) -> Self {
        let mut backends = HashMap::new();
        backends.insert(default_backend.provider_name().to_lowercase(), default_backend.clone());
        Self {
            settings,
            seal,
            backends,
            default_backend,
            events,
            audit,
            providers_lock: Mutex::new(()),
        }
    }

    /// Register the backend serving `provider_type`.
    #[must_use]
    pub fn with_backend(mut self, provider_type: &str, backend: Arc<dyn KmsProvider>) -> Self {
        self.backends.insert(provider_type.to_lowercase(), backend);
        self
    }

    #[must_use]
    pub fn seal_state(&self) -> &Arc<SealState> {
        &self.seal
    }

    fn backend(&self, provider_type: &str) -> Option<&Arc<dyn KmsProvider>> {
        self.backends.get(&provider_type.to_lowercase())
    }

    /// Configured providers, lowest priority first.
    ///
    /// # Errors
    ///
    /// Returns [`UnsealError::Store`] if the list cannot be read.
    pub async fn providers(&self) -> Result<Vec<StoredProvider>, UnsealError> {
        let mut providers: Vec<StoredProvider> = self.settings.get(PROVIDERS_SETTING).await?.unwrap_or_default();
        providers.sort_by_key(|p| p.priority);
        Ok(providers)
    }

    async fn save_providers(&self, providers: &[StoredProvider]) -> Result<(), UnsealError> {
        self.settings.set(PROVIDERS_SETTING, providers).await?;
        Ok(())
    }

    // ── master key ────────────────────────────────────────────────────

    async fn salt(&self) -> Result<Vec<u8>, UnsealError> {
        let fresh = crypto::encode_b64(&crypto::random_bytes(16));
        self.settings.set_if_absent(SALT_SETTING, &fresh).await?;
        let stored: String = self
            .settings
            .get(SALT_SETTING)
            .await?
            .ok_or_else(|| UnsealError::InvalidArgument {
                reason: "unseal salt missing".to_owned(),
            })?;
        Ok(crypto::decode_b64("salt", &stored)?)
    }

    async fn derive_master(&self, password: &str) -> Result<EncryptionKey, UnsealError> {
        let salt = self.salt().await?;
        Ok(crypto::derive_key(password.as_bytes(), Some(&salt), MASTER_KEY_INFO)?)
    }

    /// Check `key` against the verifier. With `create`, the first key seen
    /// becomes the verifier.
    async fn verify_master(&self, key: &EncryptionKey, create: bool) -> Result<(), UnsealError> {
        if create {
            let sealed = crypto::encrypt(key, VERIFIER_PLAINTEXT)?;
            let verifier = Verifier {
                ciphertext: sealed.ciphertext_b64(),
                nonce: sealed.nonce_b64(),
            };
            self.settings.set_if_absent(VERIFIER_SETTING, &verifier).await?;
        }
        let Some(v) = self.settings.get::<Verifier>(VERIFIER_SETTING).await? else {
            return Ok(());
        };
        match crypto::decrypt_b64(key, &v.ciphertext, &v.nonce) {
            Ok(plain) if plain == VERIFIER_PLAINTEXT => Ok(()),
            _ => Err(UnsealError::InvalidArgument {
                reason: "master key does not match this vault".to_owned(),
            }),
        }
    }

    async fn store_wrapped(
        &self,
        provider_id: &str,
        backend: &dyn KmsProvider,
        key_name: &str,
        master: &EncryptionKey,
    ) -> Result<(), UnsealError> {
        let wrapped = backend.wrap_key(key_name, master.as_bytes()).await?;
        let record = WrappedMaster {
            wrapped: crypto::encode_b64(&wrapped.wrapped),
            iv: crypto::encode_b64(&wrapped.iv),
            key_name: wrapped.key_name,
            key_version: wrapped.key_version,
            algorithm: wrapped.algorithm,
            configured_at: Utc::now(),
        };
        self.settings
            .set(&format!("{WRAPPED_PREFIX}{provider_id}"), &record)
            .await?;
        Ok(())
    }

    // ── configuration ─────────────────────────────────────────────────

    /// Wrap the master key derived from `master_password` with the
    /// provider's backend and add (or replace) the provider.
    ///
    /// # Errors
    ///
    /// - [`UnsealError::InvalidArgument`] for blank fields, or a password
    ///   that derives a different master key than the vault already uses.
    /// - [`UnsealError::UnknownProviderType`] if no backend serves the type.
    /// - [`UnsealError::Kms`] if wrapping fails.
    pub async fn configure_provider(
        &self,
        config: UnsealProviderConfig,
        master_password: &str,
        user_id: Option<&str>,
    ) -> Result<StoredProvider, UnsealError> {
        if config.provider_id.trim().is_empty() || config.key_identifier.trim().is_empty() {
            return Err(UnsealError::InvalidArgument {
                reason: "provider id and key identifier are required".to_owned(),
            });
        }
        if master_password.is_empty() {
            return Err(UnsealError::InvalidArgument {
                reason: "master password is required".to_owned(),
            });
        }
        let backend = self
            .backend(&config.provider_type)
            .ok_or_else(|| UnsealError::UnknownProviderType {
                provider_type: config.provider_type.clone(),
            })?
            .clone();

        let master = self.derive_master(master_password).await?;
        self.verify_master(&master, true).await?;
        self.store_wrapped(&config.provider_id, backend.as_ref(), &config.key_identifier, &master)
            .await?;

        let stored = StoredProvider {
            provider_id: config.provider_id,
            provider_type: config.provider_type,
            priority: config.priority,
            key_identifier: config.key_identifier,
            settings: config.settings,
            configured_at: Utc::now(),
            last_used_at: None,
        };
        {
            let _guard = self.providers_lock.lock().await;
            let mut providers = self.providers().await?;
            providers.retain(|p| p.provider_id != stored.provider_id);
            providers.push(stored.clone());
            providers.sort_by_key(|p| p.priority);
            self.save_providers(&providers).await?;
        }

        self.audit
            .record(
                AuditEntry::new("unseal.provider.configured", "UnsealProvider")
                    .entity(stored.provider_id.clone())
                    .user(user_id)
                    .details(serde_json::json!({
                        "providerType": stored.provider_type,
                        "priority": stored.priority,
                    })),
            )
            .await?;
        info!(
            provider_id = %stored.provider_id,
            provider_type = %stored.provider_type,
            priority = stored.priority,
            "unseal provider configured"
        );
        Ok(stored)
    }

    /// Configure the implicit default attempt on the default backend.
    ///
    /// # Errors
    ///
    /// Same as [`Self::configure_provider`], minus the type lookup.
    pub async fn configure_default(&self, master_password: &str, user_id: Option<&str>) -> Result<(), UnsealError> {
        if master_password.is_empty() {
            return Err(UnsealError::InvalidArgument {
                reason: "master password is required".to_owned(),
            });
        }
        let master = self.derive_master(master_password).await?;
        self.verify_master(&master, true).await?;
        self.store_wrapped(DEFAULT_PROVIDER_ID, self.default_backend.as_ref(), DEFAULT_KEY_NAME, &master)
            .await?;
        self.audit
            .record(
                AuditEntry::new("unseal.provider.configured", "UnsealProvider")
                    .entity(DEFAULT_PROVIDER_ID)
                    .user(user_id)
                    .details(serde_json::json!({
                        "providerType": self.default_backend.provider_name(),
                    })),
            )
            .await?;
        info!("default unseal configured");
        Ok(())
    }

    /// Remove a provider and its wrapped key.
    ///
    /// # Errors
    ///
    /// Returns [`UnsealError::ProviderNotFound`] if the id is not configured.
    pub async fn remove_provider(&self, provider_id: &str, user_id: Option<&str>) -> Result<(), UnsealError> {
        {
            let _guard = self.providers_lock.lock().await;
            let mut providers = self.providers().await?;
            let before = providers.len();
            providers.retain(|p| p.provider_id != provider_id);
            if providers.len() == before {
                return Err(UnsealError::ProviderNotFound {
                    provider_id: provider_id.to_owned(),
                });
            }
            self.save_providers(&providers).await?;
        }
        self.settings.delete(&format!("{WRAPPED_PREFIX}{provider_id}")).await?;
        self.audit
            .record(
                AuditEntry::new("unseal.provider.removed", "UnsealProvider")
                    .entity(provider_id)
                    .user(user_id),
            )
            .await?;
        info!(provider_id, "unseal provider removed");
        Ok(())
    }

    // ── unseal ────────────────────────────────────────────────────────

    async fn attempt(&self, provider_id: &str, backend: &dyn KmsProvider) -> Result<(), UnsealError> {
        let record: WrappedMaster = self
            .settings
            .get(&format!("{WRAPPED_PREFIX}{provider_id}"))
            .await?
            .ok_or_else(|| UnsealError::NotConfigured {
                provider_id: provider_id.to_owned(),
            })?;
        let wrapped = crypto::decode_b64("wrapped", &record.wrapped)?;
        let iv = crypto::decode_b64("iv", &record.iv)?;
        let mut raw = backend.unwrap_key(&record.key_name, &wrapped, &iv).await?;
        let key = EncryptionKey::from_slice(&raw);
        raw.zeroize();
        let key = key?;
        self.verify_master(&key, false).await?;
        self.seal.unseal(key).await;
        Ok(())
    }

    /// Try providers by ascending priority until one unseals the vault.
    ///
    /// With no providers configured, one implicit attempt is made with the
    /// default backend. If every configured provider fails, a critical
    /// `vault.unseal.all_failed` event is published.
    ///
    /// # Errors
    ///
    /// Returns [`UnsealError::Store`] only if the provider list cannot be
    /// read. Individual provider failures are reported in the result.
    pub async fn auto_unseal(&self) -> Result<UnsealResult, UnsealError> {
        let providers = self.providers().await?;
        if providers.is_empty() {
            let outcome = self.attempt(DEFAULT_PROVIDER_ID, self.default_backend.as_ref()).await;
            if let Err(e) = &outcome {
                warn!(error = %e, "default auto-unseal failed");
            } else {
                info!("vault unsealed via default provider");
            }
            return Ok(UnsealResult {
                success: outcome.is_ok(),
                provider_id: Some(DEFAULT_PROVIDER_ID.to_owned()),
                error: outcome.err().map(|_| "Default auto-unseal failed".to_owned()),
                attempts_total: 1,
            });
        }

        let mut attempts = 0u32;
        for provider in &providers {
            attempts = attempts.saturating_add(1);
            let Some(backend) = self.backend(&provider.provider_type) else {
                warn!(
                    provider_id = %provider.provider_id,
                    provider_type = %provider.provider_type,
                    "no backend for unseal provider"
                );
                continue;
            };
            match self.attempt(&provider.provider_id, backend.as_ref()).await {
                Ok(()) => {
                    self.touch(&provider.provider_id).await;
                    info!(
                        provider_id = %provider.provider_id,
                        provider_type = %provider.provider_type,
                        attempts,
                        "vault unsealed"
                    );
                    return Ok(UnsealResult {
                        success: true,
                        provider_id: Some(provider.provider_id.clone()),
                        error: None,
                        attempts_total: attempts,
                    });
                }
                Err(e) => warn!(provider_id = %provider.provider_id, error = %e, "unseal provider failed"),
            }
        }

        self.events
            .publish(
                SecurityEvent::new("vault.unseal.all_failed", Severity::Critical, SOURCE)
                    .action("vault.unseal")
                    .resource("Vault", "master")
                    .outcome("failure")
                    .reason(format!("All {attempts} unseal providers failed")),
            )
            .await;
        Ok(UnsealResult {
            success: false,
            provider_id: None,
            error: Some(format!("All {attempts} providers failed")),
            attempts_total: attempts,
        })
    }

    /// Record a successful use. Failure here does not undo the unseal.
    async fn touch(&self, provider_id: &str) {
        let _guard = self.providers_lock.lock().await;
        let result = async {
            let mut providers = self.providers().await?;
            if let Some(p) = providers.iter_mut().find(|p| p.provider_id == provider_id) {
                p.last_used_at = Some(Utc::now());
            }
            self.save_providers(&providers).await
        }
        .await;
        if let Err(e) = result {
            warn!(provider_id, error = %e, "failed to record provider use");
        }
    }

    /// Availability of every provider, lowest priority first.
    ///
    /// # Errors
    ///
    /// Returns [`UnsealError::Store`] if the provider list cannot be read.
    pub async fn provider_status(&self) -> Result<Vec<ProviderStatus>, UnsealError> {
        let mut statuses = Vec::new();
        for p in self.providers().await? {
            let error = match self.backend(&p.provider_type) {
                None => Some("No KMS backend registered".to_owned()),
                Some(backend) if !backend.is_healthy().await => Some("Provider unavailable".to_owned()),
                Some(_) => None,
            };
            statuses.push(ProviderStatus {
                available: error.is_none(),
                provider_id: p.provider_id,
                provider_type: p.provider_type,
                priority: p.priority,
                last_used_at: p.last_used_at,
                error,
            });
        }
        Ok(statuses)
    }
}

impl fmt::Debug for UnsealOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.backends.keys().collect();
        types.sort();
        f.debug_struct("UnsealOrchestrator")
            .field("backends", &types)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::kms::LocalKms;
    use crate::siem::RecordingEventPublisher;
    use ivf_vault_storage::MemoryBackend;

    struct Fixture {
        unseal: UnsealOrchestrator,
        settings: SettingsStore,
        events: Arc<RecordingEventPublisher>,
        audit: Arc<AuditTrail>,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryBackend::new());
        let settings = SettingsStore::new(storage.clone());
        let kms: Arc<dyn KmsProvider> = Arc::new(LocalKms::new(settings.clone(), EncryptionKey::generate()));
        let events = Arc::new(RecordingEventPublisher::new());
        let audit = Arc::new(AuditTrail::new(storage));
        let unseal = UnsealOrchestrator::new(
            settings.clone(),
            Arc::new(SealState::new()),
            kms,
            events.clone(),
            audit.clone(),
        );
        Fixture {
            unseal,
            settings,
            events,
            audit,
        }
    }

    fn local(id: &str, priority: i32) -> UnsealProviderConfig {
        UnsealProviderConfig {
            provider_id: id.to_owned(),
            provider_type: "Local".to_owned(),
            priority,
            key_identifier: format!("unseal-{id}"),
            settings: BTreeMap::new(),
        }
    }

    async fn corrupt(f: &Fixture, id: &str) {
        let name = format!("{WRAPPED_PREFIX}{id}");
        let mut record: WrappedMaster = f.settings.get(&name).await.unwrap().unwrap();
        record.wrapped = crypto::encode_b64(&[0u8; 48]);
        f.settings.set(&name, &record).await.unwrap();
    }

    #[tokio::test]
    async fn seal_state_roundtrip() {
        let seal = SealState::new();
        assert!(!seal.is_unsealed().await);
        assert!(seal.key_check().await.is_none());
        seal.unseal(EncryptionKey::generate()).await;
        assert!(seal.is_unsealed().await);
        assert_eq!(seal.key_check().await.unwrap().len(), 16);
        seal.seal().await;
        assert!(!seal.is_unsealed().await);
    }

    #[tokio::test]
    async fn first_failure_falls_over_to_second() {
        let f = fixture();
        f.unseal.configure_provider(local("p2", 2), "hunter2", None).await.unwrap();
        f.unseal.configure_provider(local("p1", 1), "hunter2", None).await.unwrap();
        corrupt(&f, "p1").await;

        let r = f.unseal.auto_unseal().await.unwrap();
        assert_eq!(
            r,
            UnsealResult {
                success: true,
                provider_id: Some("p2".to_owned()),
                error: None,
                attempts_total: 2,
            }
        );
        assert!(f.unseal.seal_state().is_unsealed().await);
        let providers = f.unseal.providers().await.unwrap();
        assert!(providers[0].last_used_at.is_none());
        assert!(providers[1].last_used_at.is_some());
    }

    #[tokio::test]
    async fn all_failing_publishes_critical_event() {
        let f = fixture();
        f.unseal.configure_provider(local("p1", 1), "pw", None).await.unwrap();
        f.unseal.configure_provider(local("p2", 2), "pw", None).await.unwrap();
        corrupt(&f, "p1").await;
        corrupt(&f, "p2").await;

        let r = f.unseal.auto_unseal().await.unwrap();
        assert!(!r.success);
        assert_eq!(r.attempts_total, 2);
        let events = f.events.of_type("vault.unseal.all_failed").await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Critical);
        assert_eq!(events[0].reason.as_deref(), Some("All 2 unseal providers failed"));
        assert!(!f.unseal.seal_state().is_unsealed().await);
    }

    #[tokio::test]
    async fn empty_list_makes_one_default_attempt() {
        let f = fixture();
        let r = f.unseal.auto_unseal().await.unwrap();
        assert!(!r.success);
        assert_eq!(r.attempts_total, 1);
        assert_eq!(r.provider_id.as_deref(), Some(DEFAULT_PROVIDER_ID));
        assert!(f.events.events().await.is_empty());

        f.unseal.configure_default("pw", None).await.unwrap();
        let r = f.unseal.auto_unseal().await.unwrap();
        assert!(r.success);
        assert_eq!(r.attempts_total, 1);
    }

    #[tokio::test]
    async fn every_provider_unseals_to_the_same_key() {
        let f = fixture();
        f.unseal.configure_provider(local("a", 1), "pw", None).await.unwrap();
        f.unseal.configure_provider(local("b", 2), "pw", None).await.unwrap();
        f.unseal.auto_unseal().await.unwrap();
        let via_a = f.unseal.seal_state().key_check().await.unwrap();

        f.unseal.seal_state().seal().await;
        f.unseal.remove_provider("a", None).await.unwrap();
        let r = f.unseal.auto_unseal().await.unwrap();
        assert_eq!(r.provider_id.as_deref(), Some("b"));
        assert_eq!(f.unseal.seal_state().key_check().await.unwrap(), via_a);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_after_first_configure() {
        let f = fixture();
        f.unseal.configure_provider(local("a", 1), "right", None).await.unwrap();
        let err = f.unseal.configure_provider(local("b", 2), "wrong", None).await.unwrap_err();
        assert!(matches!(err, UnsealError::InvalidArgument { .. }));
        assert_eq!(f.unseal.providers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reconfigure_replaces_by_id() {
        let f = fixture();
        f.unseal.configure_provider(local("a", 5), "pw", None).await.unwrap();
        f.unseal.configure_provider(local("a", 1), "pw", Some("admin")).await.unwrap();
        let providers = f.unseal.providers().await.unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].priority, 1);
        assert_eq!(
            f.audit.recent(10, Some("unseal.provider.configured")).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn unknown_type_is_rejected() {
        let f = fixture();
        let mut cfg = local("x", 1);
        cfg.provider_type = "Gcp".to_owned();
        assert!(matches!(
            f.unseal.configure_provider(cfg, "pw", None).await,
            Err(UnsealError::UnknownProviderType { .. })
        ));
    }

    #[tokio::test]
    async fn status_is_priority_ordered() {
        let f = fixture();
        f.unseal.configure_provider(local("late", 9), "pw", None).await.unwrap();
        f.unseal.configure_provider(local("early", 1), "pw", None).await.unwrap();
        let status = f.unseal.provider_status().await.unwrap();
        let ids: Vec<&str> = status.iter().map(|s| s.provider_id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
        assert!(status.iter().all(|s| s.available));
    }

    #[tokio::test]
    async fn removing_unknown_provider_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.unseal.remove_provider("ghost", None).await,
            Err(UnsealError::ProviderNotFound { .. })
        ));
    }
}
