//! Data-encryption-key lifecycle.
//!
//! Each purpose (`data`, `pii`, ...) has one current DEK stored as
//! `dek-<purpose>` and archived versions stored as `dek-<purpose>-v<N>`.
//! Material is wrapped by the KMS before it reaches storage. The version
//! counter lives in the settings entry `dek-version-<purpose>`.
//!
//! Application columns hold field envelopes `{"c": .., "iv": .., "v": N}`
//! produced by [`KeyLifecycleManager::encrypt_field`]. After a rotation,
//! [`KeyLifecycleManager::re_encrypt_table`] moves every envelope below the
//! current version onto the new DEK, one bounded page at a time.
//!
//! Rotation writes the archive, the new current key, and the metadata in
//! three separate steps. The persisted metadata is the version of record; if
//! a previous rotation stopped after writing the new key but before saving
//! metadata, the next rotation notices that the newest archive differs from
//! the current material and numbers past it instead of overwriting it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::watch;
use tracing::{error, info, warn};
use zeroize::Zeroize;

use crate::audit::{AuditEntry, AuditTrail};
use crate::crypto::{self, EncryptionKey};
use crate::error::DekError;
use crate::kms::KmsProvider;
use crate::store::{JsonStore, SettingsStore};
use crate::table_source::EncryptedTableSource;

const KEY_PREFIX: &str = "sys/keys/";
const CONFIG_PREFIX: &str = "sys/encryption-configs/";

/// KMS key that wraps every DEK.
pub const DEK_WRAP_KEY: &str = "vault-dek-wrap";

/// Default page size for re-encryption.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Persisted version counter for one purpose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DekVersionMetadata {
    pub current_version: u32,
    pub rotated_at: Option<DateTime<Utc>>,
    pub old_versions_kept: u32,
}

/// Public view of [`DekVersionMetadata`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DekVersionInfo {
    pub purpose: String,
    pub current_version: u32,
    pub last_rotated_at: Option<DateTime<Utc>>,
    pub old_versions_kept: u32,
}

/// Outcome of [`KeyLifecycleManager::rotate_dek`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DekRotationResult {
    pub success: bool,
    pub purpose: String,
    pub new_version: u32,
    pub previous_version: Option<u32>,
    pub error: Option<String>,
}

/// Which columns of a table are encrypted under which purpose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub table_name: String,
    pub dek_purpose: String,
    pub encrypted_fields: Vec<String>,
    pub enabled: bool,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of [`KeyLifecycleManager::re_encrypt_table`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReEncryptionResult {
    pub table: String,
    pub total_rows: usize,
    pub re_encrypted: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub cancelled: bool,
    pub error: Option<String>,
}

impl ReEncryptionResult {
    /// Whether the run finished without a batch-level error or cancellation.
    #[must_use]
    pub fn success(&self) -> bool {
        self.error.is_none() && !self.cancelled
    }
}

/// Re-encryption status of one configured table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReEncryptionProgress {
    pub table: String,
    pub purpose: String,
    pub total_rows: usize,
    pub encrypted_rows: usize,
    pub current_version_rows: usize,
    pub current_version: u32,
    /// Every encrypted row is on the current DEK version.
    pub is_complete: bool,
}

/// Wrapped DEK material at rest.
#[derive(Clone, Serialize, Deserialize)]
struct StoredDek {
    wrapped: String,
    iv: String,
    kms_key: String,
    created_at: DateTime<Utc>,
}

/// Column envelope produced by field encryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FieldEnvelope {
    c: String,
    iv: String,
    #[serde(default)]
    v: Option<u32>,
}

fn normalize_purpose(purpose: &str) -> Result<String, DekError> {
    let p = purpose.trim().to_ascii_lowercase();
    if p.is_empty() || !p.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(DekError::InvalidArgument {
            reason: format!("invalid DEK purpose '{purpose}'"),
        });
    }
    Ok(p)
}

fn dek_name(purpose: &str) -> String {
    format!("dek-{purpose}")
}

fn archive_name(purpose: &str, version: u32) -> String {
    format!("dek-{purpose}-v{version}")
}

fn version_setting(purpose: &str) -> String {
    format!("dek-version-{purpose}")
}

fn config_key(table: &str, purpose: &str) -> String {
    format!("{CONFIG_PREFIX}{}/{purpose}", table.to_ascii_lowercase())
}

fn parse_envelope(value: &str) -> Option<FieldEnvelope> {
    let trimmed = value.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Whether a stored column value is a field envelope.
#[must_use]
pub fn is_encrypted(value: Option<&str>) -> bool {
    value.and_then(parse_envelope).is_some()
}

/// DEK rotation, versioned field encryption, and table re-encryption.
pub struct KeyLifecycleManager {
    keys: JsonStore,
    settings: SettingsStore,
    kms: Arc<dyn KmsProvider>,
    rows: Arc<dyn EncryptedTableSource>,
    audit: Arc<AuditTrail>,
}

impl KeyLifecycleManager {
    #[must_use]
    pub fn new(
        keys: JsonStore,
        settings: SettingsStore,
        kms: Arc<dyn KmsProvider>,
        rows: Arc<dyn EncryptedTableSource>,
        audit: Arc<AuditTrail>,
    ) -> Self {
        Self {
            keys,
            settings,
            kms,
            rows,
            audit,
        }
    }

    // ── key material ──────────────────────────────────────────────────

    async fn load_key(&self, name: &str) -> Result<Option<EncryptionKey>, DekError> {
        let Some(stored) = self.keys.get::<StoredDek>(&format!("{KEY_PREFIX}{name}")).await? else {
            return Ok(None);
        };
        let wrapped = crypto::decode_b64("wrapped", &stored.wrapped)?;
        let iv = crypto::decode_b64("iv", &stored.iv)?;
        let mut raw = self.kms.unwrap_key(&stored.kms_key, &wrapped, &iv).await?;
        let key = EncryptionKey::from_slice(&raw);
        raw.zeroize();
        Ok(Some(key?))
    }

    async fn wrap(&self, key: &EncryptionKey) -> Result<StoredDek, DekError> {
        let wrapped = self.kms.wrap_key(DEK_WRAP_KEY, key.as_bytes()).await?;
        Ok(StoredDek {
            wrapped: crypto::encode_b64(&wrapped.wrapped),
            iv: crypto::encode_b64(&wrapped.iv),
            kms_key: wrapped.key_name,
            created_at: Utc::now(),
        })
    }

    async fn store_key(&self, name: &str, key: &EncryptionKey) -> Result<(), DekError> {
        let stored = self.wrap(key).await?;
        self.keys.put(&format!("{KEY_PREFIX}{name}"), &stored).await?;
        Ok(())
    }

    /// Store only if `name` is free. Archives are never overwritten.
    async fn store_key_once(&self, name: &str, key: &EncryptionKey) -> Result<bool, DekError> {
        let stored = self.wrap(key).await?;
        Ok(self.keys.put_if_absent(&format!("{KEY_PREFIX}{name}"), &stored).await?)
    }

    async fn metadata(&self, purpose: &str) -> Result<Option<DekVersionMetadata>, DekError> {
        Ok(self.settings.get(&version_setting(purpose)).await?)
    }

    async fn current_version(&self, purpose: &str) -> Result<u32, DekError> {
        Ok(self.metadata(purpose).await?.map_or(1, |m| m.current_version))
    }

    /// Highest archived version suffix for the purpose.
    async fn highest_archive(&self, purpose: &str) -> Result<Option<u32>, DekError> {
        let prefix = format!("{KEY_PREFIX}{}-v", dek_name(purpose));
        Ok(self
            .keys
            .list(&prefix)
            .await?
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix)?.parse::<u32>().ok())
            .max())
    }

    /// Every available DEK for the purpose keyed by version.
    async fn all_keys(&self, purpose: &str) -> Result<(u32, BTreeMap<u32, EncryptionKey>), DekError> {
        let current_version = self.current_version(purpose).await?;
        let mut keys = BTreeMap::new();
        if let Some(current) = self.load_key(&dek_name(purpose)).await? {
            keys.insert(current_version, current);
        }
        for v in 1..current_version {
            if let Some(old) = self.load_key(&archive_name(purpose, v)).await? {
                keys.insert(v, old);
            }
        }
        Ok((current_version, keys))
    }

    /// Current DEK, creating version 1 on first use.
    async fn current_key(&self, purpose: &str) -> Result<(u32, EncryptionKey), DekError> {
        let name = dek_name(purpose);
        if let Some(key) = self.load_key(&name).await? {
            return Ok((self.current_version(purpose).await?, key));
        }
        let fresh = EncryptionKey::generate();
        if self.store_key_once(&name, &fresh).await? {
            info!(purpose = %purpose, "created initial DEK");
            return Ok((self.current_version(purpose).await?, fresh));
        }
        let key = self
            .load_key(&name)
            .await?
            .ok_or_else(|| DekError::KeyNotFound { name: name.clone() })?;
        Ok((self.current_version(purpose).await?, key))
    }

    // ── rotation ──────────────────────────────────────────────────────

    /// Archive the current DEK and install a fresh one.
    ///
    /// Failures after validation are reported in the result with
    /// `success: false` and still audited.
    ///
    /// # Errors
    ///
    /// Returns [`DekError::InvalidArgument`] for an empty or malformed purpose.
    pub async fn rotate_dek(&self, purpose: &str) -> Result<DekRotationResult, DekError> {
        let purpose = normalize_purpose(purpose)?;
        match self.try_rotate(&purpose).await {
            Ok((previous, next)) => {
                info!(purpose = %purpose, from = previous, to = next, "rotated DEK");
                Ok(DekRotationResult {
                    success: true,
                    purpose,
                    new_version: next,
                    previous_version: Some(previous),
                    error: None,
                })
            }
            Err(e) => {
                error!(purpose = %purpose, error = %e, "DEK rotation failed");
                let entry = AuditEntry::new("dek.rotate", "DEK")
                    .entity(purpose.clone())
                    .details(serde_json::json!({ "success": false, "error": e.to_string() }));
                if let Err(audit_err) = self.audit.record(entry).await {
                    error!(purpose = %purpose, error = %audit_err, "failed to audit DEK rotation failure");
                }
                Ok(DekRotationResult {
                    success: false,
                    purpose,
                    new_version: 0,
                    previous_version: None,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    async fn try_rotate(&self, purpose: &str) -> Result<(u32, u32), DekError> {
        let name = dek_name(purpose);
        let mut current_version = self.current_version(purpose).await?;
        let current = self.load_key(&name).await?;

        if let (Some(current), Some(highest)) = (&current, self.highest_archive(purpose).await?) {
            if highest >= current_version {
                let archived = self.load_key(&archive_name(purpose, highest)).await?;
                let same = archived.is_some_and(|a| bool::from(a.as_bytes().ct_eq(current.as_bytes())));
                let recovered = if same { highest } else { highest.saturating_add(1) };
                warn!(
                    purpose = %purpose,
                    metadata_version = current_version,
                    recovered_version = recovered,
                    "DEK metadata behind archives, recovering version"
                );
                current_version = recovered;
            }
        }

        if let Some(current) = &current {
            let archive = archive_name(purpose, current_version);
            if self.store_key_once(&archive, current).await? {
                info!(dek = %name, version = current_version, "archived DEK");
            }
        }

        let next_version = current_version.saturating_add(1);
        self.store_key(&name, &EncryptionKey::generate()).await?;

        let meta = DekVersionMetadata {
            current_version: next_version,
            rotated_at: Some(Utc::now()),
            old_versions_kept: current_version,
        };
        self.settings.set(&version_setting(purpose), &meta).await?;

        self.audit
            .record(
                AuditEntry::new("dek.rotate", "DEK")
                    .entity(purpose.to_owned())
                    .details(serde_json::json!({
                        "previousVersion": current_version,
                        "newVersion": next_version,
                    })),
            )
            .await?;
        Ok((current_version, next_version))
    }

    /// Version metadata, or `None` if the purpose has no DEK at all.
    ///
    /// # Errors
    ///
    /// Returns a store or KMS error.
    pub async fn dek_version_info(&self, purpose: &str) -> Result<Option<DekVersionInfo>, DekError> {
        let purpose = normalize_purpose(purpose)?;
        if let Some(meta) = self.metadata(&purpose).await? {
            return Ok(Some(DekVersionInfo {
                purpose,
                current_version: meta.current_version,
                last_rotated_at: meta.rotated_at,
                old_versions_kept: meta.old_versions_kept,
            }));
        }
        let exists = self.keys.get::<StoredDek>(&format!("{KEY_PREFIX}{}", dek_name(&purpose))).await?.is_some();
        Ok(exists.then(|| DekVersionInfo {
            purpose,
            current_version: 1,
            last_rotated_at: None,
            old_versions_kept: 0,
        }))
    }

    // ── field encryption ──────────────────────────────────────────────

    /// Encrypt a column value under the current DEK for `purpose`.
    ///
    /// # Errors
    ///
    /// Returns a KMS, store, or crypto error.
    pub async fn encrypt_field(&self, purpose: &str, plaintext: &str) -> Result<String, DekError> {
        let purpose = normalize_purpose(purpose)?;
        let (version, key) = self.current_key(&purpose).await?;
        Self::seal_field(&key, version, plaintext)
    }

    fn seal_field(key: &EncryptionKey, version: u32, plaintext: &str) -> Result<String, DekError> {
        let sealed = crypto::encrypt(key, plaintext.as_bytes())?;
        let envelope = FieldEnvelope {
            c: sealed.ciphertext_b64(),
            iv: sealed.nonce_b64(),
            v: Some(version),
        };
        serde_json::to_string(&envelope).map_err(|e| DekError::MalformedEnvelope { reason: e.to_string() })
    }

    /// Decrypt a column value produced by [`encrypt_field`](Self::encrypt_field).
    ///
    /// # Errors
    ///
    /// Returns [`DekError::MalformedEnvelope`] if `value` is not an envelope
    /// and [`DekError::Crypto`] if no DEK version authenticates it.
    pub async fn decrypt_field(&self, purpose: &str, value: &str) -> Result<String, DekError> {
        let purpose = normalize_purpose(purpose)?;
        let envelope = parse_envelope(value).ok_or_else(|| DekError::MalformedEnvelope {
            reason: "value is not a field envelope".to_owned(),
        })?;
        let (_, keys) = self.all_keys(&purpose).await?;
        Self::open_field(&keys, &envelope)
    }

    /// Try the labelled version first, then every other version newest first.
    fn open_field(keys: &BTreeMap<u32, EncryptionKey>, envelope: &FieldEnvelope) -> Result<String, DekError> {
        let labelled = envelope.v.and_then(|v| keys.get(&v));
        let others = keys.iter().rev().filter(|(v, _)| Some(**v) != envelope.v).map(|(_, k)| k);
        let mut last = None;
        for key in labelled.into_iter().chain(others) {
            match crypto::decrypt_b64(key, &envelope.c, &envelope.iv) {
                Ok(plain) => {
                    return String::from_utf8(plain).map_err(|e| DekError::MalformedEnvelope {
                        reason: format!("plaintext is not UTF-8: {e}"),
                    });
                }
                Err(e) => last = Some(e),
            }
        }
        match last {
            Some(e) => Err(DekError::Crypto(e)),
            None => Err(DekError::KeyNotFound {
                name: "no DEK versions available".to_owned(),
            }),
        }
    }

    // ── encryption configs ────────────────────────────────────────────

    /// Create or replace the encryption config for a table and purpose.
    ///
    /// # Errors
    ///
    /// Returns [`DekError::InvalidArgument`] for empty names or no fields.
    pub async fn configure_table(
        &self,
        table: &str,
        purpose: &str,
        fields: &[&str],
        enabled: bool,
    ) -> Result<EncryptionConfig, DekError> {
        let purpose = normalize_purpose(purpose)?;
        if table.trim().is_empty() || fields.is_empty() || fields.iter().any(|f| f.trim().is_empty()) {
            return Err(DekError::InvalidArgument {
                reason: "table name and at least one field are required".to_owned(),
            });
        }
        let config = EncryptionConfig {
            table_name: table.trim().to_owned(),
            dek_purpose: purpose.clone(),
            encrypted_fields: fields.iter().map(|f| f.trim().to_owned()).collect(),
            enabled,
            updated_at: Utc::now(),
        };
        self.keys.put(&config_key(&config.table_name, &purpose), &config).await?;
        self.audit
            .record(
                AuditEntry::new("encryption.config.update", "Table")
                    .entity(config.table_name.clone())
                    .details(serde_json::json!({
                        "dekPurpose": purpose,
                        "fields": config.encrypted_fields,
                        "enabled": enabled,
                    })),
            )
            .await?;
        Ok(config)
    }

    /// Every stored encryption config.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn encryption_configs(&self) -> Result<Vec<EncryptionConfig>, DekError> {
        Ok(self.keys.scan(CONFIG_PREFIX).await?)
    }

    // ── re-encryption ─────────────────────────────────────────────────

    /// Move every field envelope of `table` below the current DEK version
    /// onto the current DEK, reading `batch_size` rows at a time.
    ///
    /// Rows that are not envelopes or already current are skipped. A row
    /// that fails is counted and the run continues. When `cancel` flips to
    /// `true` the run stops before the next row and reports `cancelled`.
    /// An audit entry is written on every path, including the no-config one.
    ///
    /// # Errors
    ///
    /// Returns [`DekError::InvalidArgument`] for empty names or a zero batch.
    pub async fn re_encrypt_table(
        &self,
        table: &str,
        purpose: &str,
        batch_size: usize,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<ReEncryptionResult, DekError> {
        let purpose = normalize_purpose(purpose)?;
        if table.trim().is_empty() || batch_size == 0 {
            return Err(DekError::InvalidArgument {
                reason: "table name and a positive batch size are required".to_owned(),
            });
        }

        let started = Instant::now();
        let mut result = ReEncryptionResult {
            table: table.to_owned(),
            ..ReEncryptionResult::default()
        };

        let config = match self.keys.get::<EncryptionConfig>(&config_key(table, &purpose)).await {
            Ok(config) => config.filter(|c| c.enabled),
            Err(e) => {
                result.error = Some(e.to_string());
                None
            }
        };

        match config {
            Some(config) => {
                if let Err(e) = self.run_re_encryption(&config, batch_size, cancel, &mut result).await {
                    error!(table = %table, error = %e, "re-encryption failed");
                    result.failed = result.failed.saturating_add(1);
                    result.error = Some(e.to_string());
                }
            }
            None if result.error.is_none() => {
                warn!(table = %table, purpose = %purpose, "no enabled encryption config for table");
            }
            None => {}
        }

        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let entry = AuditEntry::new("dek.reencrypt", "Table")
            .entity(table.to_owned())
            .details(serde_json::json!({
                "dekPurpose": purpose,
                "totalRows": result.total_rows,
                "reEncrypted": result.re_encrypted,
                "failed": result.failed,
                "skipped": result.skipped,
                "cancelled": result.cancelled,
                "error": result.error,
                "durationMs": result.duration_ms,
            }));
        if let Err(e) = self.audit.record(entry).await {
            error!(table = %table, error = %e, "failed to audit re-encryption");
            result.error.get_or_insert_with(|| e.to_string());
        }

        info!(
            table = %table,
            total = result.total_rows,
            re_encrypted = result.re_encrypted,
            failed = result.failed,
            skipped = result.skipped,
            cancelled = result.cancelled,
            "re-encryption finished"
        );
        Ok(result)
    }

    async fn run_re_encryption(
        &self,
        config: &EncryptionConfig,
        batch_size: usize,
        cancel: Option<&watch::Receiver<bool>>,
        result: &mut ReEncryptionResult,
    ) -> Result<(), DekError> {
        let purpose = &config.dek_purpose;
        let (current_version, keys) = self.all_keys(purpose).await?;
        let current = keys.get(&current_version).ok_or_else(|| DekError::KeyNotFound {
            name: dek_name(purpose),
        })?;

        for field in &config.encrypted_fields {
            let mut cursor = None;
            loop {
                let page = self
                    .rows
                    .read_page(&config.table_name, field, cursor, batch_size)
                    .await?;
                let Some(last) = page.last() else { break };
                cursor = Some(last.id);
                let page_len = page.len();

                for row in page {
                    if cancel.is_some_and(|c| *c.borrow()) {
                        result.cancelled = true;
                        return Ok(());
                    }
                    result.total_rows = result.total_rows.saturating_add(1);

                    let Some(envelope) = row.value.as_deref().and_then(parse_envelope) else {
                        result.skipped = result.skipped.saturating_add(1);
                        continue;
                    };
                    if envelope.v == Some(current_version) {
                        result.skipped = result.skipped.saturating_add(1);
                        continue;
                    }

                    let outcome = match Self::open_field(&keys, &envelope) {
                        Ok(plain) => match Self::seal_field(current, current_version, &plain) {
                            Ok(sealed) => {
                                self.rows
                                    .update_field(&config.table_name, field, row.id, &sealed)
                                    .await
                            }
                            Err(e) => Err(e),
                        },
                        Err(e) => Err(e),
                    };
                    match outcome {
                        Ok(()) => result.re_encrypted = result.re_encrypted.saturating_add(1),
                        Err(e) => {
                            result.failed = result.failed.saturating_add(1);
                            warn!(
                                table = %config.table_name,
                                field = %field,
                                row = %row.id,
                                error = %e,
                                "failed to re-encrypt row"
                            );
                        }
                    }
                }

                if page_len < batch_size {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Re-encryption status for every enabled config.
    ///
    /// # Errors
    ///
    /// Returns a store or row source error.
    pub async fn re_encryption_progress(&self) -> Result<Vec<ReEncryptionProgress>, DekError> {
        let mut out = Vec::new();
        for config in self.encryption_configs().await?.into_iter().filter(|c| c.enabled) {
            let current_version = self.current_version(&config.dek_purpose).await?;
            let mut total = 0usize;
            let mut encrypted = 0usize;
            let mut on_current = 0usize;

            for field in &config.encrypted_fields {
                let mut cursor = None;
                loop {
                    let page = self
                        .rows
                        .read_page(&config.table_name, field, cursor, DEFAULT_BATCH_SIZE)
                        .await?;
                    let Some(last) = page.last() else { break };
                    cursor = Some(last.id);
                    for row in &page {
                        total = total.saturating_add(1);
                        if let Some(env) = row.value.as_deref().and_then(parse_envelope) {
                            encrypted = encrypted.saturating_add(1);
                            if env.v == Some(current_version) {
                                on_current = on_current.saturating_add(1);
                            }
                        }
                    }
                    if page.len() < DEFAULT_BATCH_SIZE {
                        break;
                    }
                }
            }

            out.push(ReEncryptionProgress {
                table: config.table_name,
                purpose: config.dek_purpose,
                total_rows: total,
                encrypted_rows: encrypted,
                current_version_rows: on_current,
                current_version,
                is_complete: on_current == encrypted,
            });
        }
        Ok(out)
    }
}

impl fmt::Debug for KeyLifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLifecycleManager").finish_non_exhaustive()
    }
}
