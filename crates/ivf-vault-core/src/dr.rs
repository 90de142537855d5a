//! Encrypted backup and restore of vault state.
//!
//! A backup is a point-in-time copy of the records a fresh vault needs to
//! serve the same secrets again:
//! - secret versions, still sealed under the KEK;
//! - policies and assignments;
//! - settings, which carry the wrapped KEK and unseal material;
//! - DEK versions and table encryption configs.
//!
//! Leases, tokens, dynamic credentials and the audit trail stay behind.
//!
//! The snapshot is JSON sealed with AES-256-GCM under a key derived from an
//! operator password with Argon2id. Layout:
//!
//! `"IVFVB1" | m_cost u32le | t_cost u32le | p_cost u32le | salt (16) | nonce (12) | ciphertext+tag`
//!
//! The header feeds the key derivation, so altering it fails decryption
//! like any other tampering. Restore only adds records that are absent;
//! it never overwrites live state.

use std::fmt;
use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use chrono::{DateTime, Utc};
use ivf_vault_storage::StorageBackend;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::audit::{AuditEntry, AuditTrail};
use crate::crypto::{self, EncryptionKey, KEY_LEN, NONCE_LEN};
use crate::error::{CryptoError, DrError, StoreError};
use crate::policy::PolicyEngine;
use crate::siem::{EventPublisher, SecurityEvent, Severity};
use crate::store::SettingsStore;
use crate::unseal::UnsealOrchestrator;

/// Setting holding the time of the last successful backup.
pub const LAST_BACKUP_SETTING: &str = "vault-last-backup-at";

/// Event published after every backup.
pub const BACKUP_CREATED_EVENT: &str = "vault.backup.created";

const MAGIC: &[u8] = b"IVFVB1";
const SALT_LEN: usize = 16;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = MAGIC.len() + 12 + SALT_LEN + NONCE_LEN;
const SOURCE: &str = "DisasterRecovery";

/// Ceilings on the cost read from a backup header.
const MAX_MEMORY_KIB: u32 = 1 << 20;
const MAX_ITERATIONS: u32 = 16;
const MAX_LANES: u32 = 16;

// ── model ────────────────────────────────────────────────────────────

/// Record group in a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Secrets,
    Policies,
    Settings,
    EncryptionConfigs,
}

impl Section {
    pub const ALL: [Self; 4] = [Self::Secrets, Self::Policies, Self::Settings, Self::EncryptionConfigs];

    /// Storage prefixes exported for this section.
    #[must_use]
    pub fn prefixes(self) -> &'static [&'static str] {
        match self {
            Self::Secrets => &["secrets/"],
            Self::Policies => &["sys/policies/", "sys/policies-deleted/", "sys/user-policies/"],
            Self::Settings => &["sys/settings/"],
            Self::EncryptionConfigs => &["sys/encryption-configs/", "sys/keys/"],
        }
    }

    fn owns(self, key: &str) -> bool {
        self.prefixes().iter().any(|p| key.starts_with(p) && key.len() > p.len())
    }
}

/// Records per section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionCounts {
    pub secrets: usize,
    pub policies: usize,
    pub settings: usize,
    pub encryption_configs: usize,
}

impl SectionCounts {
    fn bump(&mut self, section: Section) {
        match section {
            Section::Secrets => self.secrets += 1,
            Section::Policies => self.policies += 1,
            Section::Settings => self.settings += 1,
            Section::EncryptionConfigs => self.encryption_configs += 1,
        }
    }
}

/// Argon2id cost used to derive the backup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfCost {
    pub memory_kib: u32,
    pub iterations: u32,
    pub lanes: u32,
}

impl Default for KdfCost {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            lanes: Params::DEFAULT_P_COST,
        }
    }
}

impl KdfCost {
    fn params(self) -> Result<Params, DrError> {
        if self.memory_kib > MAX_MEMORY_KIB || self.iterations > MAX_ITERATIONS || self.lanes > MAX_LANES {
            return Err(DrError::InvalidArgument {
                reason: format!("key derivation cost {self:?} exceeds the supported maximum"),
            });
        }
        Params::new(self.memory_kib, self.iterations, self.lanes, Some(KEY_LEN)).map_err(|e| DrError::InvalidArgument {
            reason: format!("key derivation cost {self:?} rejected: {e}"),
        })
    }
}

/// A sealed backup and what went into it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupResult {
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub data: Vec<u8>,
    pub counts: SectionCounts,
    /// Hex SHA-256 of the plaintext snapshot.
    pub integrity_hash: String,
}

impl fmt::Debug for BackupResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupResult")
            .field("backup_id", &self.backup_id)
            .field("created_at", &self.created_at)
            .field("bytes", &self.data.len())
            .field("counts", &self.counts)
            .finish_non_exhaustive()
    }
}

/// Records a restore added. Records already present are skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreResult {
    pub backup_id: String,
    pub restored: SectionCounts,
    pub skipped: usize,
}

/// Outcome of opening a backup without applying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupValidation {
    pub valid: bool,
    pub error: Option<String>,
    pub backup_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub counts: Option<SectionCounts>,
    pub integrity_hash: Option<String>,
}

/// How ready the vault is to be rebuilt from a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrReadiness {
    pub auto_unseal_configured: bool,
    pub encryption_configured: bool,
    pub secret_versions: usize,
    pub policies: usize,
    pub last_backup_at: Option<DateTime<Utc>>,
    /// `A` when every check passes, down to `F`.
    pub grade: String,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    backup_id: String,
    created_at: DateTime<Utc>,
    records: Vec<SnapshotRecord>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotRecord {
    section: Section,
    key: String,
    /// Base64 of the stored bytes.
    value: String,
}

impl Snapshot {
    fn counts(&self) -> SectionCounts {
        let mut counts = SectionCounts::default();
        for record in &self.records {
            counts.bump(record.section);
        }
        counts
    }
}

// ── sealing ──────────────────────────────────────────────────────────

fn derive_backup_key(password: &str, salt: &[u8], params: Params) -> Result<EncryptionKey, CryptoError> {
    let mut out = [0u8; KEY_LEN];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(password.as_bytes(), salt, &mut out)
        .map_err(|e| CryptoError::KeyDerivation {
            context: "backup".to_owned(),
            reason: e.to_string(),
        })?;
    let key = EncryptionKey::from_bytes(out);
    out.zeroize();
    Ok(key)
}

fn seal_snapshot(plaintext: &[u8], password: &str, cost: KdfCost) -> Result<Vec<u8>, DrError> {
    let params = cost.params()?;
    let salt = crypto::random_bytes(SALT_LEN);
    let key = derive_backup_key(password, &salt, params)?;
    let sealed = crypto::encrypt(&key, plaintext)?;

    let mut out = Vec::with_capacity(HEADER_LEN + sealed.ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&cost.memory_kib.to_le_bytes());
    out.extend_from_slice(&cost.iterations.to_le_bytes());
    out.extend_from_slice(&cost.lanes.to_le_bytes());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&sealed.nonce);
    out.extend_from_slice(&sealed.ciphertext);
    Ok(out)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(word)
}

fn corrupt(reason: impl Into<String>) -> DrError {
    DrError::Corrupt { reason: reason.into() }
}

fn open_snapshot(data: &[u8], password: &str) -> Result<(Snapshot, Vec<u8>), DrError> {
    if data.len() < HEADER_LEN + TAG_LEN || !data.starts_with(MAGIC) {
        return Err(corrupt("not an ivf-vault backup"));
    }
    let mut at = MAGIC.len();
    let cost = KdfCost {
        memory_kib: read_u32(data, at),
        iterations: read_u32(data, at + 4),
        lanes: read_u32(data, at + 8),
    };
    at += 12;
    let params = cost.params().map_err(|e| corrupt(e.to_string()))?;
    let salt = &data[at..at + SALT_LEN];
    at += SALT_LEN;
    let nonce = &data[at..at + NONCE_LEN];
    at += NONCE_LEN;

    let key = derive_backup_key(password, salt, params)?;
    let plaintext = crypto::decrypt(&key, &data[at..], nonce)
        .map_err(|_| corrupt("wrong password or corrupted backup data"))?;
    let snapshot: Snapshot =
        serde_json::from_slice(&plaintext).map_err(|e| corrupt(format!("snapshot is not valid JSON: {e}")))?;
    Ok((snapshot, plaintext))
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn require_password(password: &str) -> Result<(), DrError> {
    if password.is_empty() {
        return Err(DrError::InvalidArgument {
            reason: "backup password must not be empty".to_owned(),
        });
    }
    Ok(())
}

// ── service ──────────────────────────────────────────────────────────

/// Backup, restore, and readiness reporting.
pub struct DisasterRecovery {
    storage: Arc<dyn StorageBackend>,
    settings: SettingsStore,
    policies: Arc<PolicyEngine>,
    unseal: Arc<UnsealOrchestrator>,
    events: Arc<dyn EventPublisher>,
    audit: Arc<AuditTrail>,
    cost: KdfCost,
}

impl DisasterRecovery {
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        policies: Arc<PolicyEngine>,
        unseal: Arc<UnsealOrchestrator>,
        events: Arc<dyn EventPublisher>,
        audit: Arc<AuditTrail>,
    ) -> Self {
        Self {
            settings: SettingsStore::new(storage.clone()),
            storage,
            policies,
            unseal,
            events,
            audit,
            cost: KdfCost::default(),
        }
    }

    /// Argon2id cost for new backups. Restores read the cost from the blob.
    #[must_use]
    pub fn with_kdf_cost(mut self, cost: KdfCost) -> Self {
        self.cost = cost;
        self
    }

    /// Export vault state as an encrypted blob.
    ///
    /// # Errors
    ///
    /// - [`DrError::InvalidArgument`] for an empty password or bad cost.
    /// - [`DrError::Store`] if records cannot be read or the timestamp saved.
    pub async fn backup(&self, password: &str, user_id: Option<&str>) -> Result<BackupResult, DrError> {
        require_password(password)?;
        let created_at = Utc::now();
        let backup_id = format!("vault-backup-{}", created_at.format("%Y%m%d-%H%M%S"));

        let mut records = Vec::new();
        for section in Section::ALL {
            for prefix in section.prefixes() {
                let keys = self.storage.list(prefix).await.map_err(StoreError::from)?;
                for key in keys {
                    if let Some(bytes) = self.storage.get(&key).await.map_err(StoreError::from)? {
                        records.push(SnapshotRecord {
                            section,
                            value: crypto::encode_b64(&bytes),
                            key,
                        });
                    }
                }
            }
        }
        let snapshot = Snapshot {
            backup_id,
            created_at,
            records,
        };
        let counts = snapshot.counts();

        let mut plaintext = serde_json::to_vec(&snapshot).map_err(|e| StoreError::Serialization {
            key: snapshot.backup_id.clone(),
            reason: e.to_string(),
        })?;
        let integrity_hash = sha256_hex(&plaintext);
        let sealed = seal_snapshot(&plaintext, password, self.cost);
        plaintext.zeroize();
        let data = sealed?;

        self.settings.set(LAST_BACKUP_SETTING, &created_at).await?;
        self.audit
            .record(
                AuditEntry::new("vault.backup.created", "VaultBackup")
                    .entity(snapshot.backup_id.clone())
                    .user(user_id)
                    .details(serde_json::json!({ "counts": counts, "integrityHash": integrity_hash })),
            )
            .await?;
        self.events
            .publish(
                SecurityEvent::new(BACKUP_CREATED_EVENT, Severity::Info, SOURCE)
                    .action("backup.create")
                    .user(user_id)
                    .resource("VaultBackup", snapshot.backup_id.clone())
                    .outcome("success")
                    .reason(format!(
                        "Exported {} secret records, {} policy records",
                        counts.secrets, counts.policies
                    )),
            )
            .await;
        info!(backup_id = %snapshot.backup_id, bytes = data.len(), ?counts, "vault backup created");

        Ok(BackupResult {
            backup_id: snapshot.backup_id,
            created_at,
            data,
            counts,
            integrity_hash,
        })
    }

    /// Add every record from `data` that is not already present.
    ///
    /// Nothing is written unless the whole blob opens and every record
    /// belongs to its section.
    ///
    /// # Errors
    ///
    /// - [`DrError::Corrupt`] for a wrong password, tampered or foreign data.
    /// - [`DrError::Store`] if a record cannot be written.
    pub async fn restore(&self, data: &[u8], password: &str, user_id: Option<&str>) -> Result<RestoreResult, DrError> {
        require_password(password)?;
        let (snapshot, mut plaintext) = open_snapshot(data, password)?;
        plaintext.zeroize();

        let mut decoded = Vec::with_capacity(snapshot.records.len());
        for record in &snapshot.records {
            if !record.section.owns(&record.key) {
                return Err(corrupt(format!("record '{}' is outside its section", record.key)));
            }
            let bytes = crypto::decode_b64("value", &record.value).map_err(|e| corrupt(e.to_string()))?;
            decoded.push((record.section, record.key.as_str(), bytes));
        }

        let mut restored = SectionCounts::default();
        let mut skipped = 0;
        for (section, key, bytes) in decoded {
            if self.storage.put_if_absent(key, &bytes).await.map_err(StoreError::from)? {
                restored.bump(section);
            } else {
                skipped += 1;
            }
        }

        self.audit
            .record(
                AuditEntry::new("vault.backup.restored", "VaultBackup")
                    .entity(snapshot.backup_id.clone())
                    .user(user_id)
                    .details(serde_json::json!({ "restored": restored, "skipped": skipped })),
            )
            .await?;
        info!(backup_id = %snapshot.backup_id, ?restored, skipped, "vault backup restored");

        Ok(RestoreResult {
            backup_id: snapshot.backup_id,
            restored,
            skipped,
        })
    }

    /// Open `data` and report what it holds, without writing anything.
    #[must_use]
    pub fn validate_backup(&self, data: &[u8], password: &str) -> BackupValidation {
        match open_snapshot(data, password) {
            Ok((snapshot, mut plaintext)) => {
                let integrity_hash = sha256_hex(&plaintext);
                plaintext.zeroize();
                BackupValidation {
                    valid: true,
                    error: None,
                    counts: Some(snapshot.counts()),
                    backup_id: Some(snapshot.backup_id),
                    created_at: Some(snapshot.created_at),
                    integrity_hash: Some(integrity_hash),
                }
            }
            Err(e) => {
                warn!(error = %e, "backup validation failed");
                BackupValidation {
                    valid: false,
                    error: Some(e.to_string()),
                    backup_id: None,
                    created_at: None,
                    counts: None,
                    integrity_hash: None,
                }
            }
        }
    }

    /// Grade the vault's recoverability.
    ///
    /// # Errors
    ///
    /// Returns a store, policy or unseal error if state cannot be read.
    pub async fn readiness(&self) -> Result<DrReadiness, DrError> {
        let auto_unseal_configured = !self.unseal.providers().await?.is_empty();
        let encryption_configured = !self
            .storage
            .list(Section::EncryptionConfigs.prefixes()[0])
            .await
            .map_err(StoreError::from)?
            .is_empty();
        let secret_versions = self
            .storage
            .list("secrets/data/")
            .await
            .map_err(StoreError::from)?
            .len();
        let policies = self.policies.list().await?.len();
        let last_backup_at = self.settings.get::<DateTime<Utc>>(LAST_BACKUP_SETTING).await?;

        let passed = [
            auto_unseal_configured,
            encryption_configured,
            secret_versions > 0,
            policies > 0,
            last_backup_at.is_some(),
        ]
        .into_iter()
        .filter(|ok| *ok)
        .count();
        let grade = match passed {
            5 => "A",
            4 => "B",
            3 => "C",
            2 => "D",
            _ => "F",
        };

        Ok(DrReadiness {
            auto_unseal_configured,
            encryption_configured,
            secret_versions,
            policies,
            last_backup_at,
            grade: grade.to_owned(),
        })
    }
}

impl fmt::Debug for DisasterRecovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisasterRecovery")
            .field("cost", &self.cost)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::kms::LocalKms;
    use crate::siem::RecordingEventPublisher;
    use crate::{Vault, VaultOptions};
    use ivf_vault_storage::MemoryBackend;

    const CHEAP: KdfCost = KdfCost {
        memory_kib: 64,
        iterations: 1,
        lanes: 1,
    };

    struct Node {
        vault: Vault,
        dr: DisasterRecovery,
        events: Arc<RecordingEventPublisher>,
    }

    fn node(root: &EncryptionKey) -> Node {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let kms = Arc::new(LocalKms::new(
            SettingsStore::new(storage.clone()),
            EncryptionKey::from_bytes(*root.as_bytes()),
        ));
        let events = Arc::new(RecordingEventPublisher::new());
        let vault = Vault::new(storage.clone(), VaultOptions::new(kms).events(events.clone()));
        let dr = DisasterRecovery::new(
            storage,
            vault.policies.clone(),
            vault.unseal.clone(),
            vault.events.clone(),
            vault.audit.clone(),
        )
        .with_kdf_cost(CHEAP);
        Node { vault, dr, events }
    }

    async fn populated(root: &EncryptionKey) -> Node {
        let n = node(root);
        n.vault.secrets.put("config/api", "s3cr3t", Some("u1"), None).await.unwrap();
        n.vault
            .policies
            .create("readers", "config/*", &["read"], None, None)
            .await
            .unwrap();
        n.vault
            .keys
            .configure_table("patients", "patient", &["ssn"], true)
            .await
            .unwrap();
        n
    }

    #[tokio::test]
    async fn backup_restores_into_empty_vault() {
        let root = EncryptionKey::generate();
        let source = populated(&root).await;
        let backup = source.dr.backup("correct horse", Some("admin")).await.unwrap();
        assert!(backup.counts.secrets > 0);
        assert_eq!(backup.counts.policies, 1);
        assert!(backup.counts.encryption_configs > 0);
        assert!(!backup.data.windows(6).any(|w| w == b"s3cr3t"));

        let target = node(&root);
        let restored = target.dr.restore(&backup.data, "correct horse", None).await.unwrap();
        assert_eq!(restored.backup_id, backup.backup_id);
        assert_eq!(restored.restored.secrets, backup.counts.secrets);
        assert_eq!(restored.skipped, 0);

        let secret = target.vault.secrets.get("config/api", None).await.unwrap();
        assert_eq!(secret.value, "s3cr3t");
        assert!(target.vault.policies.get("readers").await.unwrap().is_some());
        assert_eq!(target.vault.keys.encryption_configs().await.unwrap().len(), 1);

        let audit = target.vault.audit.recent(10, Some("vault.backup.")).await.unwrap();
        assert_eq!(audit[0].action, "vault.backup.restored");
    }

    #[tokio::test]
    async fn restore_skips_existing_records() {
        let root = EncryptionKey::generate();
        let n = populated(&root).await;
        let backup = n.dr.backup("pw", None).await.unwrap();
        n.vault.secrets.put("config/api", "newer", None, None).await.unwrap();

        let restored = n.dr.restore(&backup.data, "pw", None).await.unwrap();
        assert_eq!(restored.restored, SectionCounts::default());
        assert!(restored.skipped > 0);
        assert_eq!(n.vault.secrets.get("config/api", None).await.unwrap().value, "newer");
    }

    #[tokio::test]
    async fn tampered_backup_is_rejected() {
        let root = EncryptionKey::generate();
        let source = populated(&root).await;
        let backup = source.dr.backup("pw", None).await.unwrap();
        let target = node(&root);

        for at in [MAGIC.len(), HEADER_LEN - 1, backup.data.len() / 2, backup.data.len() - 1] {
            let mut bad = backup.data.clone();
            bad[at] ^= 0x01;
            assert!(
                matches!(target.dr.restore(&bad, "pw", None).await, Err(DrError::Corrupt { .. })),
                "byte {at}"
            );
            assert!(!target.dr.validate_backup(&bad, "pw").valid);
        }
        assert!(matches!(
            target.dr.restore(&backup.data[..HEADER_LEN], "pw", None).await,
            Err(DrError::Corrupt { .. })
        ));
        assert!(target.vault.secrets.get("config/api", None).await.is_err());
    }

    #[tokio::test]
    async fn wrong_password_fails_validation() {
        let root = EncryptionKey::generate();
        let n = populated(&root).await;
        let backup = n.dr.backup("pw", None).await.unwrap();

        let bad = n.dr.validate_backup(&backup.data, "other");
        assert!(!bad.valid);
        assert!(bad.error.unwrap().contains("wrong password"));

        let good = n.dr.validate_backup(&backup.data, "pw");
        assert!(good.valid);
        assert_eq!(good.backup_id.as_deref(), Some(backup.backup_id.as_str()));
        assert_eq!(good.integrity_hash.as_deref(), Some(backup.integrity_hash.as_str()));
        assert_eq!(good.counts, Some(backup.counts));
    }

    #[tokio::test]
    async fn backup_publishes_event_and_timestamp() {
        let n = populated(&EncryptionKey::generate()).await;
        assert!(matches!(n.dr.backup("", None).await, Err(DrError::InvalidArgument { .. })));
        let backup = n.dr.backup("pw", Some("admin")).await.unwrap();

        let events = n.events.of_type(BACKUP_CREATED_EVENT).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].resource_id.as_deref(), Some(backup.backup_id.as_str()));
        let stored: Option<DateTime<Utc>> = n.dr.settings.get(LAST_BACKUP_SETTING).await.unwrap();
        assert_eq!(stored, Some(backup.created_at));
    }

    #[tokio::test]
    async fn readiness_grades_configuration() {
        let n = node(&EncryptionKey::generate());
        let empty = n.dr.readiness().await.unwrap();
        assert_eq!(empty.grade, "F");
        assert!(empty.last_backup_at.is_none());

        let n = populated(&EncryptionKey::generate()).await;
        assert_eq!(n.dr.readiness().await.unwrap().grade, "C");
        n.vault.unseal.configure_default("master", None).await.unwrap();
        n.dr.backup("pw", None).await.unwrap();
        let ready = n.dr.readiness().await.unwrap();
        assert_eq!(ready.grade, "A");
        assert!(ready.auto_unseal_configured);
        assert_eq!(ready.policies, 1);
    }

    #[test]
    fn oversized_header_cost_is_corrupt() {
        let mut blob = seal_snapshot(b"{}", "pw", CHEAP).unwrap();
        blob[MAGIC.len()..MAGIC.len() + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(open_snapshot(&blob, "pw"), Err(DrError::Corrupt { .. })));
    }
}
