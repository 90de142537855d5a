//! Versioned secret store with envelope encryption.
//!
//! Each `put` encrypts the value with AES-256-GCM under the KEK from
//! [`KekCache`] and writes a new version record. Versions are allocated as
//! `latest + 1` and written with a create-only insert keyed on
//! `(path, version)`, so two concurrent writers can never land on the same
//! version: the loser re-reads the latest version and tries again.
//!
//! Deletes are soft. Every version of the path gets a `deleted_at` marker and
//! the records stay in storage for audit.
//!
//! Storage layout:
//!
//! - `secrets/data/<path>#<version:010>` → [`SecretRecord`]
//! - `secrets/ids/<uuid>` → `(path, version)` index used by leases

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditTrail};
use crate::crypto;
use crate::error::SecretError;
use crate::kek::KekCache;
use crate::store::JsonStore;

const DATA_PREFIX: &str = "secrets/data/";
const ID_PREFIX: &str = "secrets/ids/";
const VERSION_SEP: char = '#';

/// Versions kept by default, reported in the default metadata.
const DEFAULT_MAX_VERSIONS: u32 = 10;

/// How many times `put` re-reads the latest version after losing a race.
const MAX_PUT_ATTEMPTS: u32 = 16;

/// One stored version of a secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id: Uuid,
    pub path: String,
    pub version: u32,
    /// Base64 ciphertext with appended GCM tag.
    pub encrypted_data: String,
    /// Base64 96-bit nonce.
    pub iv: String,
    pub metadata: Option<serde_json::Value>,
    pub lease_id: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdIndex {
    path: String,
    version: u32,
}

/// A decrypted secret version.
#[derive(Clone)]
pub struct SecretValue {
    pub id: Uuid,
    pub path: String,
    pub version: u32,
    pub value: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretValue")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("version", &self.version)
            .field("value", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Result of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretWrite {
    pub id: Uuid,
    pub path: String,
    pub version: u32,
}

/// Whether a listing entry is a secret or a collapsed folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Secret,
    Folder,
}

/// One row of [`SecretStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretEntry {
    /// Name relative to the listing prefix. Folders end with `/`.
    pub name: String,
    pub kind: EntryKind,
}

/// History row of [`SecretStore::versions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretVersionInfo {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Outcome of a bulk import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportResult {
    pub imported: usize,
    pub failed: usize,
    /// `"<key>: <error>"` for each failed key.
    pub errors: Vec<String>,
}

/// Normalize and validate a secret path.
///
/// # Errors
///
/// Returns [`SecretError::InvalidArgument`] for empty paths, empty or `..`
/// segments, or the reserved `#` character.
pub fn normalize_path(path: &str) -> Result<String, SecretError> {
    let trimmed = path.trim().trim_matches('/');
    let invalid = |reason: &str| SecretError::InvalidArgument {
        reason: reason.to_owned(),
    };
    if trimmed.is_empty() {
        return Err(invalid("path must not be empty"));
    }
    if trimmed.contains(VERSION_SEP) {
        return Err(invalid("path must not contain '#'"));
    }
    if trimmed.split('/').any(|s| s.is_empty() || s == "..") {
        return Err(invalid("path segments must be non-empty and not '..'"));
    }
    Ok(trimmed.to_owned())
}

fn version_key(path: &str, version: u32) -> String {
    format!("{DATA_PREFIX}{path}{VERSION_SEP}{version:010}")
}

fn versions_prefix(path: &str) -> String {
    format!("{DATA_PREFIX}{path}{VERSION_SEP}")
}

/// Split a data key into `(path, version)`.
fn parse_data_key(key: &str) -> Option<(&str, u32)> {
    let rest = key.strip_prefix(DATA_PREFIX)?;
    let (path, version) = rest.rsplit_once(VERSION_SEP)?;
    Some((path, version.parse().ok()?))
}

/// Versioned, envelope-encrypted secret storage.
pub struct SecretStore {
    store: JsonStore,
    kek: Arc<KekCache>,
    audit: Arc<AuditTrail>,
}

impl SecretStore {
    #[must_use]
    pub fn new(store: JsonStore, kek: Arc<KekCache>, audit: Arc<AuditTrail>) -> Self {
        Self { store, kek, audit }
    }

    /// Highest version ever written at `path` (0 if none), deleted or not.
    async fn latest_version(&self, path: &str) -> Result<u32, SecretError> {
        let keys = self.store.list(&versions_prefix(path)).await?;
        Ok(keys
            .iter()
            .filter_map(|k| parse_data_key(k))
            .filter(|(p, _)| *p == path)
            .map(|(_, v)| v)
            .max()
            .unwrap_or(0))
    }

    async fn record(&self, path: &str, version: u32) -> Result<Option<SecretRecord>, SecretError> {
        Ok(self.store.get(&version_key(path, version)).await?)
    }

    async fn decrypt_record(&self, record: SecretRecord) -> Result<SecretValue, SecretError> {
        let kek = self.kek.get().await?;
        let plain = crypto::decrypt_b64(kek, &record.encrypted_data, &record.iv)?;
        let value = String::from_utf8(plain).map_err(|e| SecretError::InvalidArgument {
            reason: format!("stored value is not UTF-8: {e}"),
        })?;
        Ok(SecretValue {
            id: record.id,
            path: record.path,
            version: record.version,
            value,
            metadata: record.metadata,
            created_at: record.created_at,
        })
    }

    /// Write `plaintext` as the next version of `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::InvalidArgument`] for a bad path,
    /// [`SecretError::VersionConflict`] if concurrent writers keep winning,
    /// or a KMS/storage error.
    pub async fn put(
        &self,
        path: &str,
        plaintext: &str,
        user_id: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<SecretWrite, SecretError> {
        let path = normalize_path(path)?;
        let kek = self.kek.get().await?;

        for _ in 0..MAX_PUT_ATTEMPTS {
            let version = self.latest_version(&path).await?.saturating_add(1);
            let sealed = crypto::encrypt(kek, plaintext.as_bytes())?;
            let record = SecretRecord {
                id: Uuid::new_v4(),
                path: path.clone(),
                version,
                encrypted_data: sealed.ciphertext_b64(),
                iv: sealed.nonce_b64(),
                metadata: Some(metadata.clone().unwrap_or_else(|| {
                    serde_json::json!({ "versions": version, "maxVersions": DEFAULT_MAX_VERSIONS })
                })),
                lease_id: None,
                created_by: user_id.map(str::to_owned),
                created_at: Utc::now(),
                deleted_at: None,
            };

            if !self.store.put_if_absent(&version_key(&path, version), &record).await? {
                warn!(path = %path, version, "version taken by concurrent writer, retrying");
                continue;
            }
            self.store
                .put(
                    &format!("{ID_PREFIX}{}", record.id),
                    &IdIndex {
                        path: path.clone(),
                        version,
                    },
                )
                .await?;

            self.audit
                .record(
                    AuditEntry::new("secret.create", "Secret")
                        .entity(path.clone())
                        .user(user_id)
                        .details(serde_json::json!({ "version": version })),
                )
                .await?;
            info!(path = %path, version, "vault secret written");
            return Ok(SecretWrite {
                id: record.id,
                path,
                version,
            });
        }

        Err(SecretError::VersionConflict {
            path,
            attempts: MAX_PUT_ATTEMPTS,
        })
    }

    /// Read a version of `path`, the latest live one by default.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::NotFound`] if the version does not exist or is
    /// soft-deleted, and [`SecretError::Crypto`] if the ciphertext does not
    /// authenticate under the KEK.
    pub async fn get(&self, path: &str, version: Option<u32>) -> Result<SecretValue, SecretError> {
        let path = normalize_path(path)?;
        let not_found = || SecretError::NotFound { path: path.clone() };

        let record = match version {
            Some(v) => self.record(&path, v).await?.filter(|r| r.deleted_at.is_none()),
            None => self.latest_live(&path).await?,
        }
        .ok_or_else(not_found)?;

        self.decrypt_record(record).await
    }

    async fn latest_live(&self, path: &str) -> Result<Option<SecretRecord>, SecretError> {
        let keys = self.store.list(&versions_prefix(path)).await?;
        for key in keys.iter().rev() {
            if parse_data_key(key).is_none_or(|(p, _)| p != path) {
                continue;
            }
            if let Some(record) = self.store.get::<SecretRecord>(key).await? {
                if record.deleted_at.is_none() {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    /// Decrypt the exact version identified by `id`. Soft-deleted or unknown
    /// ids yield `None`.
    ///
    /// # Errors
    ///
    /// Returns a KMS, crypto, or storage error.
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<SecretValue>, SecretError> {
        let Some(index) = self.store.get::<IdIndex>(&format!("{ID_PREFIX}{id}")).await? else {
            return Ok(None);
        };
        match self.record(&index.path, index.version).await? {
            Some(record) if record.deleted_at.is_none() => Ok(Some(self.decrypt_record(record).await?)),
            _ => Ok(None),
        }
    }

    /// Raw stored record for the latest live version, without decrypting.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::NotFound`] if no live version exists.
    pub async fn latest_record(&self, path: &str) -> Result<SecretRecord, SecretError> {
        let path = normalize_path(path)?;
        let latest = self.latest_live(&path).await?;
        latest.ok_or(SecretError::NotFound { path })
    }

    /// Soft-delete every version of `path`. Returns how many versions were
    /// newly marked.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::NotFound`] if the path has no live version.
    pub async fn delete(&self, path: &str, user_id: Option<&str>) -> Result<usize, SecretError> {
        let path = normalize_path(path)?;
        let now = Utc::now();
        let mut marked = 0usize;

        for key in self.store.list(&versions_prefix(&path)).await? {
            if parse_data_key(&key).is_none_or(|(p, _)| p != path) {
                continue;
            }
            let Some(mut record) = self.store.get::<SecretRecord>(&key).await? else {
                continue;
            };
            if record.deleted_at.is_none() {
                record.deleted_at = Some(now);
                self.store.put(&key, &record).await?;
                marked = marked.saturating_add(1);
            }
        }

        if marked == 0 {
            return Err(SecretError::NotFound { path });
        }

        self.audit
            .record(
                AuditEntry::new("secret.delete", "Secret")
                    .entity(path.clone())
                    .user(user_id)
                    .details(serde_json::json!({ "versions": marked })),
            )
            .await?;
        info!(path = %path, versions = marked, "vault secret deleted");
        Ok(marked)
    }

    /// List live secrets under `prefix`. Deeper paths collapse into a single
    /// `folder/` entry per first segment.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<SecretEntry>, SecretError> {
        let prefix = prefix.map(|p| p.trim().trim_end_matches('/')).filter(|p| !p.is_empty());
        let scan = match prefix {
            Some(p) => format!("{DATA_PREFIX}{p}"),
            None => DATA_PREFIX.to_owned(),
        };

        let paths: BTreeSet<String> = self
            .store
            .list(&scan)
            .await?
            .iter()
            .filter_map(|k| parse_data_key(k).map(|(p, _)| p.to_owned()))
            .collect();

        let mut entries = Vec::new();
        let mut folders = BTreeSet::new();
        for path in paths {
            if self.latest_live(&path).await?.is_none() {
                continue;
            }
            let relative = match prefix {
                Some(p) => match path.strip_prefix(p) {
                    Some(rest) if rest.starts_with('/') || rest.starts_with('-') => rest[1..].to_owned(),
                    Some(_) | None => continue,
                },
                None => path.clone(),
            };
            match relative.find('/') {
                Some(idx) if idx > 0 => {
                    let folder = format!("{}/", &relative[..idx]);
                    if folders.insert(folder.clone()) {
                        entries.push(SecretEntry {
                            name: folder,
                            kind: EntryKind::Folder,
                        });
                    }
                }
                _ => entries.push(SecretEntry {
                    name: relative,
                    kind: EntryKind::Secret,
                }),
            }
        }
        Ok(entries)
    }

    /// Version history of `path`, oldest first, including deleted versions.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn versions(&self, path: &str) -> Result<Vec<SecretVersionInfo>, SecretError> {
        let path = normalize_path(path)?;
        let mut out = Vec::new();
        for key in self.store.list(&versions_prefix(&path)).await? {
            if parse_data_key(&key).is_none_or(|(p, _)| p != path) {
                continue;
            }
            if let Some(record) = self.store.get::<SecretRecord>(&key).await? {
                out.push(SecretVersionInfo {
                    version: record.version,
                    created_at: record.created_at,
                    deleted_at: record.deleted_at,
                });
            }
        }
        Ok(out)
    }

    /// Put every entry of `secrets`, under `prefix/` when given. Failures are
    /// collected per key.
    ///
    /// # Errors
    ///
    /// Returns an error only if the summary audit entry cannot be written.
    pub async fn import(
        &self,
        secrets: &BTreeMap<String, String>,
        prefix: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<ImportResult, SecretError> {
        let prefix = prefix.map(|p| p.trim_end_matches('/')).filter(|p| !p.is_empty());
        let mut result = ImportResult::default();

        for (key, value) in secrets {
            let path = match prefix {
                Some(p) => format!("{p}/{key}"),
                None => key.clone(),
            };
            match self.put(&path, value, user_id, None).await {
                Ok(_) => result.imported = result.imported.saturating_add(1),
                Err(e) => {
                    warn!(key = %key, error = %e, "secret import failed");
                    result.failed = result.failed.saturating_add(1);
                    result.errors.push(format!("{key}: {e}"));
                }
            }
        }

        self.audit
            .record(
                AuditEntry::new("secret.import", "Secret")
                    .user(user_id)
                    .details(serde_json::json!({
                        "prefix": prefix,
                        "imported": result.imported,
                        "failed": result.failed,
                    })),
            )
            .await?;
        Ok(result)
    }
}

impl fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStore").finish_non_exhaustive()
    }
}
