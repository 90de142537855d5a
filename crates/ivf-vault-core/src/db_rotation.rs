//! Dual-slot rotation of the application's own database credential.
//!
//! Two slots, `A` and `B`, each hold at most one dynamic credential. Exactly
//! one slot is active. [`DbCredentialRotator::rotate`] always works on the
//! standby slot: it revokes the credential that slot held before, issues a
//! fresh one into it, publishes the new connection string at
//! [`PUBLISHED_CONNECTION_PATH`], and only then flips the active slot. If
//! publishing fails the new credential is revoked and the state is left as
//! it was. The slot that was active when the
//! rotation started is left alone, so in-flight connections drain on it
//! until the next rotation retires it.
//!
//! Rotation is single-flight within a process. Running it from several
//! processes at once needs an external leader; the maintenance worker in the
//! daemon is that leader.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditTrail};
use crate::crypto;
use crate::dynamic::{CredentialRequest, DbTarget, DynamicCredentialEngine};
use crate::error::CredentialError;
use crate::kms::{KmsProvider, purpose_key_name};
use crate::secret::SecretStore;
use crate::store::SettingsStore;

/// Settings entry holding [`DbRotationState`].
pub const STATE_SETTING: &str = "db-rotation-state";

/// Secret path the active connection string is published at.
pub const PUBLISHED_CONNECTION_PATH: &str = "config/ConnectionStrings/DefaultConnection";

/// Lifetime of each slot credential.
pub const DEFAULT_CREDENTIAL_TTL_SECONDS: i64 = 86_400;

const ROTATOR_USER: &str = "system:db-rotation";

/// One of the two credential slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slot {
    #[default]
    A,
    B,
}

impl Slot {
    /// The other slot.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::A => "A",
            Self::B => "B",
        })
    }
}

/// Where slot credentials are issued.
#[derive(Debug, Clone)]
pub struct DbRotationTarget {
    pub target: DbTarget,
    pub ttl_seconds: i64,
}

impl DbRotationTarget {
    #[must_use]
    pub fn new(target: DbTarget) -> Self {
        Self {
            target,
            ttl_seconds: DEFAULT_CREDENTIAL_TTL_SECONDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SealedConnection {
    ciphertext: String,
    iv: String,
    key_name: String,
}

/// Credential held by one slot. The connection string is KMS-encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotCredential {
    pub credential_id: Uuid,
    pub username: String,
    pub expires_at: DateTime<Utc>,
    connection: SealedConnection,
}

/// Persisted rotation state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbRotationState {
    pub active_slot: Slot,
    pub slot_a: Option<SlotCredential>,
    pub slot_b: Option<SlotCredential>,
    pub last_rotated_at: Option<DateTime<Utc>>,
    pub rotation_count: u64,
}

impl DbRotationState {
    fn slot(&self, slot: Slot) -> Option<&SlotCredential> {
        match slot {
            Slot::A => self.slot_a.as_ref(),
            Slot::B => self.slot_b.as_ref(),
        }
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut Option<SlotCredential> {
        match slot {
            Slot::A => &mut self.slot_a,
            Slot::B => &mut self.slot_b,
        }
    }
}

/// Outcome of one rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbRotationResult {
    pub success: bool,
    /// Slot active after the rotation; `None` on failure.
    pub active_slot: Option<Slot>,
    pub username: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub rotation_count: u64,
    pub error: Option<String>,
}

/// Public view of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStatus {
    pub username: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

/// Public view of the rotation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualCredentialStatus {
    pub active_slot: Slot,
    pub slot_a: SlotStatus,
    pub slot_b: SlotStatus,
    pub last_rotated_at: Option<DateTime<Utc>>,
    pub rotation_count: u64,
}

/// Two-slot rotation state machine.
pub struct DbCredentialRotator {
    settings: SettingsStore,
    credentials: Arc<DynamicCredentialEngine>,
    secrets: Arc<SecretStore>,
    kms: Arc<dyn KmsProvider>,
    audit: Arc<AuditTrail>,
    target: DbRotationTarget,
    in_flight: Mutex<()>,
}

impl DbCredentialRotator {
    #[must_use]
    pub fn new(
        settings: SettingsStore,
        credentials: Arc<DynamicCredentialEngine>,
        secrets: Arc<SecretStore>,
        kms: Arc<dyn KmsProvider>,
        audit: Arc<AuditTrail>,
        target: DbRotationTarget,
    ) -> Self {
        Self {
            settings,
            credentials,
            secrets,
            kms,
            audit,
            target,
            in_flight: Mutex::new(()),
        }
    }

    async fn load_state(&self) -> Result<DbRotationState, CredentialError> {
        Ok(self.settings.get(STATE_SETTING).await?.unwrap_or_default())
    }

    /// Rotate the standby slot and make it active.
    ///
    /// Failures come back as `success: false` and are still audited.
    pub async fn rotate(&self) -> DbRotationResult {
        let _guard = self.in_flight.lock().await;

        match self.try_rotate().await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "DB credential rotation failed");
                let entry = AuditEntry::new("db.credential.rotate", "DbCredential")
                    .entity("unknown")
                    .details(serde_json::json!({ "success": false, "error": e.to_string() }));
                if let Err(audit_err) = self.audit.record(entry).await {
                    error!(error = %audit_err, "failed to audit DB credential rotation failure");
                }
                let rotation_count = self.load_state().await.map_or(0, |s| s.rotation_count);
                DbRotationResult {
                    success: false,
                    active_slot: None,
                    username: None,
                    expires_at: None,
                    rotation_count,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn try_rotate(&self) -> Result<DbRotationResult, CredentialError> {
        let mut state = self.load_state().await?;
        let rotating = state.active_slot.other();

        if let Some(old) = state.slot(rotating) {
            match self.credentials.revoke(old.credential_id).await {
                Ok(_) => info!(slot = %rotating, username = %old.username, "revoked previous slot credential"),
                Err(e) => warn!(slot = %rotating, username = %old.username, error = %e, "failed to revoke previous slot credential"),
            }
        }

        let issued = self
            .credentials
            .generate(&CredentialRequest {
                target: self.target.target.clone(),
                ttl_seconds: self.target.ttl_seconds,
                read_only: false,
                granted_tables: Vec::new(),
            })
            .await?;

        let sealed = self
            .kms
            .encrypt(&purpose_key_name("data"), issued.connection_string.as_bytes())
            .await?;
        if let Err(e) = self
            .secrets
            .put(PUBLISHED_CONNECTION_PATH, &issued.connection_string, Some(ROTATOR_USER), None)
            .await
        {
            if let Err(revoke_err) = self.credentials.revoke(issued.id).await {
                warn!(username = %issued.username, error = %revoke_err, "failed to revoke unpublished credential");
            }
            return Err(CredentialError::Publish(e));
        }

        *state.slot_mut(rotating) = Some(SlotCredential {
            credential_id: issued.id,
            username: issued.username.clone(),
            expires_at: issued.expires_at,
            connection: SealedConnection {
                ciphertext: crypto::encode_b64(&sealed.ciphertext),
                iv: crypto::encode_b64(&sealed.iv),
                key_name: sealed.key_name,
            },
        });
        state.active_slot = rotating;
        state.last_rotated_at = Some(Utc::now());
        state.rotation_count = state.rotation_count.saturating_add(1);
        self.settings.set(STATE_SETTING, &state).await?;

        self.audit
            .record(
                AuditEntry::new("db.credential.rotate", "DbCredential")
                    .entity(rotating.to_string())
                    .details(serde_json::json!({
                        "newUsername": issued.username,
                        "expiresAt": issued.expires_at,
                        "rotationCount": state.rotation_count,
                    })),
            )
            .await?;

        info!(
            slot = %rotating,
            username = %issued.username,
            rotation = state.rotation_count,
            "DB credential rotated"
        );
        Ok(DbRotationResult {
            success: true,
            active_slot: Some(rotating),
            username: Some(issued.username),
            expires_at: Some(issued.expires_at),
            rotation_count: state.rotation_count,
            error: None,
        })
    }

    /// Current slot usernames, expiries, and counters.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Store`] if the state cannot be read.
    pub async fn status(&self) -> Result<DualCredentialStatus, CredentialError> {
        let state = self.load_state().await?;
        let view = |slot: Slot| {
            let cred = state.slot(slot);
            SlotStatus {
                username: cred.map(|c| c.username.clone()),
                expires_at: cred.map(|c| c.expires_at),
                active: state.active_slot == slot,
            }
        };
        Ok(DualCredentialStatus {
            active_slot: state.active_slot,
            slot_a: view(Slot::A),
            slot_b: view(Slot::B),
            last_rotated_at: state.last_rotated_at,
            rotation_count: state.rotation_count,
        })
    }

    /// Connection string of the active slot, or `None` before the first
    /// rotation.
    ///
    /// # Errors
    ///
    /// Returns a store or KMS error if the sealed string cannot be opened.
    pub async fn active_connection_string(&self) -> Result<Option<String>, CredentialError> {
        let state = self.load_state().await?;
        let Some(cred) = state.slot(state.active_slot) else {
            return Ok(None);
        };
        let invalid = |e: String| CredentialError::InvalidArgument { reason: e };
        let ciphertext = crypto::decode_b64("ciphertext", &cred.connection.ciphertext).map_err(|e| invalid(e.to_string()))?;
        let iv = crypto::decode_b64("iv", &cred.connection.iv).map_err(|e| invalid(e.to_string()))?;
        let plain = self.kms.decrypt(&cred.connection.key_name, &ciphertext, &iv).await?;
        String::from_utf8(plain)
            .map(Some)
            .map_err(|e| invalid(format!("connection string is not UTF-8: {e}")))
    }
}

impl fmt::Debug for DbCredentialRotator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbCredentialRotator")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}
