//! Error types for `ivf-vault-core`.
//!
//! Each subsystem has its own error enum. Every variant carries enough
//! context to diagnose the problem without a debugger, and none of them ever
//! carries key material or secret values. [`VaultError`] unifies them for
//! callers that only care about the [`ErrorKind`].

use ivf_vault_storage::StorageError;

/// Coarse classification shared by every error in the crate.
///
/// Callers map these to their own surface (HTTP status, exit code). All
/// kinds fail closed: a caller that cannot classify an error must deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Null, empty, or malformed input rejected at the boundary.
    InvalidArgument,
    /// Absent or soft-deleted resource.
    NotFound,
    /// Policy, capability, or session denial.
    Unauthorized,
    /// Duplicate name or lost version race.
    Conflict,
    /// Operation not valid for the resource's current state.
    InvalidState,
    /// KMS, database, or storage failure outside this process.
    External,
    /// AEAD verification or key derivation failure.
    Crypto,
    /// Serialization or other internal inconsistency.
    Internal,
}

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM decryption failed (wrong key, corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// HKDF key derivation failed.
    #[error("key derivation failed for context '{context}': {reason}")]
    KeyDerivation { context: String, reason: String },

    /// Key bytes were not exactly 32 bytes long.
    #[error("invalid key length: expected 32 bytes, got {actual}")]
    InvalidKeyLength { actual: usize },

    /// Nonce was not exactly 12 bytes long.
    #[error("invalid nonce length: expected 12 bytes, got {actual}")]
    InvalidNonceLength { actual: usize },

    /// Base64 input could not be decoded.
    #[error("invalid base64 in '{field}': {reason}")]
    Encoding { field: String, reason: String },
}

/// Errors from the JSON record layer over the storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A record could not be serialized or deserialized.
    #[error("serialization failed for '{key}': {reason}")]
    Serialization { key: String, reason: String },
}

/// Errors from KMS providers.
#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    /// The provider cannot be reached or is not configured.
    #[error("KMS provider '{provider}' unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    /// The named key does not exist in the provider.
    #[error("KMS key not found: {name}")]
    KeyNotFound { name: String },

    /// A cryptographic operation inside the provider failed.
    #[error("KMS crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The provider's key store failed.
    #[error("KMS store error: {0}")]
    Store(#[from] StoreError),

    /// Key material is withheld until the vault is unsealed.
    #[error("vault is sealed")]
    Sealed,
}

/// Errors from the audit trail.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The entry could not be persisted.
    #[error("audit store error: {0}")]
    Store(#[from] StoreError),

    /// A sink failed to write the entry.
    #[error("audit sink '{name}' failed: {reason}")]
    SinkFailure { name: String, reason: String },

    /// The entry could not be serialized for a sink.
    #[error("audit serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Errors from the secret store.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// The secret path or input is invalid.
    #[error("invalid secret request: {reason}")]
    InvalidArgument { reason: String },

    /// No live version exists at the path.
    #[error("secret not found: {path}")]
    NotFound { path: String },

    /// Version allocation kept losing to concurrent writers.
    #[error("version conflict on '{path}' after {attempts} attempts")]
    VersionConflict { path: String, attempts: u32 },

    /// The KEK could not be loaded or created.
    #[error("secret KMS error: {0}")]
    Kms(#[from] KmsError),

    /// Decryption of the stored value failed.
    #[error("secret crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The record layer failed.
    #[error("secret store error: {0}")]
    Store(#[from] StoreError),

    /// The audit entry could not be written.
    #[error("secret audit error: {0}")]
    Audit(#[from] AuditError),
}

/// Errors from DEK lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum DekError {
    /// Purpose, table, or batch size was invalid.
    #[error("invalid DEK request: {reason}")]
    InvalidArgument { reason: String },

    /// No DEK material exists for the purpose or version.
    #[error("DEK not found: {name}")]
    KeyNotFound { name: String },

    /// The value is not a recognised field envelope.
    #[error("malformed encrypted field: {reason}")]
    MalformedEnvelope { reason: String },

    /// The table row source failed.
    #[error("row source error on table '{table}': {reason}")]
    RowSource { table: String, reason: String },

    /// The operation observed a cancellation signal.
    #[error("operation cancelled")]
    Cancelled,

    /// Wrapping or unwrapping DEK material failed.
    #[error("DEK KMS error: {0}")]
    Kms(#[from] KmsError),

    /// Field encryption or decryption failed.
    #[error("DEK crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The record layer failed.
    #[error("DEK store error: {0}")]
    Store(#[from] StoreError),

    /// The audit entry could not be written.
    #[error("DEK audit error: {0}")]
    Audit(#[from] AuditError),
}

/// Errors from lease operations.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// TTL or path was invalid.
    #[error("invalid lease request: {reason}")]
    InvalidArgument { reason: String },

    /// The lease does not exist.
    #[error("lease not found: {lease_id}")]
    NotFound { lease_id: String },

    /// The lease has been revoked.
    #[error("lease {lease_id} is revoked")]
    Revoked { lease_id: String },

    /// The lease was created non-renewable.
    #[error("lease {lease_id} is not renewable")]
    NotRenewable { lease_id: String },

    /// Every drawn lease id was already taken.
    #[error("no free lease id after {attempts} attempts")]
    IdConflict { attempts: u32 },

    /// Resolving the leased secret failed.
    #[error("lease secret error: {0}")]
    Secret(#[from] SecretError),

    /// The record layer failed.
    #[error("lease store error: {0}")]
    Store(#[from] StoreError),

    /// The audit entry could not be written.
    #[error("lease audit error: {0}")]
    Audit(#[from] AuditError),
}

/// Errors from dynamic database credentials.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// Request fields were invalid.
    #[error("invalid credential request: {reason}")]
    InvalidArgument { reason: String },

    /// The credential does not exist.
    #[error("dynamic credential not found: {id}")]
    NotFound { id: String },

    /// The target database rejected the DDL.
    #[error("DDL failed for role '{username}': {reason}")]
    Ddl { username: String, reason: String },

    /// The role was not present after creation.
    #[error("role '{username}' missing after creation")]
    RoleMissing { username: String },

    /// Encrypting the admin password failed.
    #[error("credential KMS error: {0}")]
    Kms(#[from] KmsError),

    /// The rotated connection string could not be published.
    #[error("failed to publish connection string: {0}")]
    Publish(SecretError),

    /// The record layer failed.
    #[error("credential store error: {0}")]
    Store(#[from] StoreError),

    /// The audit entry could not be written.
    #[error("credential audit error: {0}")]
    Audit(#[from] AuditError),
}

/// Errors from policy management and evaluation.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// Name, pattern, or capability list was invalid.
    #[error("invalid policy: {reason}")]
    InvalidArgument { reason: String },

    /// The policy does not exist.
    #[error("policy not found: {name}")]
    NotFound { name: String },

    /// A policy with this name already exists.
    #[error("policy already exists: {name}")]
    AlreadyExists { name: String },

    /// The user already holds this policy.
    #[error("policy '{policy}' already assigned to user '{user_id}'")]
    AlreadyAssigned { user_id: String, policy: String },

    /// The record layer failed.
    #[error("policy store error: {0}")]
    Store(#[from] StoreError),

    /// The audit entry could not be written.
    #[error("policy audit error: {0}")]
    Audit(#[from] AuditError),
}

/// Errors from token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Token parameters were invalid.
    #[error("invalid token request: {reason}")]
    InvalidArgument { reason: String },

    /// The token does not exist.
    #[error("token not found")]
    NotFound,

    /// A policy named by the token could not be loaded.
    #[error("token policy error: {0}")]
    Policy(#[from] PolicyError),

    /// The record layer failed.
    #[error("token store error: {0}")]
    Store(#[from] StoreError),

    /// The audit entry could not be written.
    #[error("token audit error: {0}")]
    Audit(#[from] AuditError),
}

/// Errors from continuous access evaluation.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Session or token identifiers were missing.
    #[error("invalid session request: {reason}")]
    InvalidArgument { reason: String },

    /// Revoking the bound token failed.
    #[error("session token error: {0}")]
    Token(#[from] TokenError),

    /// The binding store failed.
    #[error("session store error: {0}")]
    Store(#[from] StoreError),

    /// The audit entry could not be written.
    #[error("session audit error: {0}")]
    Audit(#[from] AuditError),
}

/// Errors from the unseal orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum UnsealError {
    /// Provider descriptor or password was invalid.
    #[error("invalid unseal request: {reason}")]
    InvalidArgument { reason: String },

    /// No backend is registered for the provider type.
    #[error("no KMS backend registered for provider type '{provider_type}'")]
    UnknownProviderType { provider_type: String },

    /// The provider id is not configured.
    #[error("unseal provider not found: {provider_id}")]
    ProviderNotFound { provider_id: String },

    /// No wrapped master key has been stored for the provider.
    #[error("no wrapped master key for provider '{provider_id}'")]
    NotConfigured { provider_id: String },

    /// The backend failed to wrap or unwrap.
    #[error("unseal KMS error: {0}")]
    Kms(#[from] KmsError),

    /// Master key derivation failed.
    #[error("unseal crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The provider list could not be read or written.
    #[error("unseal store error: {0}")]
    Store(#[from] StoreError),

    /// The audit entry could not be written.
    #[error("unseal audit error: {0}")]
    Audit(#[from] AuditError),
}

/// Errors from secret rotation schedules.
#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    /// Interval or path was invalid.
    #[error("invalid rotation schedule: {reason}")]
    InvalidArgument { reason: String },

    /// No schedule exists for the path.
    #[error("rotation schedule not found: {path}")]
    NotFound { path: String },

    /// Writing the rotated value failed.
    #[error("rotation secret error: {0}")]
    Secret(#[from] SecretError),

    /// The schedule store failed.
    #[error("rotation store error: {0}")]
    Store(#[from] StoreError),

    /// The audit entry could not be written.
    #[error("rotation audit error: {0}")]
    Audit(#[from] AuditError),
}

/// Errors from backup and restore.
#[derive(Debug, thiserror::Error)]
pub enum DrError {
    /// Empty password or out-of-range key derivation cost.
    #[error("invalid backup request: {reason}")]
    InvalidArgument { reason: String },

    /// The blob is not a backup, or the password does not open it.
    #[error("backup cannot be opened: {reason}")]
    Corrupt { reason: String },

    /// Sealing the snapshot failed.
    #[error("backup crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Reading or writing vault records failed.
    #[error("backup store error: {0}")]
    Store(#[from] StoreError),

    /// Policies could not be counted.
    #[error("backup policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Unseal providers could not be read.
    #[error("backup unseal error: {0}")]
    Unseal(#[from] UnsealError),

    /// The audit entry could not be written.
    #[error("backup audit error: {0}")]
    Audit(#[from] AuditError),
}

impl CryptoError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidKeyLength { .. } | Self::InvalidNonceLength { .. } | Self::Encoding { .. } => {
                ErrorKind::InvalidArgument
            }
            Self::Encryption { .. } | Self::Decryption { .. } | Self::KeyDerivation { .. } => ErrorKind::Crypto,
        }
    }
}

impl StoreError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(_) => ErrorKind::External,
            Self::Serialization { .. } => ErrorKind::Internal,
        }
    }
}

impl KmsError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable { .. } => ErrorKind::External,
            Self::KeyNotFound { .. } => ErrorKind::NotFound,
            Self::Crypto(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Sealed => ErrorKind::InvalidState,
        }
    }
}

impl AuditError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::SinkFailure { .. } => ErrorKind::External,
            Self::Serialization { .. } => ErrorKind::Internal,
        }
    }
}

impl SecretError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::VersionConflict { .. } => ErrorKind::Conflict,
            Self::Kms(e) => e.kind(),
            Self::Crypto(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Audit(e) => e.kind(),
        }
    }
}

impl DekError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } | Self::MalformedEnvelope { .. } => ErrorKind::InvalidArgument,
            Self::KeyNotFound { .. } => ErrorKind::NotFound,
            Self::RowSource { .. } => ErrorKind::External,
            Self::Cancelled => ErrorKind::InvalidState,
            Self::Kms(e) => e.kind(),
            Self::Crypto(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Audit(e) => e.kind(),
        }
    }
}

impl LeaseError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Revoked { .. } | Self::NotRenewable { .. } => ErrorKind::InvalidState,
            Self::IdConflict { .. } => ErrorKind::Conflict,
            Self::Secret(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Audit(e) => e.kind(),
        }
    }
}

impl CredentialError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Ddl { .. } | Self::RoleMissing { .. } => ErrorKind::External,
            Self::Kms(e) => e.kind(),
            Self::Publish(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Audit(e) => e.kind(),
        }
    }
}

impl PolicyError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } | Self::AlreadyAssigned { .. } => ErrorKind::Conflict,
            Self::Store(e) => e.kind(),
            Self::Audit(e) => e.kind(),
        }
    }
}

impl TokenError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::NotFound => ErrorKind::NotFound,
            Self::Policy(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Audit(e) => e.kind(),
        }
    }
}

impl SessionError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::Token(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Audit(e) => e.kind(),
        }
    }
}

impl UnsealError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } | Self::UnknownProviderType { .. } => ErrorKind::InvalidArgument,
            Self::ProviderNotFound { .. } => ErrorKind::NotFound,
            Self::NotConfigured { .. } => ErrorKind::InvalidState,
            Self::Kms(e) => e.kind(),
            Self::Crypto(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Audit(e) => e.kind(),
        }
    }
}

impl DrError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::Corrupt { .. } => ErrorKind::Crypto,
            Self::Crypto(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Policy(e) => e.kind(),
            Self::Unseal(e) => e.kind(),
            Self::Audit(e) => e.kind(),
        }
    }
}

impl RotationError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Secret(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Audit(e) => e.kind(),
        }
    }
}

/// Any error produced by this crate.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error(transparent)]
    Dek(#[from] DekError),
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Unseal(#[from] UnsealError),
    #[error(transparent)]
    Rotation(#[from] RotationError),
    #[error(transparent)]
    Dr(#[from] DrError),
    #[error(transparent)]
    Kms(#[from] KmsError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl VaultError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Secret(e) => e.kind(),
            Self::Dek(e) => e.kind(),
            Self::Lease(e) => e.kind(),
            Self::Credential(e) => e.kind(),
            Self::Policy(e) => e.kind(),
            Self::Token(e) => e.kind(),
            Self::Session(e) => e.kind(),
            Self::Unseal(e) => e.kind(),
            Self::Rotation(e) => e.kind(),
            Self::Dr(e) => e.kind(),
            Self::Kms(e) => e.kind(),
            Self::Audit(e) => e.kind(),
            Self::Store(e) => e.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_errors_keep_their_kind() {
        let err: VaultError = LeaseError::Secret(SecretError::NotFound {
            path: "config/db".to_owned(),
        })
        .into();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err: VaultError = SecretError::Crypto(CryptoError::Decryption {
            reason: "aead::Error".to_owned(),
        })
        .into();
        assert_eq!(err.kind(), ErrorKind::Crypto);
    }

    #[test]
    fn storage_failures_are_external() {
        let err = StoreError::Storage(StorageError::Read {
            key: "k".to_owned(),
            reason: "io".to_owned(),
        });
        assert_eq!(err.kind(), ErrorKind::External);
    }

    #[test]
    fn lease_state_errors_are_invalid_state() {
        let err = LeaseError::NotRenewable {
            lease_id: "l".to_owned(),
        };
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(err.to_string(), "lease l is not renewable");
    }
}
