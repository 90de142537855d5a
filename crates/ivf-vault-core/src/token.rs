//! Vault tokens.
//!
//! ## Security model
//!
//! - A raw token is 32 random bytes, hex-encoded, returned exactly once by
//!   [`TokenValidator::create`].
//! - Only the SHA-256 digest is stored; records are keyed by digest under
//!   `sys/tokens/<sha256-hex>`, with `sys/token-ids/<uuid>` pointing back
//!   at the digest.
//! - Every successful [`TokenValidator::validate`] consumes one use. A token
//!   with `max_uses > 0` stops validating once `uses_count` reaches it.
//! - Revoked tokens never validate, whatever their remaining uses or expiry.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditTrail};
use crate::crypto;
use crate::error::TokenError;
use crate::lease::expiry_after;
use crate::policy::PolicyEngine;
use crate::store::JsonStore;

const TOKEN_PREFIX: &str = "sys/tokens/";
const TOKEN_ID_PREFIX: &str = "sys/token-ids/";

/// Hex SHA-256 digest of a raw token.
#[must_use]
pub fn hash_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Persisted token metadata. The raw value is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub accessor: String,
    pub token_hash: String,
    pub display_name: Option<String>,
    pub policies: Vec<String>,
    pub token_type: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Zero means unlimited.
    pub max_uses: u32,
    pub uses_count: u32,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
}

impl Token {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.max_uses > 0 && self.uses_count >= self.max_uses
    }

    /// Not revoked, not expired, uses left.
    #[must_use]
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && !self.is_expired(now) && !self.is_exhausted()
    }
}

/// Parameters for a new token.
#[derive(Debug, Clone, Default)]
pub struct TokenRequest {
    pub policies: Vec<String>,
    pub display_name: Option<String>,
    /// `None` means no expiry.
    pub ttl_seconds: Option<i64>,
    pub max_uses: u32,
    /// Defaults to `service`.
    pub token_type: Option<String>,
}

/// A freshly created token. `token` is the only copy of the raw value.
#[derive(Clone)]
pub struct IssuedToken {
    pub id: Uuid,
    pub accessor: String,
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("id", &self.id)
            .field("accessor", &self.accessor)
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Issues, validates and revokes vault tokens.
pub struct TokenValidator {
    store: JsonStore,
    policies: Arc<PolicyEngine>,
    audit: Arc<AuditTrail>,
    /// Serializes use counting so concurrent validations never lose an increment.
    uses: Mutex<()>,
}

impl TokenValidator {
    #[must_use]
    pub fn new(store: JsonStore, policies: Arc<PolicyEngine>, audit: Arc<AuditTrail>) -> Self {
        Self {
            store,
            policies,
            audit,
            uses: Mutex::new(()),
        }
    }

    /// Create a token and return its raw value once.
    ///
    /// # Errors
    ///
    /// - [`TokenError::InvalidArgument`] for a non-positive or out-of-range TTL.
    /// - [`TokenError::Store`] / [`TokenError::Audit`] on persistence failure.
    pub async fn create(&self, request: TokenRequest, created_by: Option<&str>) -> Result<IssuedToken, TokenError> {
        let now = Utc::now();
        let expires_at = match request.ttl_seconds {
            None => None,
            Some(ttl) if ttl <= 0 => {
                return Err(TokenError::InvalidArgument {
                    reason: "ttl must be positive".to_owned(),
                });
            }
            Some(ttl) => Some(expiry_after(now, ttl).ok_or_else(|| TokenError::InvalidArgument {
                reason: format!("ttl {ttl} is out of range"),
            })?),
        };

        let raw = hex::encode(crypto::random_bytes(32));
        let token = Token {
            id: Uuid::new_v4(),
            accessor: format!("accessor_{}", hex::encode(crypto::random_bytes(12))),
            token_hash: hash_token(&raw),
            display_name: request.display_name,
            policies: request.policies,
            token_type: request.token_type.unwrap_or_else(|| "service".to_owned()),
            created_at: now,
            expires_at,
            max_uses: request.max_uses,
            uses_count: 0,
            revoked: false,
            revoked_at: None,
            created_by: created_by.map(str::to_owned),
        };

        self.store
            .put(&format!("{TOKEN_PREFIX}{}", token.token_hash), &token)
            .await?;
        self.store
            .put(&format!("{TOKEN_ID_PREFIX}{}", token.id), &token.token_hash)
            .await?;

        self.audit
            .record(
                AuditEntry::new("token.create", "VaultToken")
                    .entity(token.id.to_string())
                    .user(created_by)
                    .details(serde_json::json!({
                        "accessor": token.accessor,
                        "policies": token.policies,
                        "maxUses": token.max_uses,
                        "expiresAt": token.expires_at,
                    })),
            )
            .await?;
        info!(token_id = %token.id, accessor = %token.accessor, "token created");

        Ok(IssuedToken {
            id: token.id,
            accessor: token.accessor,
            token: raw,
            expires_at: token.expires_at,
        })
    }

    /// Validate a raw token and consume one use.
    ///
    /// Returns `None` for blank, unknown, revoked, expired or exhausted
    /// tokens.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Store`] if the record cannot be read or the
    /// new use count cannot be persisted. Callers must deny on error.
    pub async fn validate(&self, raw: &str) -> Result<Option<Token>, TokenError> {
        if raw.trim().is_empty() {
            return Ok(None);
        }
        let digest = hash_token(raw);
        let key = format!("{TOKEN_PREFIX}{digest}");

        let _guard = self.uses.lock().await;
        let Some(mut token) = self.store.get::<Token>(&key).await? else {
            debug!("token not found");
            return Ok(None);
        };
        if !bool::from(token.token_hash.as_bytes().ct_eq(digest.as_bytes())) {
            return Ok(None);
        }
        if !token.is_usable(Utc::now()) {
            debug!(token_id = %token.id, "token unusable");
            return Ok(None);
        }

        token.uses_count = token.uses_count.saturating_add(1);
        self.store.put(&key, &token).await?;
        Ok(Some(token))
    }

    /// Validate `raw` and check whether any of its policies grants
    /// `capability` on `path`. Consumes one use.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Store`] if the token or its policies cannot be
    /// loaded.
    pub async fn has_capability(&self, raw: &str, path: &str, capability: &str) -> Result<bool, TokenError> {
        let Some(token) = self.validate(raw).await? else {
            return Ok(false);
        };
        for name in &token.policies {
            let granted = self
                .policies
                .get(name)
                .await?
                .is_some_and(|p| p.grants(path, capability));
            if granted {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Token metadata by id.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Store`] if storage fails.
    pub async fn get(&self, id: Uuid) -> Result<Option<Token>, TokenError> {
        let Some(hash) = self.store.get::<String>(&format!("{TOKEN_ID_PREFIX}{id}")).await? else {
            return Ok(None);
        };
        Ok(self.store.get(&format!("{TOKEN_PREFIX}{hash}")).await?)
    }

    /// Token metadata by public accessor.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Store`] if storage fails.
    pub async fn lookup_by_accessor(&self, accessor: &str) -> Result<Option<Token>, TokenError> {
        Ok(self
            .store
            .scan::<Token>(TOKEN_PREFIX)
            .await?
            .into_iter()
            .find(|t| t.accessor == accessor))
    }

    /// Revoke a token. Returns `false` if it was already revoked.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::NotFound`] if no token has this id.
    pub async fn revoke(&self, id: Uuid, revoked_by: Option<&str>) -> Result<bool, TokenError> {
        let _guard = self.uses.lock().await;
        let Some(mut token) = self.get(id).await? else {
            return Err(TokenError::NotFound);
        };
        if token.revoked {
            return Ok(false);
        }
        self.mark_revoked(&mut token, "token.revoke", revoked_by).await?;
        Ok(true)
    }

    async fn mark_revoked(&self, token: &mut Token, action: &str, user: Option<&str>) -> Result<(), TokenError> {
        token.revoked = true;
        token.revoked_at = Some(Utc::now());
        self.store
            .put(&format!("{TOKEN_PREFIX}{}", token.token_hash), &*token)
            .await?;
        self.audit
            .record(
                AuditEntry::new(action, "VaultToken")
                    .entity(token.id.to_string())
                    .user(user)
                    .details(serde_json::json!({ "accessor": token.accessor })),
            )
            .await?;
        info!(token_id = %token.id, action, "token revoked");
        Ok(())
    }

    /// Revoke every expired or exhausted token. Per-token failures are
    /// logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Store`] if tokens cannot be listed.
    pub async fn revoke_expired(&self) -> Result<usize, TokenError> {
        let _guard = self.uses.lock().await;
        let now = Utc::now();
        let stale: Vec<Token> = self
            .store
            .scan::<Token>(TOKEN_PREFIX)
            .await?
            .into_iter()
            .filter(|t| !t.revoked && (t.is_expired(now) || t.is_exhausted()))
            .collect();

        let mut revoked = 0;
        for mut token in stale {
            match self.mark_revoked(&mut token, "token.auto-revoke", Some("system")).await {
                Ok(()) => revoked += 1,
                Err(e) => warn!(token_id = %token.id, error = %e, "failed to auto-revoke token"),
            }
        }
        if revoked > 0 {
            info!(count = revoked, "expired tokens revoked");
        }
        Ok(revoked)
    }

    #[cfg(test)]
    async fn overwrite(&self, token: &Token) {
        #[allow(clippy::unwrap_used)]
        self.store
            .put(&format!("{TOKEN_PREFIX}{}", token.token_hash), token)
            .await
            .unwrap();
    }
}

impl fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenValidator").finish_non_exhaustive()
    }
}
