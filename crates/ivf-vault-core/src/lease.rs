//! Lease manager.
//!
//! A lease is a time-bounded grant on one secret version. Expiry is checked
//! against the wall clock at read time, so a lease stops yielding its secret
//! the moment `expires_at` passes even if no sweep has run yet.
//! [`LeaseManager::revoke_expired`] exists only to mark stragglers revoked.
//!
//! Leases are stored at `sys/leases/<lease_id>` and are never deleted.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditTrail};
use crate::crypto;
use crate::error::LeaseError;
use crate::secret::SecretStore;
use crate::store::JsonStore;

/// Storage prefix for lease entries.
const LEASE_PREFIX: &str = "sys/leases/";

/// Fresh ids tried before an insert gives up.
const MAX_ID_ATTEMPTS: u32 = 3;

/// `now + seconds`, or `None` when the duration or the resulting instant is
/// out of range.
pub(crate) fn expiry_after(now: DateTime<Utc>, seconds: i64) -> Option<DateTime<Utc>> {
    Duration::try_seconds(seconds).and_then(|ttl| now.checked_add_signed(ttl))
}

/// A lease on one secret version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: String,
    /// Id of the exact secret version the lease was issued for.
    pub secret_id: Uuid,
    pub secret_path: String,
    pub ttl_seconds: i64,
    pub renewable: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Lease {
    /// Whether `expires_at` has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Not revoked and not expired.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.revoked && !self.is_expired()
    }
}

/// Secret value read through an active lease.
#[derive(Clone, PartialEq, Eq)]
pub struct LeasedSecret {
    pub lease_id: String,
    pub path: String,
    pub version: u32,
    pub value: String,
    pub expires_at: DateTime<Utc>,
    /// Whole seconds until expiry, never negative.
    pub remaining_seconds: i64,
}

impl fmt::Debug for LeasedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeasedSecret")
            .field("lease_id", &self.lease_id)
            .field("path", &self.path)
            .field("version", &self.version)
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

fn lease_key(lease_id: &str) -> String {
    format!("{LEASE_PREFIX}{lease_id}")
}

fn new_lease_id() -> String {
    format!("lease_{}", hex::encode(crypto::random_bytes(16)))
}

/// Creates, renews, and revokes leases, and gates secret reads on them.
pub struct LeaseManager {
    store: JsonStore,
    secrets: Arc<SecretStore>,
    audit: Arc<AuditTrail>,
}

impl LeaseManager {
    #[must_use]
    pub fn new(store: JsonStore, secrets: Arc<SecretStore>, audit: Arc<AuditTrail>) -> Self {
        Self { store, secrets, audit }
    }

    /// Look up a lease by id.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotFound`] if the lease doesn't exist.
    /// - [`LeaseError::Store`] if storage fails.
    pub async fn lookup(&self, lease_id: &str) -> Result<Lease, LeaseError> {
        self.store
            .get(&lease_key(lease_id))
            .await?
            .ok_or_else(|| LeaseError::NotFound {
                lease_id: lease_id.to_owned(),
            })
    }

    /// Issue a lease on the latest live version of `secret_path`.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::InvalidArgument`] if `ttl_seconds` is not positive or
    ///   puts the expiry out of range.
    /// - [`LeaseError::Secret`] wrapping `NotFound` if the path has no live version.
    /// - [`LeaseError::IdConflict`] if no free lease id was found.
    pub async fn create(&self, secret_path: &str, ttl_seconds: i64, renewable: bool) -> Result<Lease, LeaseError> {
        if ttl_seconds <= 0 {
            return Err(LeaseError::InvalidArgument {
                reason: format!("ttl must be positive, got {ttl_seconds}"),
            });
        }
        let now = Utc::now();
        let expires_at = expiry_after(now, ttl_seconds).ok_or_else(|| LeaseError::InvalidArgument {
            reason: format!("ttl {ttl_seconds} is out of range"),
        })?;
        let record = self.secrets.latest_record(secret_path).await?;

        let lease = self
            .insert(Lease {
            lease_id: new_lease_id(),
            secret_id: record.id,
            secret_path: record.path.clone(),
            ttl_seconds,
            renewable,
            created_at: now,
            expires_at,
            revoked: false,
            revoked_at: None,
        })
        .await?;

        self.audit
            .record(
                AuditEntry::new("lease.create", "Lease")
                    .entity(lease.lease_id.clone())
                    .details(serde_json::json!({
                        "secretPath": lease.secret_path,
                        "ttl": ttl_seconds,
                    })),
            )
            .await?;

        info!(lease_id = %lease.lease_id, path = %lease.secret_path, ttl = ttl_seconds, "lease created");
        Ok(lease)
    }

    /// Store a new lease, drawing a fresh id whenever the current one is taken.
    async fn insert(&self, mut lease: Lease) -> Result<Lease, LeaseError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            if self.store.put_if_absent(&lease_key(&lease.lease_id), &lease).await? {
                return Ok(lease);
            }
            warn!(lease_id = %lease.lease_id, "lease id already taken, retrying");
            lease.lease_id = new_lease_id();
        }
        Err(LeaseError::IdConflict {
            attempts: MAX_ID_ATTEMPTS,
        })
    }

    /// Reset a lease to expire `increment_seconds` from now.
    ///
    /// The new expiry is absolute: renewing twice with 60 seconds leaves
    /// 60 seconds, not 120.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotFound`] if the lease doesn't exist.
    /// - [`LeaseError::NotRenewable`] if the lease was created non-renewable.
    /// - [`LeaseError::Revoked`] if the lease has been revoked.
    /// - [`LeaseError::InvalidArgument`] if the increment is not positive or
    ///   puts the expiry out of range.
    pub async fn renew(&self, lease_id: &str, increment_seconds: i64) -> Result<Lease, LeaseError> {
        if increment_seconds <= 0 {
            return Err(LeaseError::InvalidArgument {
                reason: format!("increment must be positive, got {increment_seconds}"),
            });
        }
        let expires_at = expiry_after(Utc::now(), increment_seconds).ok_or_else(|| LeaseError::InvalidArgument {
            reason: format!("increment {increment_seconds} is out of range"),
        })?;
        let mut lease = self.lookup(lease_id).await?;

        if !lease.renewable {
            return Err(LeaseError::NotRenewable {
                lease_id: lease_id.to_owned(),
            });
        }
        if lease.revoked {
            return Err(LeaseError::Revoked {
                lease_id: lease_id.to_owned(),
            });
        }

        lease.expires_at = expires_at;
        lease.ttl_seconds = increment_seconds;
        self.store.put(&lease_key(lease_id), &lease).await?;

        self.audit
            .record(
                AuditEntry::new("lease.renew", "Lease")
                    .entity(lease_id.to_owned())
                    .details(serde_json::json!({
                        "newExpiry": lease.expires_at,
                        "increment": increment_seconds,
                    })),
            )
            .await?;

        info!(lease_id = %lease_id, expires_at = %lease.expires_at, "lease renewed");
        Ok(lease)
    }

    /// Revoke a lease. Revoking an already revoked lease succeeds.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotFound`] if the lease doesn't exist.
    /// - [`LeaseError::Store`] if storage fails.
    pub async fn revoke(&self, lease_id: &str) -> Result<(), LeaseError> {
        let mut lease = self.lookup(lease_id).await?;
        let already = lease.revoked;
        if !already {
            lease.revoked = true;
            lease.revoked_at = Some(Utc::now());
            self.store.put(&lease_key(lease_id), &lease).await?;
        }

        self.audit
            .record(
                AuditEntry::new("lease.revoke", "Lease")
                    .entity(lease_id.to_owned())
                    .details(serde_json::json!({ "alreadyRevoked": already })),
            )
            .await?;

        info!(lease_id = %lease_id, already_revoked = already, "lease revoked");
        Ok(())
    }

    /// The leased secret value, or `None` once the lease is unknown,
    /// revoked, expired, or its secret version was deleted.
    ///
    /// # Errors
    ///
    /// Returns a store or secret decryption error.
    pub async fn leased_secret(&self, lease_id: &str) -> Result<Option<LeasedSecret>, LeaseError> {
        let Some(lease) = self.store.get::<Lease>(&lease_key(lease_id)).await? else {
            return Ok(None);
        };
        if !lease.is_active() {
            return Ok(None);
        }
        let Some(secret) = self.secrets.get_by_id(lease.secret_id).await? else {
            return Ok(None);
        };

        let remaining = (lease.expires_at - Utc::now()).num_seconds().max(0);
        Ok(Some(LeasedSecret {
            lease_id: lease.lease_id,
            path: secret.path,
            version: secret.version,
            value: secret.value,
            expires_at: lease.expires_at,
            remaining_seconds: remaining,
        }))
    }

    /// Every lease, in storage order. Unreadable entries are skipped.
    async fn all(&self) -> Result<Vec<Lease>, LeaseError> {
        let keys = self.store.list(LEASE_PREFIX).await?;
        let mut leases = Vec::with_capacity(keys.len());
        for key in &keys {
            match self.store.get::<Lease>(key).await {
                Ok(Some(lease)) => leases.push(lease),
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "failed to read lease"),
            }
        }
        Ok(leases)
    }

    /// Leases that are neither revoked nor expired.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Store`] if listing fails.
    pub async fn active(&self) -> Result<Vec<Lease>, LeaseError> {
        Ok(self.all().await?.into_iter().filter(Lease::is_active).collect())
    }

    /// Mark every expired, unrevoked lease revoked. Per-lease failures are
    /// logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Store`] only if the lease list cannot be read.
    pub async fn revoke_expired(&self) -> Result<usize, LeaseError> {
        let expired: Vec<Lease> = self
            .all()
            .await?
            .into_iter()
            .filter(|l| !l.revoked && l.is_expired())
            .collect();

        let mut revoked = 0usize;
        for mut lease in expired {
            lease.revoked = true;
            lease.revoked_at = Some(Utc::now());
            if let Err(e) = self.store.put(&lease_key(&lease.lease_id), &lease).await {
                warn!(lease_id = %lease.lease_id, error = %e, "failed to revoke expired lease");
                continue;
            }
            let entry = AuditEntry::new("lease.auto-revoke", "Lease")
                .entity(lease.lease_id.clone())
                .details(serde_json::json!({ "expiredAt": lease.expires_at }));
            if let Err(e) = self.audit.record(entry).await {
                warn!(lease_id = %lease.lease_id, error = %e, "failed to audit lease auto-revoke");
            }
            revoked = revoked.saturating_add(1);
        }

        if revoked > 0 {
            info!(count = revoked, "expired leases revoked");
        }
        Ok(revoked)
    }

    /// Overwrite a lease record. Test hook for moving expiry into the past.
    #[cfg(test)]
    pub(crate) async fn overwrite(&self, lease: &Lease) {
        let _ = self.store.put(&lease_key(&lease.lease_id), lease).await;
    }
}

impl fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionKey;
    use crate::error::SecretError;
    use crate::kek::KekCache;
    use crate::kms::{KmsProvider, LocalKms};
    use crate::store::SettingsStore;
    use ivf_vault_storage::MemoryBackend;

    struct Fixture {
        leases: LeaseManager,
        secrets: Arc<SecretStore>,
        audit: Arc<AuditTrail>,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryBackend::new());
        let settings = SettingsStore::new(storage.clone());
        let kms: Arc<dyn KmsProvider> = Arc::new(LocalKms::new(settings.clone(), EncryptionKey::generate()));
        let kek = Arc::new(KekCache::new(kms, settings));
        let audit = Arc::new(AuditTrail::new(storage.clone()));
        let secrets = Arc::new(SecretStore::new(JsonStore::new(storage.clone()), kek, audit.clone()));
        let leases = LeaseManager::new(JsonStore::new(storage), secrets.clone(), audit.clone());
        Fixture { leases, secrets, audit }
    }

    #[tokio::test]
    async fn create_requires_existing_secret() {
        let f = fixture();
        let err = f.leases.create("nope/here", 60, true).await.unwrap_err();
        assert!(matches!(err, LeaseError::Secret(SecretError::NotFound { .. })));
    }

    #[tokio::test]
    async fn create_rejects_non_positive_ttl() {
        let f = fixture();
        f.secrets.put("db/pw", "x", None, None).await.unwrap();
        assert!(matches!(
            f.leases.create("db/pw", 0, true).await,
            Err(LeaseError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn create_rejects_ttl_beyond_calendar() {
        let f = fixture();
        f.secrets.put("db/main", "x", None, None).await.unwrap();
        for ttl in [i64::MAX, i64::MAX / 1000, 400_000 * 365 * 86_400] {
            assert!(
                matches!(
                    f.leases.create("db/main", ttl, true).await,
                    Err(LeaseError::InvalidArgument { .. })
                ),
                "ttl {ttl}"
            );
        }
        assert!(f.leases.active().await.unwrap().is_empty());
        // A century is still fine.
        f.leases.create("db/main", 100 * 365 * 86_400, true).await.unwrap();
    }

    #[tokio::test]
    async fn renew_rejects_increment_beyond_calendar() {
        let f = fixture();
        f.secrets.put("db/main", "x", None, None).await.unwrap();
        let lease = f.leases.create("db/main", 60, true).await.unwrap();
        for increment in [i64::MAX, i64::MAX / 1000] {
            assert!(matches!(
                f.leases.renew(&lease.lease_id, increment).await,
                Err(LeaseError::InvalidArgument { .. })
            ));
        }
        assert_eq!(f.leases.lookup(&lease.lease_id).await.unwrap().expires_at, lease.expires_at);
    }

    #[tokio::test]
    async fn taken_lease_id_is_redrawn() {
        let f = fixture();
        f.secrets.put("db/main", "x", None, None).await.unwrap();
        let existing = f.leases.create("db/main", 60, true).await.unwrap();

        let mut clash = existing.clone();
        clash.ttl_seconds = 999;
        let stored = f.leases.insert(clash).await.unwrap();
        assert_ne!(stored.lease_id, existing.lease_id);
        assert_eq!(f.leases.lookup(&existing.lease_id).await.unwrap(), existing);
        assert_eq!(f.leases.lookup(&stored.lease_id).await.unwrap().ttl_seconds, 999);
    }

    #[tokio::test]
    async fn leased_secret_visible_until_revoked() {
        let f = fixture();
        f.secrets.put("db/pw", "s3cr3t", None, None).await.unwrap();
        let lease = f.leases.create("db/pw", 300, true).await.unwrap();
        assert!(lease.lease_id.starts_with("lease_"));

        let got = f.leases.leased_secret(&lease.lease_id).await.unwrap().unwrap();
        assert_eq!(got.value, "s3cr3t");
        assert!(got.remaining_seconds > 0 && got.remaining_seconds <= 300);

        f.leases.revoke(&lease.lease_id).await.unwrap();
        assert!(f.leases.leased_secret(&lease.lease_id).await.unwrap().is_none());
        f.leases.revoke(&lease.lease_id).await.unwrap();
    }

    #[tokio::test]
    async fn leased_secret_pins_version() {
        let f = fixture();
        f.secrets.put("db/pw", "v1", None, None).await.unwrap();
        let lease = f.leases.create("db/pw", 300, false).await.unwrap();
        f.secrets.put("db/pw", "v2", None, None).await.unwrap();
        let got = f.leases.leased_secret(&lease.lease_id).await.unwrap().unwrap();
        assert_eq!(got.value, "v1");
        assert_eq!(got.version, 1);
    }

    #[tokio::test]
    async fn expired_lease_yields_nothing() {
        let f = fixture();
        f.secrets.put("db/pw", "x", None, None).await.unwrap();
        let mut lease = f.leases.create("db/pw", 60, true).await.unwrap();
        lease.expires_at = Utc::now() - Duration::seconds(1);
        f.leases.overwrite(&lease).await;

        assert!(f.leases.leased_secret(&lease.lease_id).await.unwrap().is_none());
        assert!(f.leases.active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_lease_yields_nothing() {
        let f = fixture();
        assert!(f.leases.leased_secret("lease_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn renew_resets_expiry_from_now() {
        let f = fixture();
        f.secrets.put("db/pw", "x", None, None).await.unwrap();
        let lease = f.leases.create("db/pw", 3600, true).await.unwrap();
        let renewed = f.leases.renew(&lease.lease_id, 60).await.unwrap();
        assert!(renewed.expires_at < lease.expires_at);
        let remaining = (renewed.expires_at - Utc::now()).num_seconds();
        assert!((58..=60).contains(&remaining));
    }

    #[tokio::test]
    async fn renew_checks_renewable_before_revoked() {
        let f = fixture();
        f.secrets.put("db/pw", "x", None, None).await.unwrap();
        let fixed = f.leases.create("db/pw", 60, false).await.unwrap();
        f.leases.revoke(&fixed.lease_id).await.unwrap();
        assert!(matches!(
            f.leases.renew(&fixed.lease_id, 60).await,
            Err(LeaseError::NotRenewable { .. })
        ));

        let open = f.leases.create("db/pw", 60, true).await.unwrap();
        f.leases.revoke(&open.lease_id).await.unwrap();
        assert!(matches!(
            f.leases.renew(&open.lease_id, 60).await,
            Err(LeaseError::Revoked { .. })
        ));
    }

    #[tokio::test]
    async fn sweep_revokes_only_expired() {
        let f = fixture();
        f.secrets.put("db/pw", "x", None, None).await.unwrap();
        let live = f.leases.create("db/pw", 600, true).await.unwrap();
        let mut stale = f.leases.create("db/pw", 60, true).await.unwrap();
        stale.expires_at = Utc::now() - Duration::seconds(5);
        f.leases.overwrite(&stale).await;

        assert_eq!(f.leases.revoke_expired().await.unwrap(), 1);
        assert_eq!(f.leases.revoke_expired().await.unwrap(), 0);
        assert!(f.leases.lookup(&stale.lease_id).await.unwrap().revoked);
        assert!(!f.leases.lookup(&live.lease_id).await.unwrap().revoked);
        assert_eq!(f.audit.recent(10, Some("lease.auto-revoke")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lifecycle_is_audited() {
        let f = fixture();
        f.secrets.put("db/pw", "x", None, None).await.unwrap();
        let lease = f.leases.create("db/pw", 60, true).await.unwrap();
        f.leases.renew(&lease.lease_id, 30).await.unwrap();
        f.leases.revoke(&lease.lease_id).await.unwrap();
        let entries = f.audit.recent(10, Some("lease.")).await.unwrap();
        let mut actions: Vec<_> = entries.iter().map(|e| e.action.as_str()).collect();
        actions.sort_unstable();
        assert_eq!(actions, vec!["lease.create", "lease.renew", "lease.revoke"]);
    }
}
