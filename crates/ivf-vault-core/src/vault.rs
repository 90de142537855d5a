//! Composition root.
//!
//! [`Vault`] owns one instance of every component, wired over a single
//! [`StorageBackend`]. The KEK cache lives here and is handed to the secret
//! store explicitly; nothing in the crate keeps global state.

use std::fmt;
use std::sync::Arc;

use ivf_vault_storage::StorageBackend;
use tracing::info;

use crate::audit::{AuditSink, AuditTrail};
use crate::cae::{CaeConfig, ContinuousAccessEvaluator};
use crate::db_rotation::{DbCredentialRotator, DbRotationTarget};
use crate::dek::KeyLifecycleManager;
use crate::dr::DisasterRecovery;
use crate::dynamic::{DynamicCredentialEngine, MemoryRoleExecutor, RoleExecutor};
use crate::error::VaultError;
use crate::kek::KekCache;
use crate::kms::KmsProvider;
use crate::lease::LeaseManager;
use crate::maintenance::Maintenance;
use crate::policy::PolicyEngine;
use crate::rotation_schedule::SecretRotationScheduler;
use crate::secret::SecretStore;
use crate::siem::{EventPublisher, TracingEventPublisher};
use crate::store::{JsonStore, SettingsStore};
use crate::table_source::{EncryptedTableSource, MemoryTableSource};
use crate::token::TokenValidator;
use crate::unseal::{SealState, UnsealOrchestrator};
use crate::zero_trust::{AccessDecider, ZeroTrustEvaluator};

/// Collaborators injected into [`Vault::new`].
pub struct VaultOptions {
    pub kms: Arc<dyn KmsProvider>,
    pub events: Arc<dyn EventPublisher>,
    pub roles: Arc<dyn RoleExecutor>,
    pub rows: Arc<dyn EncryptedTableSource>,
    pub cae: CaeConfig,
    /// Enables dual-slot credential rotation for this database.
    pub db_rotation: Option<DbRotationTarget>,
    /// Extra backends for unseal providers, by provider type.
    pub unseal_backends: Vec<(String, Arc<dyn KmsProvider>)>,
    /// Withhold the KEK, and with it every secret read and write, while
    /// the vault is sealed.
    pub require_unseal: bool,
}

impl VaultOptions {
    /// Options with in-memory role and row collaborators, tracing events,
    /// and default session settings.
    #[must_use]
    pub fn new(kms: Arc<dyn KmsProvider>) -> Self {
        Self {
            kms,
            events: Arc::new(TracingEventPublisher),
            roles: Arc::new(MemoryRoleExecutor::new()),
            rows: Arc::new(MemoryTableSource::new()),
            cae: CaeConfig::default(),
            db_rotation: None,
            unseal_backends: Vec::new(),
            require_unseal: false,
        }
    }

    #[must_use]
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn roles(mut self, roles: Arc<dyn RoleExecutor>) -> Self {
        self.roles = roles;
        self
    }

    #[must_use]
    pub fn rows(mut self, rows: Arc<dyn EncryptedTableSource>) -> Self {
        self.rows = rows;
        self
    }

    #[must_use]
    pub fn cae(mut self, config: CaeConfig) -> Self {
        self.cae = config;
        self
    }

    #[must_use]
    pub fn db_rotation(mut self, target: DbRotationTarget) -> Self {
        self.db_rotation = Some(target);
        self
    }

    #[must_use]
    pub fn unseal_backend(mut self, provider_type: impl Into<String>, backend: Arc<dyn KmsProvider>) -> Self {
        self.unseal_backends.push((provider_type.into(), backend));
        self
    }

    #[must_use]
    pub fn require_unseal(mut self, required: bool) -> Self {
        self.require_unseal = required;
        self
    }
}

impl fmt::Debug for VaultOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultOptions")
            .field("kms", &self.kms.provider_name())
            .field("cae", &self.cae)
            .field("db_rotation", &self.db_rotation)
            .field("require_unseal", &self.require_unseal)
            .finish_non_exhaustive()
    }
}

/// Every component, wired and shared.
pub struct Vault {
    pub audit: Arc<AuditTrail>,
    pub kms: Arc<dyn KmsProvider>,
    pub kek: Arc<KekCache>,
    pub secrets: Arc<SecretStore>,
    pub keys: Arc<KeyLifecycleManager>,
    pub leases: Arc<LeaseManager>,
    pub credentials: Arc<DynamicCredentialEngine>,
    pub db_rotation: Option<Arc<DbCredentialRotator>>,
    pub policies: Arc<PolicyEngine>,
    pub tokens: Arc<TokenValidator>,
    pub zero_trust: Arc<ZeroTrustEvaluator>,
    pub cae: Arc<ContinuousAccessEvaluator>,
    pub unseal: Arc<UnsealOrchestrator>,
    pub dr: Arc<DisasterRecovery>,
    pub rotation: Arc<SecretRotationScheduler>,
    pub maintenance: Arc<Maintenance>,
    pub events: Arc<dyn EventPublisher>,
}

impl Vault {
    /// Wire every component over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, options: VaultOptions) -> Self {
        let store = JsonStore::new(storage.clone());
        let settings = SettingsStore::new(storage.clone());
        let audit = Arc::new(AuditTrail::new(storage.clone()));
        let kms = options.kms;
        let events = options.events;

        let seal = Arc::new(SealState::new());
        let mut kek = KekCache::new(kms.clone(), settings.clone());
        if options.require_unseal {
            kek = kek.with_seal_gate(seal.clone());
        }
        let kek = Arc::new(kek);
        let secrets = Arc::new(SecretStore::new(store.clone(), kek.clone(), audit.clone()));
        let keys = Arc::new(KeyLifecycleManager::new(
            store.clone(),
            settings.clone(),
            kms.clone(),
            options.rows,
            audit.clone(),
        ));
        let leases = Arc::new(LeaseManager::new(store.clone(), secrets.clone(), audit.clone()));
        let credentials = Arc::new(DynamicCredentialEngine::new(
            store.clone(),
            kms.clone(),
            options.roles,
            audit.clone(),
        ));
        let db_rotation = options.db_rotation.map(|target| {
            Arc::new(DbCredentialRotator::new(
                settings.clone(),
                credentials.clone(),
                secrets.clone(),
                kms.clone(),
                audit.clone(),
                target,
            ))
        });
        let policies = Arc::new(PolicyEngine::new(store.clone(), audit.clone()));
        let tokens = Arc::new(TokenValidator::new(store.clone(), policies.clone(), audit.clone()));
        let zero_trust = Arc::new(ZeroTrustEvaluator::new(store.clone()));
        let decider: Arc<dyn AccessDecider> = zero_trust.clone();
        let cae = Arc::new(ContinuousAccessEvaluator::new(
            settings.clone(),
            decider,
            tokens.clone(),
            events.clone(),
            audit.clone(),
            options.cae,
        ));

        let mut unseal = UnsealOrchestrator::new(
            settings,
            seal,
            kms.clone(),
            events.clone(),
            audit.clone(),
        );
        for (provider_type, backend) in options.unseal_backends {
            unseal = unseal.with_backend(&provider_type, backend);
        }
        let unseal = Arc::new(unseal);
        let dr = Arc::new(DisasterRecovery::new(
            storage,
            policies.clone(),
            unseal.clone(),
            events.clone(),
            audit.clone(),
        ));

        let rotation = Arc::new(SecretRotationScheduler::new(store, secrets.clone(), audit.clone()));
        let maintenance = Arc::new(Maintenance::new(
            leases.clone(),
            credentials.clone(),
            tokens.clone(),
            rotation.clone(),
        ));

        Self {
            audit,
            kms,
            kek,
            secrets,
            keys,
            leases,
            credentials,
            db_rotation,
            policies,
            tokens,
            zero_trust,
            cae,
            unseal,
            dr,
            rotation,
            maintenance,
            events,
        }
    }

    /// Seed zero-trust defaults and attach an audit sink, if any.
    ///
    /// Safe to call on every start: existing policies are kept.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Store`] if the defaults cannot be written.
    pub async fn init(&self, sink: Option<Arc<dyn AuditSink>>) -> Result<(), VaultError> {
        if let Some(sink) = sink {
            self.audit.add_sink(sink).await;
        }
        let seeded = self.zero_trust.seed_defaults().await?;
        info!(
            kms = self.kms.provider_name(),
            seeded_zt_policies = seeded,
            db_rotation = self.db_rotation.is_some(),
            "vault initialised"
        );
        Ok(())
    }
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault")
            .field("kms", &self.kms.provider_name())
            .field("db_rotation", &self.db_rotation.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionKey;
    use crate::kms::LocalKms;
    use crate::siem::RecordingEventPublisher;
    use crate::zero_trust::ZtAction;
    use ivf_vault_storage::MemoryBackend;

    fn vault() -> Vault {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let kms = Arc::new(LocalKms::new(SettingsStore::new(storage.clone()), EncryptionKey::generate()));
        Vault::new(
            storage,
            VaultOptions::new(kms).events(Arc::new(RecordingEventPublisher::new())),
        )
    }

    #[tokio::test]
    async fn init_seeds_zero_trust_policies_once() {
        let v = vault();
        v.init(None).await.unwrap();
        v.init(None).await.unwrap();
        let policies = v.zero_trust.policies().await.unwrap();
        assert_eq!(policies.len(), ZtAction::ALL.len());
    }

    #[tokio::test]
    async fn components_share_one_store() {
        let v = vault();
        v.secrets.put("config/db/password", "s3cr3t", Some("u1"), None).await.unwrap();
        let lease = v.leases.create("config/db/password", 60, false).await.unwrap();
        let leased = v.leases.leased_secret(&lease.lease_id).await.unwrap().unwrap();
        assert_eq!(leased.value, "s3cr3t");

        let entries = v.audit.recent(10, Some("secret.")).await.unwrap();
        assert!(!entries.is_empty());
    }

    #[tokio::test]
    async fn db_rotation_is_opt_in() {
        assert!(vault().db_rotation.is_none());
    }

    #[tokio::test]
    async fn gated_vault_refuses_secrets_while_sealed() {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let kms = Arc::new(LocalKms::new(SettingsStore::new(storage.clone()), EncryptionKey::generate()));
        let v = Vault::new(storage, VaultOptions::new(kms).require_unseal(true));

        let err = v.secrets.put("config/api", "k", None, None).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);

        v.unseal.seal_state().unseal(EncryptionKey::generate()).await;
        v.secrets.put("config/api", "k", None, None).await.unwrap();

        v.unseal.seal_state().seal().await;
        assert!(v.secrets.get("config/api", None).await.is_err());
    }
}
