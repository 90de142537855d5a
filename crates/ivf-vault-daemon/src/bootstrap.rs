//! Build a [`Vault`] from [`VaultConfig`].

use std::sync::Arc;

use anyhow::Context;
use ivf_vault_core::audit::AuditSink;
use ivf_vault_core::audit_file::FileAuditSink;
use ivf_vault_core::cae::CaeConfig;
use ivf_vault_core::crypto::EncryptionKey;
use ivf_vault_core::db_rotation::DbRotationTarget;
use ivf_vault_core::kms::{KmsBackend, KmsKind};
use ivf_vault_core::store::SettingsStore;
use ivf_vault_core::{Vault, VaultOptions};
use ivf_vault_storage::{MemoryBackend, StorageBackend};
use tracing::{info, warn};

use crate::config::{StorageBackendType, VaultConfig};

/// Open storage, select the KMS backend, wire every component, and run
/// first-start initialisation.
///
/// # Errors
///
/// Fails if storage cannot be opened, the KMS kind is unknown or has no
/// client, the local master key is malformed, or initialisation fails.
pub async fn build_vault(config: &VaultConfig) -> anyhow::Result<Vault> {
    let kind: KmsKind = config
        .kms_provider
        .parse()
        .with_context(|| format!("invalid IVF_VAULT_KMS_PROVIDER '{}'", config.kms_provider))?;

    let (storage, mut options_fn) = open_storage(config).await?;

    let root = match &config.local_master_key {
        Some(encoded) => Some(EncryptionKey::from_base64(encoded).context("invalid IVF_VAULT_LOCAL_MASTER_KEY")?),
        None if kind == KmsKind::Local && config.storage_backend == StorageBackendType::Memory => {
            warn!("no local master key configured, using an ephemeral key");
            Some(EncryptionKey::generate())
        }
        None if kind == KmsKind::Local => {
            anyhow::bail!("IVF_VAULT_LOCAL_MASTER_KEY is required for persistent storage with the Local KMS")
        }
        None => None,
    };
    // No cloud SDK clients ship with the daemon; remote kinds fail here.
    let kms = KmsBackend::build(kind, SettingsStore::new(storage.clone()), root, None)
        .with_context(|| format!("failed to initialise {kind} KMS"))?;

    let max_session_age = chrono::Duration::try_hours(config.session_max_age_hours)
        .with_context(|| format!("session max age of {} hours is out of range", config.session_max_age_hours))?;
    let mut options = VaultOptions::new(Arc::new(kms))
        .cae(CaeConfig {
            max_session_age,
            ..CaeConfig::default()
        })
        .require_unseal(config.require_unseal);
    if let Some(db) = &config.db_rotation {
        options = options.db_rotation(DbRotationTarget {
            target: db.target(),
            ttl_seconds: db.credential_ttl_secs,
        });
    }
    options = options_fn(options);

    let vault = Vault::new(storage, options);
    let sink = config.audit_file_path.as_ref().map(|path| {
        info!(path = %path, "file audit enabled");
        Arc::new(FileAuditSink::new(path)) as Arc<dyn AuditSink>
    });
    vault.init(sink).await.context("vault initialisation failed")?;
    Ok(vault)
}

type OptionsFn = Box<dyn FnMut(VaultOptions) -> VaultOptions + Send>;

/// Storage plus a hook that swaps in collaborators bound to it.
async fn open_storage(config: &VaultConfig) -> anyhow::Result<(Arc<dyn StorageBackend>, OptionsFn)> {
    match &config.storage_backend {
        StorageBackendType::Memory => {
            info!("using in-memory storage (data will not persist)");
            Ok((Arc::new(MemoryBackend::new()), Box::new(|o| o)))
        }
        #[cfg(feature = "postgres")]
        StorageBackendType::Postgres { url } => {
            use ivf_vault_core::dynamic::PgRoleExecutor;
            use ivf_vault_core::table_source::PgTableSource;

            info!(url = %"[redacted]", "using PostgreSQL storage");
            let backend = ivf_vault_storage::PostgresBackend::connect(url)
                .await
                .context("failed to connect to PostgreSQL storage")?;
            let rows = Arc::new(PgTableSource::new(backend.pool().clone()));
            Ok((
                Arc::new(backend),
                Box::new(move |o: VaultOptions| o.roles(Arc::new(PgRoleExecutor)).rows(rows.clone())),
            ))
        }
        #[cfg(not(feature = "postgres"))]
        StorageBackendType::Postgres { .. } => {
            anyhow::bail!("PostgreSQL storage requested but feature 'postgres' is not enabled");
        }
    }
}
