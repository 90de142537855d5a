//! `ivf-vault` entry point.
//!
//! `run` unseals the vault and drives the maintenance worker until SIGINT or
//! SIGTERM. The other subcommands are single-shot operator actions that
//! print a JSON result on stdout. Logs go to stderr as JSON.

#![allow(clippy::print_stdout)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ivf_vault_core::Vault;
use ivf_vault_core::dek::DEFAULT_BATCH_SIZE;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use ivf_vault_daemon::bootstrap::build_vault;
use ivf_vault_daemon::config::VaultConfig;
use ivf_vault_daemon::worker::maintenance_worker;

#[derive(Parser)]
#[command(
    name = "ivf-vault",
    version,
    about = "IVF vault daemon: maintenance sweeps, key and credential rotation, unseal, backup",
    long_about = None,
    after_help = "Configuration is read from IVF_VAULT_* environment variables \
                  (IVF_VAULT_STORAGE, IVF_VAULT_KMS_PROVIDER, IVF_VAULT_LOCAL_MASTER_KEY, \
                  IVF_VAULT_DB_HOST, IVF_VAULT_AUDIT_FILE, ...)."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Unseal, then run the maintenance worker until interrupted.
    Run {
        /// Seconds between maintenance sweeps.
        #[arg(long, env = "IVF_VAULT_MAINTENANCE_INTERVAL")]
        interval: Option<u64>,
        /// Configure the default unseal provider from this password first.
        #[arg(long, env = "IVF_VAULT_MASTER_PASSWORD", hide_env_values = true)]
        master_password: Option<String>,
    },
    /// Run one maintenance sweep and print the report.
    Sweep,
    /// Rotate the dual-slot database credentials once.
    RotateDb,
    /// Rotate the data encryption key for a purpose.
    RotateDek {
        /// DEK purpose, e.g. `patient`.
        purpose: String,
    },
    /// Re-encrypt a table's configured fields under the current DEK.
    Reencrypt {
        table: String,
        purpose: String,
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,
    },
    /// Try every unseal provider in priority order.
    Unseal {
        /// Configure the default provider from this password first.
        #[arg(long, env = "IVF_VAULT_MASTER_PASSWORD", hide_env_values = true)]
        master_password: Option<String>,
    },
    /// Write an encrypted backup of secrets, policies, settings and key
    /// configuration.
    Backup {
        /// Destination file.
        #[arg(long)]
        out: PathBuf,
        #[arg(long, env = "IVF_VAULT_BACKUP_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Add every record from a backup that is not already present.
    Restore {
        file: PathBuf,
        #[arg(long, env = "IVF_VAULT_BACKUP_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Check that a backup opens with the password, without restoring it.
    ValidateBackup {
        file: PathBuf,
        #[arg(long, env = "IVF_VAULT_BACKUP_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Print KMS, seal, rotation and recovery status.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = VaultConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    info!(storage = ?config.storage_backend, kms = %config.kms_provider, "ivf-vault starting");
    let vault = build_vault(&config).await?;

    match cli.command {
        Commands::Run {
            interval,
            master_password,
        } => {
            configure_default_unseal(&vault, master_password.as_deref()).await?;
            run(&vault, &config, interval.unwrap_or(config.maintenance_interval_secs)).await
        }
        Commands::Sweep => {
            let report = vault.maintenance.run_once(None).await;
            print_json(&report)?;
            anyhow::ensure!(report.is_clean(), "maintenance sweep reported failures");
            Ok(())
        }
        Commands::RotateDb => {
            let rotator = vault
                .db_rotation
                .as_ref()
                .context("database rotation is not configured (set IVF_VAULT_DB_HOST)")?;
            let result = rotator.rotate().await;
            print_json(&result)?;
            anyhow::ensure!(result.success, "database credential rotation failed");
            Ok(())
        }
        Commands::RotateDek { purpose } => {
            let result = vault.keys.rotate_dek(&purpose).await?;
            print_json(&result)?;
            anyhow::ensure!(result.success, "DEK rotation failed");
            Ok(())
        }
        Commands::Reencrypt {
            table,
            purpose,
            batch_size,
        } => {
            let result = vault.keys.re_encrypt_table(&table, &purpose, batch_size, None).await?;
            print_json(&result)?;
            anyhow::ensure!(result.success(), "re-encryption did not complete");
            Ok(())
        }
        Commands::Unseal { master_password } => {
            configure_default_unseal(&vault, master_password.as_deref()).await?;
            let result = vault.unseal.auto_unseal().await?;
            print_json(&result)?;
            anyhow::ensure!(result.success, "auto-unseal failed");
            Ok(())
        }
        Commands::Backup { out, password } => {
            let result = vault.dr.backup(&password, Some("operator")).await?;
            tokio::fs::write(&out, &result.data)
                .await
                .with_context(|| format!("failed to write backup to {}", out.display()))?;
            print_json(&BackupOutput {
                path: out.display().to_string(),
                bytes: result.data.len(),
                backup: &result,
            })
        }
        Commands::Restore { file, password } => {
            let data = read_backup(&file).await?;
            let result = vault.dr.restore(&data, &password, Some("operator")).await?;
            print_json(&result)
        }
        Commands::ValidateBackup { file, password } => {
            let data = read_backup(&file).await?;
            let result = vault.dr.validate_backup(&data, &password);
            print_json(&result)?;
            anyhow::ensure!(result.valid, "backup is not valid");
            Ok(())
        }
        Commands::Status => print_json(&status(&vault).await?),
    }
}

async fn configure_default_unseal(vault: &Vault, master_password: Option<&str>) -> anyhow::Result<()> {
    if let Some(password) = master_password {
        vault
            .unseal
            .configure_default(password, Some("operator"))
            .await
            .context("failed to configure default unseal")?;
    }
    Ok(())
}

async fn run(vault: &Vault, config: &VaultConfig, interval_secs: u64) -> anyhow::Result<()> {
    let unsealed = vault.unseal.auto_unseal().await?;
    if unsealed.success {
        info!(provider = ?unsealed.provider_id, attempts = unsealed.attempts_total, "vault unsealed");
    } else {
        warn!(error = ?unsealed.error, "auto-unseal failed, continuing sealed");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(maintenance_worker(
        vault.maintenance.clone(),
        vault.db_rotation.clone(),
        config.db_rotation.as_ref().map_or(0, |db| db.credential_ttl_secs),
        shutdown_rx,
        interval_secs.max(1),
    ));

    shutdown_signal(shutdown_tx).await;

    info!("waiting for maintenance worker to stop");
    if tokio::time::timeout(Duration::from_secs(10), worker).await.is_err() {
        warn!("maintenance worker did not stop in time");
    }
    vault.unseal.seal_state().seal().await;
    info!("ivf-vault stopped");
    Ok(())
}

async fn read_backup(file: &std::path::Path) -> anyhow::Result<Vec<u8>> {
    tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read backup {}", file.display()))
}

#[derive(Serialize)]
struct BackupOutput<'a> {
    path: String,
    bytes: usize,
    #[serde(flatten)]
    backup: &'a ivf_vault_core::dr::BackupResult,
}

#[derive(Serialize)]
struct Status {
    kms_provider: String,
    kms_healthy: bool,
    sealed: bool,
    unseal_providers: Vec<ivf_vault_core::unseal::ProviderStatus>,
    db_rotation: Option<ivf_vault_core::db_rotation::DualCredentialStatus>,
    zero_trust_policies: usize,
    dr_readiness: ivf_vault_core::dr::DrReadiness,
}

async fn status(vault: &Vault) -> anyhow::Result<Status> {
    let db_rotation = match &vault.db_rotation {
        Some(rotator) => Some(rotator.status().await?),
        None => None,
    };
    Ok(Status {
        kms_provider: vault.kms.provider_name().to_owned(),
        kms_healthy: vault.kms.is_healthy().await,
        sealed: !vault.unseal.seal_state().is_unsealed().await,
        unseal_providers: vault.unseal.provider_status().await?,
        db_rotation,
        zero_trust_policies: vault.zero_trust.policies().await?.len(),
        dr_readiness: vault.dr.readiness().await?,
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{out}");
    Ok(())
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping");
    let _ = shutdown_tx.send(true);
}
