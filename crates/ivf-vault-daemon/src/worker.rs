//! Background maintenance worker.
//!
//! Drives [`Maintenance::run_once`] on a fixed interval and rotates the
//! database credentials when the active slot nears expiry. Only one daemon
//! per database should run this worker; rotation is single-flight within a
//! process only.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ivf_vault_core::db_rotation::{DbCredentialRotator, Slot};
use ivf_vault_core::maintenance::Maintenance;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Consecutive unclean sweeps before the worker logs at error level.
const ESCALATE_AFTER: u32 = 5;

/// Run until `shutdown` flips to `true`.
pub async fn maintenance_worker(
    maintenance: Arc<Maintenance>,
    db_rotation: Option<Arc<DbCredentialRotator>>,
    credential_ttl_secs: i64,
    mut shutdown: watch::Receiver<bool>,
    interval_secs: u64,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    let mut consecutive_failures: u32 = 0;
    info!(interval_secs, db_rotation = db_rotation.is_some(), "maintenance worker started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if *shutdown.borrow() {
                    break;
                }
                let report = maintenance.run_once(Some(&shutdown)).await;
                if report.cancelled {
                    break;
                }
                if report.is_clean() {
                    consecutive_failures = 0;
                } else {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    if consecutive_failures >= ESCALATE_AFTER {
                        error!(
                            consecutive_failures,
                            errors = ?report.errors,
                            "maintenance persistently failing, storage may be down"
                        );
                    } else {
                        warn!(consecutive_failures, errors = ?report.errors, "maintenance sweep had failures");
                    }
                }

                if let Some(rotator) = &db_rotation {
                    rotate_if_due(rotator, credential_ttl_secs).await;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("maintenance worker shutting down");
}

/// Rotate when no slot is active yet or the active credential has less than
/// half its TTL left.
pub async fn rotate_if_due(rotator: &DbCredentialRotator, credential_ttl_secs: i64) -> bool {
    let status = match rotator.status().await {
        Ok(status) => status,
        Err(e) => {
            warn!(error = %e, "failed to read db rotation status");
            return false;
        }
    };
    let active = match status.active_slot {
        Slot::A => &status.slot_a,
        Slot::B => &status.slot_b,
    };
    let due = active
        .expires_at
        .is_none_or(|expires| (expires - Utc::now()).num_seconds() < credential_ttl_secs / 2);
    if !due {
        return false;
    }

    let result = rotator.rotate().await;
    if result.success {
        info!(slot = ?result.active_slot, rotation_count = result.rotation_count, "db credentials rotated");
    } else {
        error!(error = ?result.error, "scheduled db credential rotation failed");
    }
    result.success
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ivf_vault_core::crypto::EncryptionKey;
    use ivf_vault_core::db_rotation::DbRotationTarget;
    use ivf_vault_core::dynamic::DbTarget;
    use ivf_vault_core::kms::LocalKms;
    use ivf_vault_core::store::SettingsStore;
    use ivf_vault_core::{Vault, VaultOptions};
    use ivf_vault_storage::{MemoryBackend, StorageBackend};

    fn vault() -> Vault {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let kms = Arc::new(LocalKms::new(SettingsStore::new(storage.clone()), EncryptionKey::generate()));
        let target = DbTarget {
            host: "db.ivf.local".to_owned(),
            port: 5432,
            database: "ivf_db".to_owned(),
            admin_username: "postgres".to_owned(),
            admin_password: "pw".to_owned(),
        };
        Vault::new(storage, VaultOptions::new(kms).db_rotation(DbRotationTarget::new(target)))
    }

    #[tokio::test]
    async fn first_check_rotates_then_waits() {
        let v = vault();
        let rotator = v.db_rotation.clone().unwrap();
        assert!(rotate_if_due(&rotator, 86_400).await);
        assert!(!rotate_if_due(&rotator, 86_400).await);
        assert_eq!(rotator.status().await.unwrap().rotation_count, 1);
    }

    #[tokio::test]
    async fn worker_stops_on_shutdown() {
        let v = vault();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(maintenance_worker(
            v.maintenance.clone(),
            v.db_rotation.clone(),
            86_400,
            rx,
            3600,
        ));
        // The immediate first tick rotates once.
        let rotator = v.db_rotation.clone().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while rotator.status().await.unwrap().rotation_count == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rotator.status().await.unwrap().rotation_count, 1);
    }
}
