//! Scheduled rotation of static secrets.
//!
//! A schedule says how often a secret gets a fresh random value. Rotation
//! writes the new value as the next version through [`SecretStore`], so
//! the old value stays readable by version for the grace period and
//! beyond. Due schedules are run by [`SecretRotationScheduler::execute_pending`],
//! which an external timer calls; this module keeps no timer of its own.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::audit::{AuditEntry, AuditTrail};
use crate::crypto;
use crate::error::RotationError;
use crate::secret::{SecretStore, normalize_path};
use crate::store::JsonStore;

const SCHEDULE_PREFIX: &str = "sys/rotation-schedules/";
const GENERATED_BYTES: usize = 32;

/// Longest accepted rotation interval (about a century).
pub const MAX_INTERVAL_DAYS: u32 = 36_500;

/// Requested schedule parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationConfig {
    pub interval_days: u32,
    pub grace_period_hours: u32,
    pub automatic: bool,
    /// Free-form; only `generate` is executed here.
    pub strategy: Option<String>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            interval_days: 30,
            grace_period_hours: 24,
            automatic: true,
            strategy: None,
        }
    }
}

/// A persisted rotation schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationSchedule {
    pub secret_path: String,
    pub interval_days: u32,
    pub grace_period_hours: u32,
    pub automatic: bool,
    pub strategy: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_rotated_at: Option<DateTime<Utc>>,
    pub next_rotation_at: DateTime<Utc>,
}

impl RotationSchedule {
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.automatic && now >= self.next_rotation_at
    }

    /// Stored intervals beyond the calendar push the next rotation to the
    /// end of time instead of overflowing.
    fn reschedule_from(&mut self, from: DateTime<Utc>) {
        self.next_rotation_at = Duration::try_days(i64::from(self.interval_days))
            .and_then(|interval| from.checked_add_signed(interval))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }
}

/// Outcome of rotating one secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationResult {
    pub success: bool,
    pub secret_path: String,
    pub new_version: Option<u32>,
    pub old_version: Option<u32>,
    pub error: Option<String>,
    pub rotated_at: DateTime<Utc>,
}

/// Outcome of a pending-rotation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationBatchResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub results: Vec<RotationResult>,
}

/// One past rotation, read back from the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationHistoryEntry {
    pub secret_path: String,
    pub old_version: u32,
    pub new_version: u32,
    pub rotated_at: DateTime<Utc>,
    pub triggered_by: Option<String>,
}

fn schedule_key(path: &str) -> String {
    format!("{SCHEDULE_PREFIX}{path}")
}

pub struct SecretRotationScheduler {
    store: JsonStore,
    secrets: Arc<SecretStore>,
    audit: Arc<AuditTrail>,
}

impl SecretRotationScheduler {
    #[must_use]
    pub fn new(store: JsonStore, secrets: Arc<SecretStore>, audit: Arc<AuditTrail>) -> Self {
        Self { store, secrets, audit }
    }

    /// Create or update the schedule for `path`.
    ///
    /// # Errors
    ///
    /// - [`RotationError::InvalidArgument`] for an interval outside
    ///   `1..=MAX_INTERVAL_DAYS` or a bad path.
    /// - [`RotationError::Secret`] if a new schedule names a missing secret.
    pub async fn set_schedule(
        &self,
        path: &str,
        config: RotationConfig,
        user_id: Option<&str>,
    ) -> Result<RotationSchedule, RotationError> {
        if !(1..=MAX_INTERVAL_DAYS).contains(&config.interval_days) {
            return Err(RotationError::InvalidArgument {
                reason: format!("rotation interval must be between 1 and {MAX_INTERVAL_DAYS} days"),
            });
        }
        let path = normalize_path(path)?;
        let key = schedule_key(&path);
        let now = Utc::now();

        let (schedule, action) = match self.store.get::<RotationSchedule>(&key).await? {
            Some(mut existing) => {
                existing.interval_days = config.interval_days;
                existing.grace_period_hours = config.grace_period_hours;
                existing.automatic = config.automatic;
                if let Some(strategy) = config.strategy {
                    existing.strategy = strategy;
                }
                existing.active = true;
                existing.reschedule_from(existing.last_rotated_at.unwrap_or(existing.created_at));
                (existing, "rotation.schedule.updated")
            }
            None => {
                self.secrets.latest_record(&path).await?;
                let mut schedule = RotationSchedule {
                    secret_path: path.clone(),
                    interval_days: config.interval_days,
                    grace_period_hours: config.grace_period_hours,
                    automatic: config.automatic,
                    strategy: config.strategy.unwrap_or_else(|| "generate".to_owned()),
                    active: true,
                    created_at: now,
                    last_rotated_at: None,
                    next_rotation_at: now,
                };
                schedule.reschedule_from(now);
                (schedule, "rotation.schedule.created")
            }
        };
        self.store.put(&key, &schedule).await?;

        self.audit
            .record(
                AuditEntry::new(action, "SecretRotationSchedule")
                    .entity(path.clone())
                    .user(user_id)
                    .details(serde_json::json!({
                        "intervalDays": schedule.interval_days,
                        "gracePeriodHours": schedule.grace_period_hours,
                        "automatic": schedule.automatic,
                    })),
            )
            .await?;
        info!(path = %path, interval_days = schedule.interval_days, action, "rotation schedule saved");
        Ok(schedule)
    }

    /// Deactivate the schedule for `path`. Returns `false` if there was none.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::Store`] or [`RotationError::Audit`] on failure.
    pub async fn remove_schedule(&self, path: &str, user_id: Option<&str>) -> Result<bool, RotationError> {
        let path = normalize_path(path)?;
        let key = schedule_key(&path);
        let Some(mut schedule) = self.store.get::<RotationSchedule>(&key).await? else {
            return Ok(false);
        };
        schedule.active = false;
        self.store.put(&key, &schedule).await?;
        self.audit
            .record(
                AuditEntry::new("rotation.schedule.removed", "SecretRotationSchedule")
                    .entity(path.clone())
                    .user(user_id),
            )
            .await?;
        info!(path = %path, "rotation schedule deactivated");
        Ok(true)
    }

    /// The schedule for `path`, active or not.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::NotFound`] if none exists.
    pub async fn schedule(&self, path: &str) -> Result<RotationSchedule, RotationError> {
        let path = normalize_path(path)?;
        self.store
            .get(&schedule_key(&path))
            .await?
            .ok_or(RotationError::NotFound { path })
    }

    /// Active schedules.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::Store`] if storage fails.
    pub async fn schedules(&self) -> Result<Vec<RotationSchedule>, RotationError> {
        Ok(self
            .store
            .scan::<RotationSchedule>(SCHEDULE_PREFIX)
            .await?
            .into_iter()
            .filter(|s| s.active)
            .collect())
    }

    /// Write a fresh random value as the next version of `path`.
    ///
    /// Rotation failures are returned as `success: false` and audited as
    /// `rotation.failed`.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::Audit`] only if the audit entry cannot be
    /// written.
    pub async fn rotate_now(&self, path: &str, triggered_by: Option<&str>) -> Result<RotationResult, RotationError> {
        match self.try_rotate(path, triggered_by).await {
            Ok((old_version, new_version)) => {
                self.audit
                    .record(
                        AuditEntry::new("rotation.executed", "VaultSecret")
                            .entity(path)
                            .user(triggered_by)
                            .details(serde_json::json!({
                                "oldVersion": old_version,
                                "newVersion": new_version,
                            })),
                    )
                    .await?;
                info!(path, old_version, new_version, "secret rotated");
                Ok(RotationResult {
                    success: true,
                    secret_path: path.to_owned(),
                    new_version: Some(new_version),
                    old_version: Some(old_version),
                    error: None,
                    rotated_at: Utc::now(),
                })
            }
            Err(e) => {
                error!(path, error = %e, "secret rotation failed");
                self.audit
                    .record(
                        AuditEntry::new("rotation.failed", "VaultSecret")
                            .entity(path)
                            .user(triggered_by)
                            .details(serde_json::json!({ "error": e.to_string() })),
                    )
                    .await?;
                Ok(RotationResult {
                    success: false,
                    secret_path: path.to_owned(),
                    new_version: None,
                    old_version: None,
                    error: Some(e.to_string()),
                    rotated_at: Utc::now(),
                })
            }
        }
    }

    async fn try_rotate(&self, path: &str, triggered_by: Option<&str>) -> Result<(u32, u32), RotationError> {
        let path = normalize_path(path)?;
        let current = self.secrets.latest_record(&path).await?;
        let value = crypto::encode_b64(&crypto::random_bytes(GENERATED_BYTES));
        let now = Utc::now();
        let written = self
            .secrets
            .put(
                &path,
                &value,
                triggered_by,
                Some(serde_json::json!({
                    "rotatedAt": now,
                    "triggeredBy": triggered_by,
                    "previousVersion": current.version,
                    "rotationType": "automatic",
                })),
            )
            .await?;

        let key = schedule_key(&path);
        if let Some(mut schedule) = self.store.get::<RotationSchedule>(&key).await? {
            schedule.last_rotated_at = Some(now);
            schedule.reschedule_from(now);
            self.store.put(&key, &schedule).await?;
        }
        Ok((current.version, written.version))
    }

    /// Rotate every due schedule. Each rotation is isolated; a set
    /// `cancel` flag stops the run between items.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::Store`] if schedules cannot be listed, or
    /// [`RotationError::Audit`] if a rotation cannot be audited.
    pub async fn execute_pending(
        &self,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<RotationBatchResult, RotationError> {
        let now = Utc::now();
        let due: Vec<RotationSchedule> = self
            .schedules()
            .await?
            .into_iter()
            .filter(|s| s.is_due(now))
            .collect();

        let mut batch = RotationBatchResult {
            total: due.len(),
            ..RotationBatchResult::default()
        };
        for schedule in due {
            if cancel.is_some_and(|rx| *rx.borrow()) {
                warn!(remaining = batch.total - batch.results.len(), "pending rotations cancelled");
                batch.cancelled = true;
                break;
            }
            let result = self.rotate_now(&schedule.secret_path, None).await?;
            if result.success {
                batch.succeeded += 1;
            } else {
                batch.failed += 1;
            }
            batch.results.push(result);
        }
        if batch.total > 0 {
            info!(
                total = batch.total,
                succeeded = batch.succeeded,
                failed = batch.failed,
                "rotation batch complete"
            );
        }
        Ok(batch)
    }

    /// Recent successful rotations of `path`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::Audit`] if the audit trail cannot be read.
    pub async fn history(&self, path: &str, limit: usize) -> Result<Vec<RotationHistoryEntry>, RotationError> {
        let path = normalize_path(path)?;
        let entries = self.audit.recent(usize::MAX, Some("rotation.executed")).await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.entity_id.as_deref() == Some(path.as_str()))
            .take(limit)
            .map(|e| {
                let version = |field: &str| {
                    e.details
                        .as_ref()
                        .and_then(|d| d.get(field))
                        .and_then(serde_json::Value::as_u64)
                        .and_then(|v| u32::try_from(v).ok())
                        .unwrap_or(0)
                };
                RotationHistoryEntry {
                    secret_path: path.clone(),
                    old_version: version("oldVersion"),
                    new_version: version("newVersion"),
                    rotated_at: e.timestamp,
                    triggered_by: e.user_id.clone(),
                }
            })
            .collect())
    }

    #[cfg(test)]
    async fn overwrite(&self, schedule: &RotationSchedule) {
        #[allow(clippy::unwrap_used)]
        self.store
            .put(&schedule_key(&schedule.secret_path), schedule)
            .await
            .unwrap();
    }
}

impl fmt::Debug for SecretRotationScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretRotationScheduler").finish_non_exhaustive()
    }
}
