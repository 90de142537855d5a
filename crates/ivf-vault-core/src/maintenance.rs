//! Single-shot maintenance sweep.
//!
//! [`Maintenance::run_once`] revokes expired leases, dynamic credentials
//! and tokens, then executes due secret rotations. Each step is isolated:
//! a failing step is logged and recorded in the report, and the remaining
//! steps still run. Scheduling is the caller's job.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info};

use crate::dynamic::DynamicCredentialEngine;
use crate::lease::LeaseManager;
use crate::rotation_schedule::SecretRotationScheduler;
use crate::token::TokenValidator;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub leases_revoked: usize,
    pub credentials_revoked: usize,
    pub tokens_revoked: usize,
    pub rotations_succeeded: usize,
    pub rotations_failed: usize,
    pub cancelled: bool,
    /// `step: error` for each step that failed outright.
    pub errors: Vec<String>,
}

impl MaintenanceReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.rotations_failed == 0
    }
}

#[derive(Debug)]
pub struct Maintenance {
    leases: Arc<LeaseManager>,
    credentials: Arc<DynamicCredentialEngine>,
    tokens: Arc<TokenValidator>,
    rotation: Arc<SecretRotationScheduler>,
}

impl Maintenance {
    #[must_use]
    pub fn new(
        leases: Arc<LeaseManager>,
        credentials: Arc<DynamicCredentialEngine>,
        tokens: Arc<TokenValidator>,
        rotation: Arc<SecretRotationScheduler>,
    ) -> Self {
        Self {
            leases,
            credentials,
            tokens,
            rotation,
        }
    }

    /// Run every sweep once. A set `cancel` flag skips the steps that have
    /// not started yet.
    pub async fn run_once(&self, cancel: Option<&watch::Receiver<bool>>) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let cancelled = || cancel.is_some_and(|rx| *rx.borrow());

        match self.leases.revoke_expired().await {
            Ok(n) => report.leases_revoked = n,
            Err(e) => record(&mut report, "leases", &e),
        }

        if !cancelled() {
            match self.credentials.revoke_expired().await {
                Ok(n) => report.credentials_revoked = n,
                Err(e) => record(&mut report, "credentials", &e),
            }
        }

        if !cancelled() {
            match self.tokens.revoke_expired().await {
                Ok(n) => report.tokens_revoked = n,
                Err(e) => record(&mut report, "tokens", &e),
            }
        }

        if !cancelled() {
            match self.rotation.execute_pending(cancel).await {
                Ok(batch) => {
                    report.rotations_succeeded = batch.succeeded;
                    report.rotations_failed = batch.failed;
                    report.cancelled |= batch.cancelled;
                }
                Err(e) => record(&mut report, "rotations", &e),
            }
        }
        report.cancelled |= cancelled();

        info!(
            leases = report.leases_revoked,
            credentials = report.credentials_revoked,
            tokens = report.tokens_revoked,
            rotated = report.rotations_succeeded,
            rotation_failures = report.rotations_failed,
            errors = report.errors.len(),
            cancelled = report.cancelled,
            "maintenance sweep finished"
        );
        report
    }
}

fn record(report: &mut MaintenanceReport, step: &str, err: &dyn std::error::Error) {
    error!(step, error = %err, "maintenance step failed");
    report.errors.push(format!("{step}: {err}"));
}
