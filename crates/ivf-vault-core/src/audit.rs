//! Append-only audit trail.
//!
//! Every mutating vault operation records an [`AuditEntry`]. Entries are
//! written to storage with a create-only insert under a time-ordered key, so
//! an existing entry is never overwritten. Registered [`AuditSink`]s (such as
//! the JSON-lines [`FileAuditSink`](crate::audit_file::FileAuditSink)) get a
//! copy after the entry is persisted.
//!
//! Storage is the source of truth: if the persist fails the caller gets the
//! error. A failing sink is logged and skipped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ivf_vault_storage::StorageBackend;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::error::AuditError;
use crate::store::JsonStore;

/// Storage prefix for audit entries.
const AUDIT_PREFIX: &str = "sys/audit/";

/// A single audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Dotted action name, e.g. `lease.create`, `dek.rotate`.
    pub action: String,
    /// Kind of entity acted on, e.g. `Lease`, `DEK`, `Table`.
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    /// Structured details. Never contains secret values.
    pub details: Option<serde_json::Value>,
}

impl AuditEntry {
    /// Start an entry for `action` on an entity of `entity_type`.
    #[must_use]
    pub fn new(action: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action: action.into(),
            entity_type: entity_type.into(),
            entity_id: None,
            user_id: None,
            ip_address: None,
            details: None,
        }
    }

    #[must_use]
    pub fn entity(mut self, id: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn user(mut self, user_id: Option<&str>) -> Self {
        self.user_id = user_id.map(str::to_owned);
        self
    }

    #[must_use]
    pub fn ip(mut self, ip: Option<&str>) -> Self {
        self.ip_address = ip.map(str::to_owned);
        self
    }

    #[must_use]
    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    fn storage_key(&self) -> String {
        format!(
            "{AUDIT_PREFIX}{}-{}",
            self.timestamp.format("%Y%m%dT%H%M%S%.9fZ"),
            self.id
        )
    }
}

/// A secondary destination for audit entries.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    /// The sink's name, for error reporting.
    fn name(&self) -> &str;

    /// Write an entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry could not be written.
    async fn log(&self, entry: &AuditEntry) -> Result<(), AuditError>;
}

/// Append-only audit trail backed by storage.
pub struct AuditTrail {
    store: JsonStore,
    sinks: RwLock<Vec<Arc<dyn AuditSink>>>,
}

impl AuditTrail {
    /// Create an audit trail over the given backend.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            store: JsonStore::new(storage),
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Register an additional sink.
    pub async fn add_sink(&self, sink: Arc<dyn AuditSink>) {
        self.sinks.write().await.push(sink);
    }

    /// Persist an entry, then fan it out to the sinks.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Store`] if the entry could not be persisted.
    pub async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let mut entry = entry;
        // Key collision means two entries with the same timestamp and id;
        // regenerate the id rather than overwrite.
        while !self.store.put_if_absent(&entry.storage_key(), &entry).await? {
            entry.id = Uuid::new_v4();
        }

        let sinks = self.sinks.read().await;
        for sink in sinks.iter() {
            if let Err(e) = sink.log(&entry).await {
                warn!(sink = sink.name(), action = %entry.action, error = %e, "audit sink failed");
            }
        }
        Ok(())
    }

    /// Most recent entries first, optionally restricted to actions starting
    /// with `action_prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Store`] if the entries cannot be read.
    pub async fn recent(&self, limit: usize, action_prefix: Option<&str>) -> Result<Vec<AuditEntry>, AuditError> {
        let keys = self.store.list(AUDIT_PREFIX).await?;
        let mut out = Vec::new();
        for key in keys.iter().rev() {
            if out.len() >= limit {
                break;
            }
            let Some(entry) = self.store.get::<AuditEntry>(key).await? else {
                continue;
            };
            if action_prefix.is_none_or(|p| entry.action.starts_with(p)) {
                out.push(entry);
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ivf_vault_storage::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink(AtomicUsize);

    #[async_trait::async_trait]
    impl AuditSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }

        async fn log(&self, _entry: &AuditEntry) -> Result<(), AuditError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait::async_trait]
    impl AuditSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn log(&self, _entry: &AuditEntry) -> Result<(), AuditError> {
            Err(AuditError::SinkFailure {
                name: "failing".to_owned(),
                reason: "disk full".to_owned(),
            })
        }
    }

    #[tokio::test]
    async fn record_then_recent_newest_first() {
        let trail = AuditTrail::new(Arc::new(MemoryBackend::new()));
        trail.record(AuditEntry::new("lease.create", "Lease").entity("l1")).await.unwrap();
        trail.record(AuditEntry::new("lease.revoke", "Lease").entity("l1")).await.unwrap();

        let recent = trail.recent(10, None).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].action, "lease.revoke");
        assert_eq!(recent[1].action, "lease.create");
    }

    #[tokio::test]
    async fn recent_filters_by_action_prefix() {
        let trail = AuditTrail::new(Arc::new(MemoryBackend::new()));
        trail.record(AuditEntry::new("lease.create", "Lease")).await.unwrap();
        trail.record(AuditEntry::new("dek.rotate", "DEK")).await.unwrap();
        let dek = trail.recent(10, Some("dek.")).await.unwrap();
        assert_eq!(dek.len(), 1);
        assert_eq!(dek[0].entity_type, "DEK");
    }

    #[tokio::test]
    async fn failing_sink_does_not_fail_record() {
        let trail = AuditTrail::new(Arc::new(MemoryBackend::new()));
        let counting = Arc::new(CountingSink(AtomicUsize::new(0)));
        trail.add_sink(Arc::new(FailingSink)).await;
        trail.add_sink(counting.clone()).await;

        trail.record(AuditEntry::new("token.create", "Token")).await.unwrap();
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
        assert_eq!(trail.recent(5, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn builder_sets_fields() {
        let entry = AuditEntry::new("secret.create", "Secret")
            .entity("config/db")
            .user(Some("u1"))
            .ip(None)
            .details(serde_json::json!({"version": 2}));
        assert_eq!(entry.entity_id.as_deref(), Some("config/db"));
        assert_eq!(entry.user_id.as_deref(), Some("u1"));
        assert!(entry.ip_address.is_none());
        assert_eq!(entry.details, Some(serde_json::json!({"version": 2})));
    }
}
