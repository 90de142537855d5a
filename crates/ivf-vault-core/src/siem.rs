//! Security event emission for SIEM ingestion.
//!
//! Components that observe a security-relevant outcome (session hijack
//! signals, unseal failure) publish a [`SecurityEvent`] through an
//! [`EventPublisher`]. The default publisher writes two structured log lines
//! per event: a key/value summary and a CEF rendering from [`format_cef`].

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Event severity. The numeric value is the CEF severity field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Severity {
    /// CEF severity number.
    #[must_use]
    pub fn cef_level(self) -> u8 {
        self as u8
    }
}

/// A security event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_type: String,
    pub severity: Severity,
    pub source: String,
    pub action: String,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub outcome: Option<String>,
    pub reason: Option<String>,
    /// Extra CEF key/value pairs, rendered in key order.
    pub extensions: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl SecurityEvent {
    /// Create an event. `action` defaults to the event type.
    #[must_use]
    pub fn new(event_type: impl Into<String>, severity: Severity, source: impl Into<String>) -> Self {
        let event_type = event_type.into();
        Self {
            action: event_type.clone(),
            event_type,
            severity,
            source: source.into(),
            user_id: None,
            ip_address: None,
            resource_type: None,
            resource_id: None,
            outcome: None,
            reason: None,
            extensions: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
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
    pub fn resource(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    #[must_use]
    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }
}

/// Escape CEF metacharacters. Backslash first so later escapes survive.
fn escape_cef(value: &str) -> String {
    value.replace('\\', "\\\\").replace('|', "\\|").replace('=', "\\=")
}

/// Render an event in Common Event Format (without the `CEF:` prefix).
///
/// `0|IVF|VaultSecurity|1.0|<eventType>|<action>|<severity>|<extensions>`
#[must_use]
pub fn format_cef(event: &SecurityEvent) -> String {
    let mut out = String::with_capacity(256);
    let _ = write!(
        out,
        "0|IVF|VaultSecurity|1.0|{}|{}|{}|",
        escape_cef(&event.event_type),
        escape_cef(&event.action),
        event.severity.cef_level()
    );
    if let Some(v) = &event.user_id {
        let _ = write!(out, "suid={} ", escape_cef(v));
    }
    if let Some(v) = &event.ip_address {
        let _ = write!(out, "src={} ", escape_cef(v));
    }
    if let Some(v) = &event.resource_type {
        let _ = write!(out, "cs1={} cs1Label=ResourceType ", escape_cef(v));
    }
    if let Some(v) = &event.resource_id {
        let _ = write!(out, "cs2={} cs2Label=ResourceId ", escape_cef(v));
    }
    if let Some(v) = &event.outcome {
        let _ = write!(out, "outcome={} ", escape_cef(v));
    }
    if let Some(v) = &event.reason {
        let _ = write!(out, "reason={} ", escape_cef(v));
    }
    let _ = write!(
        out,
        "rt={}",
        event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    );
    for (k, v) in &event.extensions {
        let _ = write!(out, " {}={}", escape_cef(k), escape_cef(v));
    }
    out
}

/// Destination for security events.
#[async_trait::async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event. Publishing never fails the caller's operation.
    async fn publish(&self, event: SecurityEvent);

    /// Publish several events in order.
    async fn publish_batch(&self, events: Vec<SecurityEvent>) {
        for event in events {
            self.publish(event).await;
        }
    }
}

/// Publishes events as structured `tracing` lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventPublisher;

#[async_trait::async_trait]
impl EventPublisher for TracingEventPublisher {
    async fn publish(&self, event: SecurityEvent) {
        warn!(
            event_type = %event.event_type,
            severity = ?event.severity,
            source = %event.source,
            action = %event.action,
            user_id = event.user_id.as_deref().unwrap_or(""),
            ip = event.ip_address.as_deref().unwrap_or(""),
            outcome = event.outcome.as_deref().unwrap_or(""),
            "security event"
        );
        info!(cef = %format_cef(&event), "CEF");
    }
}

/// Keeps published events in memory. Used by tests and by the daemon's
/// status command.
#[derive(Debug, Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<SecurityEvent>>,
}

impl RecordingEventPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far.
    pub async fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().await.clone()
    }

    /// Events with the given type.
    pub async fn of_type(&self, event_type: &str) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, event: SecurityEvent) {
        self.events.lock().await.push(event);
    }
}
