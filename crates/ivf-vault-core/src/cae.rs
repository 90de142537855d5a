//! Continuous access evaluation.
//!
//! Live sessions are re-checked instead of trusted for their whole
//! lifetime. A session is denied when it is too old, when its IP or
//! country changed, or when a fresh zero-trust check for a secret read
//! fails. Every denial publishes a high-severity security event.
//!
//! Sessions can be bound to the vault token issued for them, so that a
//! compromised session takes its token down with it.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditTrail};
use crate::error::{SessionError, TokenError};
use crate::siem::{EventPublisher, SecurityEvent, Severity};
use crate::store::SettingsStore;
use crate::token::TokenValidator;
use crate::zero_trust::{AccessContext, AccessDecider, AccessRequest, AuthLevel, ZtAction};

const BINDING_PREFIX: &str = "session-binding-";
const SOURCE: &str = "ContinuousAccessEvaluator";

/// Tunables for session re-evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaeConfig {
    pub max_session_age: Duration,
    /// Seconds a user has to complete a step-up challenge.
    pub step_up_timeout_seconds: u32,
    /// Level required for critical actions.
    pub step_up_level: AuthLevel,
    pub step_up_actions: Vec<ZtAction>,
}

impl Default for CaeConfig {
    fn default() -> Self {
        Self {
            max_session_age: Duration::hours(8),
            step_up_timeout_seconds: 300,
            step_up_level: AuthLevel::Mfa,
            step_up_actions: vec![
                ZtAction::SecretDelete,
                ZtAction::SecretExport,
                ZtAction::KeyRotate,
                ZtAction::BreakGlassAccess,
            ],
        }
    }
}

/// What is known about a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: String,
    pub user_id: String,
    pub device_id: Option<String>,
    pub ip_address: Option<String>,
    pub country: Option<String>,
    pub current_auth_level: AuthLevel,
    pub session_started_at: DateTime<Utc>,
    pub ip_changed: bool,
    pub country_changed: bool,
}

/// Outcome of a session evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaeDecision {
    pub allowed: bool,
    pub reason: String,
    pub requires_reauth: bool,
    pub required_auth_level: Option<AuthLevel>,
    pub evaluated_at: DateTime<Utc>,
}

impl CaeDecision {
    fn deny(reason: impl Into<String>, requires_reauth: bool, level: Option<AuthLevel>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            requires_reauth,
            required_auth_level: level,
            evaluated_at: Utc::now(),
        }
    }
}

/// Whether an action needs stronger authentication first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepUpRequirement {
    pub required: bool,
    pub required_level: AuthLevel,
    pub reason: String,
    /// Zero when no step-up is required.
    pub timeout_seconds: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionBinding {
    session_id: String,
    token_id: Uuid,
    user_id: String,
    bound_at: DateTime<Utc>,
}

pub struct ContinuousAccessEvaluator {
    settings: SettingsStore,
    decider: Arc<dyn AccessDecider>,
    tokens: Arc<TokenValidator>,
    events: Arc<dyn EventPublisher>,
    audit: Arc<AuditTrail>,
    config: CaeConfig,
}

impl ContinuousAccessEvaluator {
    #[must_use]
    pub fn new(
        settings: SettingsStore,
        decider: Arc<dyn AccessDecider>,
        tokens: Arc<TokenValidator>,
        events: Arc<dyn EventPublisher>,
        audit: Arc<AuditTrail>,
        config: CaeConfig,
    ) -> Self {
        Self {
            settings,
            decider,
            tokens,
            events,
            audit,
            config,
        }
    }

    /// Re-evaluate a live session.
    pub async fn evaluate_session(&self, session: &SessionContext) -> CaeDecision {
        if Utc::now() - session.session_started_at > self.config.max_session_age {
            self.publish(session, "session.expired", "Session exceeded maximum age")
                .await;
            return CaeDecision::deny(
                "Session expired: maximum age exceeded",
                true,
                Some(AuthLevel::Password),
            );
        }

        if session.ip_changed {
            self.publish(session, "session.ip_changed", "IP address changed during session")
                .await;
            return CaeDecision::deny(
                "IP address changed: re-authentication required",
                true,
                Some(AuthLevel::Password),
            );
        }

        if session.country_changed {
            self.publish(session, "session.country_changed", "Country changed during session")
                .await;
            return CaeDecision::deny(
                "Country changed: possible session hijack",
                true,
                Some(self.config.step_up_level),
            );
        }

        let context = AccessContext {
            device_id: session.device_id.clone(),
            ip_address: session.ip_address.clone(),
            country: session.country.clone(),
            ..AccessContext::new(session.user_id.clone(), session.current_auth_level)
        };
        let decision = self
            .decider
            .check_access(&AccessRequest::new(ZtAction::SecretRead, context))
            .await;
        if !decision.allowed {
            self.publish(session, "session.zt_denied", &decision.reason).await;
            return CaeDecision::deny(
                format!("Zero Trust re-evaluation failed: {}", decision.reason),
                decision.requires_step_up,
                decision.required_auth_level,
            );
        }

        CaeDecision {
            allowed: true,
            reason: "Session valid".to_owned(),
            requires_reauth: false,
            required_auth_level: None,
            evaluated_at: Utc::now(),
        }
    }

    /// Whether `action` needs step-up from `current`.
    #[must_use]
    pub fn check_step_up(&self, action: ZtAction, user_id: &str, current: AuthLevel) -> StepUpRequirement {
        if !self.config.step_up_actions.contains(&action) {
            return StepUpRequirement {
                required: false,
                required_level: current,
                reason: "No step-up required".to_owned(),
                timeout_seconds: 0,
            };
        }
        if current < self.config.step_up_level {
            info!(user_id, action = %action, current = %current, "step-up required");
            return StepUpRequirement {
                required: true,
                required_level: self.config.step_up_level,
                reason: format!("Action '{action}' requires {} authentication", self.config.step_up_level),
                timeout_seconds: self.config.step_up_timeout_seconds,
            };
        }
        StepUpRequirement {
            required: false,
            required_level: current,
            reason: "Auth level sufficient".to_owned(),
            timeout_seconds: 0,
        }
    }

    /// Remember which vault token was issued to a session.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidArgument`] for a blank session or user id.
    /// - [`SessionError::Store`] if the binding cannot be saved.
    pub async fn bind_session_token(&self, session_id: &str, token_id: Uuid, user_id: &str) -> Result<(), SessionError> {
        if session_id.trim().is_empty() || user_id.trim().is_empty() {
            return Err(SessionError::InvalidArgument {
                reason: "session id and user id are required".to_owned(),
            });
        }
        let binding = SessionBinding {
            session_id: session_id.to_owned(),
            token_id,
            user_id: user_id.to_owned(),
            bound_at: Utc::now(),
        };
        self.settings
            .set(&format!("{BINDING_PREFIX}{session_id}"), &binding)
            .await?;
        info!(session_id, token_id = %token_id, user_id, "session bound to token");
        Ok(())
    }

    /// Revoke the token bound to a session. Returns how many tokens were
    /// revoked: 0 without a binding, otherwise 1.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the token revocation or audit fails; the
    /// binding is kept so the call can be retried.
    pub async fn revoke_session_tokens(&self, session_id: &str, reason: &str) -> Result<usize, SessionError> {
        let name = format!("{BINDING_PREFIX}{session_id}");
        let Some(binding) = self.settings.get::<SessionBinding>(&name).await? else {
            return Ok(0);
        };

        let revoked = match self.tokens.revoke(binding.token_id, Some("system:cae")).await {
            Ok(newly) => usize::from(newly),
            Err(TokenError::NotFound) => 0,
            Err(e) => return Err(e.into()),
        };

        self.audit
            .record(
                AuditEntry::new("session.token.revoke", "VaultToken")
                    .entity(binding.token_id.to_string())
                    .user(Some(&binding.user_id))
                    .details(serde_json::json!({ "sessionId": session_id, "reason": reason })),
            )
            .await?;
        self.settings.delete(&name).await?;

        warn!(session_id, token_id = %binding.token_id, reason, "session token revoked");
        Ok(revoked)
    }

    async fn publish(&self, session: &SessionContext, event_type: &str, reason: &str) {
        self.events
            .publish(
                SecurityEvent::new(event_type, Severity::High, SOURCE)
                    .action("session.evaluate")
                    .user(Some(&session.user_id))
                    .ip(session.ip_address.as_deref())
                    .resource("Session", session.session_id.clone())
                    .outcome("deny")
                    .reason(reason),
            )
            .await;
    }
}

impl fmt::Debug for ContinuousAccessEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuousAccessEvaluator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::policy::PolicyEngine;
    use crate::siem::RecordingEventPublisher;
    use crate::store::JsonStore;
    use crate::token::TokenRequest;
    use crate::zero_trust::ZeroTrustEvaluator;
    use ivf_vault_storage::MemoryBackend;

    struct Fixture {
        cae: ContinuousAccessEvaluator,
        tokens: Arc<TokenValidator>,
        events: Arc<RecordingEventPublisher>,
        audit: Arc<AuditTrail>,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(MemoryBackend::new());
        let audit = Arc::new(AuditTrail::new(storage.clone()));
        let zt = Arc::new(ZeroTrustEvaluator::new(JsonStore::new(storage.clone())));
        zt.seed_defaults().await.unwrap();
        let policies = Arc::new(PolicyEngine::new(JsonStore::new(storage.clone()), audit.clone()));
        let tokens = Arc::new(TokenValidator::new(JsonStore::new(storage.clone()), policies, audit.clone()));
        let events = Arc::new(RecordingEventPublisher::new());
        let cae = ContinuousAccessEvaluator::new(
            SettingsStore::new(storage),
            zt,
            tokens.clone(),
            events.clone(),
            audit.clone(),
            CaeConfig::default(),
        );
        Fixture {
            cae,
            tokens,
            events,
            audit,
        }
    }

    fn session() -> SessionContext {
        SessionContext {
            session_id: "s-1".to_owned(),
            user_id: "u-1".to_owned(),
            device_id: Some("laptop".to_owned()),
            ip_address: Some("10.1.1.1".to_owned()),
            country: Some("VN".to_owned()),
            current_auth_level: AuthLevel::Session,
            session_started_at: Utc::now() - Duration::minutes(10),
            ip_changed: false,
            country_changed: false,
        }
    }

    #[tokio::test]
    async fn healthy_session_continues() {
        let f = fixture().await;
        let d = f.cae.evaluate_session(&session()).await;
        assert!(d.allowed, "{}", d.reason);
        assert!(f.events.events().await.is_empty());
    }

    #[tokio::test]
    async fn ip_change_denies_and_publishes_once() {
        let f = fixture().await;
        let s = SessionContext {
            ip_changed: true,
            ..session()
        };
        let d = f.cae.evaluate_session(&s).await;
        assert!(!d.allowed);
        assert!(d.requires_reauth);
        let events = f.events.of_type("session.ip_changed").await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::High);
        assert_eq!(f.events.events().await.len(), 1);
    }

    #[tokio::test]
    async fn country_change_requires_mfa() {
        let f = fixture().await;
        let s = SessionContext {
            country_changed: true,
            ..session()
        };
        let d = f.cae.evaluate_session(&s).await;
        assert!(!d.allowed);
        assert!(d.requires_reauth);
        assert_eq!(d.required_auth_level, Some(AuthLevel::Mfa));
        assert_eq!(f.events.of_type("session.country_changed").await.len(), 1);
    }

    #[tokio::test]
    async fn old_session_expires() {
        let f = fixture().await;
        let s = SessionContext {
            session_started_at: Utc::now() - Duration::hours(9),
            ip_changed: true,
            ..session()
        };
        let d = f.cae.evaluate_session(&s).await;
        assert!(!d.allowed);
        assert_eq!(f.events.of_type("session.expired").await.len(), 1);
        assert!(f.events.of_type("session.ip_changed").await.is_empty());
    }

    #[tokio::test]
    async fn zero_trust_denial_propagates() {
        let f = fixture().await;
        let s = SessionContext {
            current_auth_level: AuthLevel::Password,
            ..session()
        };
        let d = f.cae.evaluate_session(&s).await;
        assert!(!d.allowed);
        assert!(d.reason.starts_with("Zero Trust re-evaluation failed"));
        assert!(d.requires_reauth);
        assert_eq!(f.events.of_type("session.zt_denied").await.len(), 1);
    }

    #[tokio::test]
    async fn step_up_only_for_critical_actions() {
        let f = fixture().await;
        let r = f.cae.check_step_up(ZtAction::SecretRead, "u", AuthLevel::Password);
        assert!(!r.required);

        let r = f.cae.check_step_up(ZtAction::SecretDelete, "u", AuthLevel::FreshSession);
        assert!(r.required);
        assert_eq!(r.required_level, AuthLevel::Mfa);
        assert_eq!(r.timeout_seconds, 300);

        let r = f.cae.check_step_up(ZtAction::KeyRotate, "u", AuthLevel::Biometric);
        assert!(!r.required);
    }

    #[tokio::test]
    async fn revoking_unbound_session_is_zero() {
        let f = fixture().await;
        assert_eq!(f.cae.revoke_session_tokens("nope", "test").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bound_token_is_revoked_and_binding_removed() {
        let f = fixture().await;
        let issued = f.tokens.create(TokenRequest::default(), None).await.unwrap();
        f.cae.bind_session_token("s-1", issued.id, "u-1").await.unwrap();

        assert_eq!(f.cae.revoke_session_tokens("s-1", "hijack").await.unwrap(), 1);
        assert!(f.tokens.validate(&issued.token).await.unwrap().is_none());
        assert_eq!(f.audit.recent(10, Some("session.token.revoke")).await.unwrap().len(), 1);

        assert_eq!(f.cae.revoke_session_tokens("s-1", "again").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bind_rejects_blank_ids() {
        let f = fixture().await;
        assert!(matches!(
            f.cae.bind_session_token(" ", Uuid::new_v4(), "u").await,
            Err(SessionError::InvalidArgument { .. })
        ));
    }
}
