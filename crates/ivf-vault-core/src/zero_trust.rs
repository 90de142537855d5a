//! Zero-trust access decisions for sensitive vault actions.
//!
//! Each [`ZtAction`] has one [`ZtPolicy`] describing the minimum auth
//! level, the highest tolerated device risk, and optional device, session,
//! geo and network requirements. [`ZeroTrustEvaluator::check_access`] runs
//! every check, collects the failures, and denies if any remain after an
//! allowed break-glass override.
//!
//! Decisions fail closed: if policies cannot be loaded the request is
//! denied.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::StoreError;
use crate::store::JsonStore;

const ZT_POLICY_PREFIX: &str = "sys/zt-policies/";
const DEVICE_PREFIX: &str = "sys/devices/";

/// Password verification younger than this counts as a fresh session.
pub const FRESH_SESSION_MINUTES: i64 = 15;

/// How strongly the caller has authenticated, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AuthLevel {
    None,
    Password,
    Session,
    FreshSession,
    Mfa,
    Biometric,
}

impl FromStr for AuthLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "password" => Ok(Self::Password),
            "session" => Ok(Self::Session),
            "freshsession" | "fresh_session" => Ok(Self::FreshSession),
            "mfa" => Ok(Self::Mfa),
            "biometric" => Ok(Self::Biometric),
            other => Err(format!("unknown auth level '{other}'")),
        }
    }
}

impl fmt::Display for AuthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "None",
            Self::Password => "Password",
            Self::Session => "Session",
            Self::FreshSession => "FreshSession",
            Self::Mfa => "MFA",
            Self::Biometric => "Biometric",
        };
        f.write_str(s)
    }
}

/// Device risk bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Bucket a risk score: 70+ critical, 50+ high, 30+ medium.
    #[must_use]
    pub fn from_score(score: u32) -> Self {
        match score {
            70.. => Self::Critical,
            50..=69 => Self::High,
            30..=49 => Self::Medium,
            _ => Self::Low,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Vault actions guarded by zero-trust policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZtAction {
    VaultUnseal,
    SecretRead,
    SecretWrite,
    SecretDelete,
    SecretExport,
    KeyRotate,
    BreakGlassAccess,
}

impl ZtAction {
    pub const ALL: [Self; 7] = [
        Self::VaultUnseal,
        Self::SecretRead,
        Self::SecretWrite,
        Self::SecretDelete,
        Self::SecretExport,
        Self::KeyRotate,
        Self::BreakGlassAccess,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VaultUnseal => "VaultUnseal",
            Self::SecretRead => "SecretRead",
            Self::SecretWrite => "SecretWrite",
            Self::SecretDelete => "SecretDelete",
            Self::SecretExport => "SecretExport",
            Self::KeyRotate => "KeyRotate",
            Self::BreakGlassAccess => "BreakGlassAccess",
        }
    }
}

impl fmt::Display for ZtAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requirements for one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZtPolicy {
    pub action: ZtAction,
    pub required_auth_level: AuthLevel,
    pub max_allowed_risk: RiskLevel,
    pub require_trusted_device: bool,
    pub require_fresh_session: bool,
    pub block_anomaly: bool,
    pub require_geo_fence: bool,
    /// ISO country codes; only consulted when `require_geo_fence` is set.
    pub allowed_countries: Vec<String>,
    pub block_vpn_tor: bool,
    pub allow_break_glass_override: bool,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
    pub updated_by: Option<String>,
}

impl ZtPolicy {
    #[allow(clippy::fn_params_excessive_bools, clippy::too_many_arguments)]
    fn seeded(
        action: ZtAction,
        required_auth_level: AuthLevel,
        max_allowed_risk: RiskLevel,
        require_trusted_device: bool,
        require_fresh_session: bool,
        block_anomaly: bool,
        geo_fence: Option<&str>,
        block_vpn_tor: bool,
        allow_break_glass_override: bool,
    ) -> Self {
        Self {
            action,
            required_auth_level,
            max_allowed_risk,
            require_trusted_device,
            require_fresh_session,
            block_anomaly,
            require_geo_fence: geo_fence.is_some(),
            allowed_countries: geo_fence.map(|c| vec![c.to_owned()]).unwrap_or_default(),
            block_vpn_tor,
            allow_break_glass_override,
            active: true,
            updated_at: Utc::now(),
            updated_by: None,
        }
    }

    /// The reference policy set, one per action.
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        use AuthLevel as A;
        use RiskLevel as R;
        use ZtAction as Z;
        vec![
            Self::seeded(Z::VaultUnseal, A::Password, R::Medium, false, false, true, Some("VN"), false, true),
            Self::seeded(Z::SecretRead, A::Session, R::Medium, false, false, false, None, false, false),
            Self::seeded(Z::SecretWrite, A::FreshSession, R::Medium, false, true, true, None, false, true),
            Self::seeded(Z::SecretDelete, A::Password, R::Low, true, true, true, Some("VN"), true, true),
            Self::seeded(Z::SecretExport, A::Mfa, R::Low, true, true, true, Some("VN"), true, true),
            Self::seeded(Z::KeyRotate, A::Mfa, R::Low, true, true, true, Some("VN"), true, true),
            Self::seeded(Z::BreakGlassAccess, A::Biometric, R::Critical, false, false, false, None, false, false),
        ]
    }
}

/// Signals about the caller at decision time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessContext {
    pub user_id: String,
    pub device_id: Option<String>,
    pub ip_address: Option<String>,
    pub country: Option<String>,
    pub current_auth_level: AuthLevel,
    pub last_password_verification: Option<DateTime<Utc>>,
    pub has_active_anomaly: bool,
    pub is_vpn: bool,
    pub is_tor: bool,
}

impl AccessContext {
    /// A context with only the user and auth level set.
    #[must_use]
    pub fn new(user_id: impl Into<String>, current_auth_level: AuthLevel) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: None,
            ip_address: None,
            country: None,
            current_auth_level,
            last_password_verification: None,
            has_active_anomaly: false,
            is_vpn: false,
            is_tor: false,
        }
    }
}

/// A request to perform `action`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    pub action: ZtAction,
    pub context: AccessContext,
    pub use_break_glass_override: bool,
    pub break_glass_request_id: Option<String>,
}

impl AccessRequest {
    #[must_use]
    pub fn new(action: ZtAction, context: AccessContext) -> Self {
        Self {
            action,
            context,
            use_break_glass_override: false,
            break_glass_request_id: None,
        }
    }
}

/// The outcome of a zero-trust check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub action: ZtAction,
    pub reason: String,
    pub failed_checks: Vec<String>,
    pub device_risk_level: Option<RiskLevel>,
    pub device_risk_score: Option<u32>,
    /// The only failures are fixable by authenticating more strongly.
    pub requires_step_up: bool,
    pub required_auth_level: Option<AuthLevel>,
    pub break_glass_override_used: bool,
    pub decided_at: DateTime<Utc>,
}

impl AccessDecision {
    fn denied(action: ZtAction, reason: &str, check: &str) -> Self {
        Self {
            allowed: false,
            action,
            reason: reason.to_owned(),
            failed_checks: vec![check.to_owned()],
            device_risk_level: None,
            device_risk_score: None,
            requires_step_up: false,
            required_auth_level: None,
            break_glass_override_used: false,
            decided_at: Utc::now(),
        }
    }
}

/// Last-known risk for a user's device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRisk {
    pub user_id: String,
    pub device_id: String,
    pub risk_level: RiskLevel,
    pub risk_score: u32,
    pub factors: Vec<String>,
    pub trusted: bool,
    pub ip_address: Option<String>,
    pub country: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Risk score and contributing factors for a context.
#[must_use]
pub fn device_risk(ctx: &AccessContext) -> (RiskLevel, u32, Vec<String>) {
    let mut score = 0u32;
    let mut factors = Vec::new();
    if ctx.is_vpn || ctx.is_tor {
        score += 30;
        factors.push(if ctx.is_vpn { "VPN detected" } else { "Tor detected" }.to_owned());
    }
    if ctx.country.as_deref().is_none_or(str::is_empty) {
        score += 20;
        factors.push("Unknown country".to_owned());
    }
    if ctx.has_active_anomaly {
        score += 40;
        factors.push("Active anomaly detected".to_owned());
    }
    if ctx.device_id.as_deref().is_none_or(str::is_empty) {
        score += 25;
        factors.push("New/unknown device".to_owned());
    }
    (RiskLevel::from_score(score), score, factors)
}

/// Anything that can make a zero-trust decision.
#[async_trait]
pub trait AccessDecider: Send + Sync {
    /// Decide `request`. Never fails; internal errors deny.
    async fn check_access(&self, request: &AccessRequest) -> AccessDecision;
}

/// Policy-driven [`AccessDecider`] backed by the record store.
pub struct ZeroTrustEvaluator {
    store: JsonStore,
}

impl ZeroTrustEvaluator {
    #[must_use]
    pub fn new(store: JsonStore) -> Self {
        Self { store }
    }

    /// Write the reference policies for actions that have none yet.
    /// Returns how many were written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if storage fails.
    pub async fn seed_defaults(&self) -> Result<usize, StoreError> {
        let mut seeded = 0;
        for policy in ZtPolicy::defaults() {
            if self
                .store
                .put_if_absent(&format!("{ZT_POLICY_PREFIX}{}", policy.action), &policy)
                .await?
            {
                seeded += 1;
            }
        }
        if seeded > 0 {
            info!(count = seeded, "zero-trust policies seeded");
        }
        Ok(seeded)
    }

    /// The policy for `action`, if configured.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if storage fails.
    pub async fn policy(&self, action: ZtAction) -> Result<Option<ZtPolicy>, StoreError> {
        self.store.get(&format!("{ZT_POLICY_PREFIX}{action}")).await
    }

    /// All configured policies.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if storage fails.
    pub async fn policies(&self) -> Result<Vec<ZtPolicy>, StoreError> {
        self.store.scan(ZT_POLICY_PREFIX).await
    }

    /// Replace the policy for `policy.action`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if storage fails.
    pub async fn update_policy(&self, mut policy: ZtPolicy, updated_by: Option<&str>) -> Result<(), StoreError> {
        policy.updated_at = Utc::now();
        policy.updated_by = updated_by.map(str::to_owned);
        self.store
            .put(&format!("{ZT_POLICY_PREFIX}{}", policy.action), &policy)
            .await?;
        info!(action = %policy.action, "zero-trust policy updated");
        Ok(())
    }

    /// Mark a user's device as trusted (or not).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if storage fails.
    pub async fn set_device_trust(&self, user_id: &str, device_id: &str, trusted: bool) -> Result<(), StoreError> {
        let key = device_key(user_id, device_id);
        let mut device = self.store.get::<DeviceRisk>(&key).await?.unwrap_or_else(|| DeviceRisk {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            risk_level: RiskLevel::Low,
            risk_score: 0,
            factors: Vec::new(),
            trusted,
            ip_address: None,
            country: None,
            updated_at: Utc::now(),
        });
        device.trusted = trusted;
        device.updated_at = Utc::now();
        self.store.put(&key, &device).await
    }

    /// Stored risk record for a device.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if storage fails.
    pub async fn device(&self, user_id: &str, device_id: &str) -> Result<Option<DeviceRisk>, StoreError> {
        self.store.get(&device_key(user_id, device_id)).await
    }

    async fn is_trusted(&self, ctx: &AccessContext) -> Result<bool, StoreError> {
        let Some(device_id) = ctx.device_id.as_deref() else {
            return Ok(false);
        };
        Ok(self
            .device(&ctx.user_id, device_id)
            .await?
            .is_some_and(|d| d.trusted))
    }

    async fn save_device_risk(&self, ctx: &AccessContext, level: RiskLevel, score: u32, factors: &[String]) {
        let Some(device_id) = ctx.device_id.as_deref() else {
            return;
        };
        let key = device_key(&ctx.user_id, device_id);
        let result = async {
            let trusted = self.store.get::<DeviceRisk>(&key).await?.is_some_and(|d| d.trusted);
            let record = DeviceRisk {
                user_id: ctx.user_id.clone(),
                device_id: device_id.to_owned(),
                risk_level: level,
                risk_score: score,
                factors: factors.to_vec(),
                trusted,
                ip_address: ctx.ip_address.clone(),
                country: ctx.country.clone(),
                updated_at: Utc::now(),
            };
            self.store.put(&key, &record).await
        }
        .await;
        // A persistence failure must not change the decision.
        if let Err(e) = result {
            error!(user_id = %ctx.user_id, device_id, error = %e, "failed to save device risk");
        }
    }

    async fn decide(&self, request: &AccessRequest) -> Result<AccessDecision, StoreError> {
        let action = request.action;
        let Some(policy) = self.policy(action).await?.filter(|p| p.active) else {
            return Ok(AccessDecision::denied(
                action,
                "No active policy found for action",
                "PolicyNotFound",
            ));
        };
        let ctx = &request.context;
        let mut failed = Vec::new();
        let mut auth_failed = false;

        if ctx.current_auth_level < policy.required_auth_level {
            auth_failed = true;
            failed.push(format!(
                "Insufficient auth level: required={}, current={}",
                policy.required_auth_level, ctx.current_auth_level
            ));
        }

        let (risk_level, risk_score, factors) = device_risk(ctx);
        if risk_level > policy.max_allowed_risk {
            failed.push(format!(
                "Device risk too high: level={risk_level}, maxAllowed={}, score={risk_score}",
                policy.max_allowed_risk
            ));
        }

        if policy.require_trusted_device && !self.is_trusted(ctx).await? {
            failed.push("Trusted device required but device is not trusted".to_owned());
        }

        if policy.require_fresh_session {
            let fresh = ctx
                .last_password_verification
                .is_some_and(|at| Utc::now() - at <= Duration::minutes(FRESH_SESSION_MINUTES));
            if !fresh {
                failed.push("Fresh session required".to_owned());
            }
        }

        if policy.require_geo_fence && !policy.allowed_countries.is_empty() {
            let inside = ctx
                .country
                .as_deref()
                .is_some_and(|c| policy.allowed_countries.iter().any(|a| a.eq_ignore_ascii_case(c)));
            if !inside {
                failed.push(format!(
                    "Geo-fence violation: country={}, allowed={}",
                    ctx.country.as_deref().unwrap_or("unknown"),
                    policy.allowed_countries.join(",")
                ));
            }
        }

        if policy.block_vpn_tor && (ctx.is_vpn || ctx.is_tor) {
            failed.push(format!("VPN/Tor blocked: vpn={}, tor={}", ctx.is_vpn, ctx.is_tor));
        }

        if policy.block_anomaly && ctx.has_active_anomaly {
            failed.push("Active anomaly detected".to_owned());
        }

        let mut break_glass = false;
        if !failed.is_empty() && request.use_break_glass_override && policy.allow_break_glass_override {
            warn!(
                action = %action,
                user_id = %ctx.user_id,
                request_id = request.break_glass_request_id.as_deref().unwrap_or("-"),
                failed = %failed.join("; "),
                "break-glass override used"
            );
            break_glass = true;
            auth_failed = false;
            failed.clear();
        }

        self.save_device_risk(ctx, risk_level, risk_score, &factors).await;

        let allowed = failed.is_empty();
        let decision = AccessDecision {
            allowed,
            action,
            reason: if allowed {
                "Access granted".to_owned()
            } else {
                format!("Access denied: {} check(s) failed", failed.len())
            },
            failed_checks: failed,
            device_risk_level: Some(risk_level),
            device_risk_score: Some(risk_score),
            requires_step_up: auth_failed,
            required_auth_level: (!allowed).then_some(policy.required_auth_level),
            break_glass_override_used: break_glass,
            decided_at: Utc::now(),
        };
        info!(
            action = %action,
            user_id = %ctx.user_id,
            allowed,
            risk = %risk_level,
            score = risk_score,
            break_glass,
            "zero-trust decision"
        );
        Ok(decision)
    }
}

#[async_trait]
impl AccessDecider for ZeroTrustEvaluator {
    async fn check_access(&self, request: &AccessRequest) -> AccessDecision {
        match self.decide(request).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(action = %request.action, error = %e, "zero-trust evaluation failed");
                AccessDecision::denied(request.action, "Zero Trust policy unavailable", "PolicyUnavailable")
            }
        }
    }
}

impl fmt::Debug for ZeroTrustEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZeroTrustEvaluator").finish_non_exhaustive()
    }
}

fn device_key(user_id: &str, device_id: &str) -> String {
    format!("{DEVICE_PREFIX}{user_id}/{device_id}")
}
