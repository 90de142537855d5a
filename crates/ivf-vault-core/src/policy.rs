//! Path-pattern policies.
//!
//! A policy grants a set of capabilities on every path its pattern matches.
//! Patterns are `/`-separated segments:
//!
//! - a literal segment matches itself, ignoring case;
//! - `*` matches exactly one segment, and inside a segment (`db-*`) it
//!   matches one or more characters without crossing `/`;
//! - a `**` segment matches zero or more whole segments, so `secrets/**`
//!   matches `secrets`, `secrets/a` and `secrets/a/b/c`.
//!
//! There is no deny capability. The first policy that matches the path and
//! holds the requested capability (or `sudo`) allows the request.
//!
//! Storage layout:
//!
//! - `sys/policies/<lowercase name>` → [`Policy`]
//! - `sys/user-policies/<user>/<policy id>` → [`PolicyAssignment`]

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditTrail};
use crate::error::PolicyError;
use crate::store::JsonStore;

const POLICY_PREFIX: &str = "sys/policies/";
const ASSIGNMENT_PREFIX: &str = "sys/user-policies/";
const ARCHIVE_PREFIX: &str = "sys/policies-deleted/";

/// Capability that implies every other capability.
pub const SUDO: &str = "sudo";

/// Matched-policy marker returned for admin callers.
pub const ADMIN_BYPASS: &str = "admin-bypass";

// ── matching ─────────────────────────────────────────────────────────

/// Whether `path` matches the glob `pattern`.
#[must_use]
pub fn path_matches(pattern: &str, path: &str) -> bool {
    let pattern: Vec<&str> = split_segments(pattern);
    let path: Vec<&str> = split_segments(path);
    match_segments(&pattern, &path)
}

fn split_segments(s: &str) -> Vec<&str> {
    s.trim_matches('/').split('/').filter(|seg| !seg.is_empty()).collect()
}

/// Segment-level match where `**` spans zero or more segments.
///
/// Runs in `O(pattern * path)` whatever the number of `**` segments.
fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    // next[j]: pattern[i+1..] matches path[j..]
    let mut next = vec![false; path.len() + 1];
    next[path.len()] = true;
    for head in pattern.iter().rev() {
        let mut cur = vec![false; path.len() + 1];
        for j in (0..=path.len()).rev() {
            cur[j] = if *head == "**" {
                next[j] || (j < path.len() && cur[j + 1])
            } else {
                j < path.len() && next[j + 1] && segment_matches(head, path[j])
            };
        }
        next = cur;
    }
    next[0]
}

/// Single-segment match. `*` consumes one or more characters.
fn segment_matches(pattern: &str, segment: &str) -> bool {
    if !pattern.contains('*') {
        return pattern.to_lowercase() == segment.to_lowercase();
    }
    let p: Vec<char> = pattern.to_lowercase().chars().collect();
    let s: Vec<char> = segment.to_lowercase().chars().collect();

    // prev[j]: p[..i-1] matches s[..j]
    let mut prev = vec![false; s.len() + 1];
    prev[0] = true;
    for pc in &p {
        let mut cur = vec![false; s.len() + 1];
        for j in 1..=s.len() {
            cur[j] = if *pc == '*' {
                prev[j - 1] || cur[j - 1]
            } else {
                *pc == s[j - 1] && prev[j - 1]
            };
        }
        prev = cur;
    }
    prev[s.len()]
}

/// Whether a capability list grants `capability`. `sudo` grants anything.
#[must_use]
pub fn capabilities_grant(capabilities: &[String], capability: &str) -> bool {
    capabilities
        .iter()
        .any(|c| c.eq_ignore_ascii_case(SUDO) || c.eq_ignore_ascii_case(capability))
}

// ── model ────────────────────────────────────────────────────────────

/// A stored policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: Uuid,
    pub name: String,
    pub path_pattern: String,
    pub capabilities: Vec<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Policy {
    /// Whether this policy allows `capability` on `path`.
    #[must_use]
    pub fn grants(&self, path: &str, capability: &str) -> bool {
        path_matches(&self.path_pattern, path) && capabilities_grant(&self.capabilities, capability)
    }
}

/// Link between a user and a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyAssignment {
    pub user_id: String,
    pub policy_id: Uuid,
    pub granted_by: Option<String>,
    pub granted_at: DateTime<Utc>,
}

/// How the caller authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    /// Interactive identity (session or JWT); policies come from assignments.
    Identity,
    /// Vault token; role claims are policy names.
    VaultToken,
}

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub user_id: Option<String>,
    /// Primary application role, e.g. `Admin`, `Doctor`.
    pub role: Option<String>,
    pub auth_method: AuthMethod,
    /// Role claims; for vault-token callers these are policy names.
    pub role_claims: Vec<String>,
}

impl CallerContext {
    /// An identity caller with an optional primary role.
    #[must_use]
    pub fn user(user_id: impl Into<String>, role: Option<&str>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            role: role.map(str::to_owned),
            auth_method: AuthMethod::Identity,
            role_claims: Vec::new(),
        }
    }

    /// A vault-token caller holding the given policy names.
    #[must_use]
    pub fn vault_token(policies: Vec<String>) -> Self {
        Self {
            user_id: None,
            role: None,
            auth_method: AuthMethod::VaultToken,
            role_claims: policies,
        }
    }

    /// No identity at all.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            role: None,
            auth_method: AuthMethod::Identity,
            role_claims: Vec::new(),
        }
    }

    fn is_admin(&self) -> bool {
        self.role.as_deref().is_some_and(|r| r.eq_ignore_ascii_case("admin"))
    }
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEvaluation {
    pub allowed: bool,
    pub matched_policy: Option<String>,
    pub reason: String,
}

impl PolicyEvaluation {
    fn allow(policy: &str, reason: String) -> Self {
        Self {
            allowed: true,
            matched_policy: Some(policy.to_owned()),
            reason,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            matched_policy: None,
            reason: reason.into(),
        }
    }
}

/// A resolved policy for introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectivePolicy {
    pub name: String,
    pub path_pattern: String,
    pub capabilities: Vec<String>,
    /// `admin-bypass`, `user-assignment` or `vault-token`.
    pub source: String,
}

impl EffectivePolicy {
    fn from_policy(policy: Policy, source: &str) -> Self {
        Self {
            name: policy.name,
            path_pattern: policy.path_pattern,
            capabilities: policy.capabilities,
            source: source.to_owned(),
        }
    }
}

fn policy_key(name: &str) -> String {
    format!("{POLICY_PREFIX}{}", name.to_lowercase())
}

fn archive_prefix(name: &str) -> String {
    format!("{ARCHIVE_PREFIX}{}/", name.to_lowercase())
}

fn assignment_prefix(user_id: &str) -> String {
    format!("{ASSIGNMENT_PREFIX}{user_id}/")
}

fn assignment_key(user_id: &str, policy_id: Uuid) -> String {
    format!("{ASSIGNMENT_PREFIX}{user_id}/{policy_id}")
}

fn invalid(reason: impl Into<String>) -> PolicyError {
    PolicyError::InvalidArgument { reason: reason.into() }
}

fn validate_name(name: &str) -> Result<(), PolicyError> {
    if name.trim().is_empty() || name.contains('/') {
        return Err(invalid("policy name must be non-empty and contain no '/'"));
    }
    Ok(())
}

fn normalize_capabilities(capabilities: &[&str]) -> Result<Vec<String>, PolicyError> {
    let mut caps: Vec<String> = capabilities.iter().map(|c| c.trim().to_lowercase()).collect();
    if caps.is_empty() || caps.iter().any(String::is_empty) {
        return Err(invalid("at least one non-empty capability is required"));
    }
    caps.sort_unstable();
    caps.dedup();
    Ok(caps)
}

fn validate_user(user_id: &str) -> Result<(), PolicyError> {
    if user_id.trim().is_empty() || user_id.contains('/') {
        return Err(invalid("user id must be non-empty and contain no '/'"));
    }
    Ok(())
}

// ── engine ───────────────────────────────────────────────────────────

/// Policy CRUD, user assignments, and evaluation.
pub struct PolicyEngine {
    store: JsonStore,
    audit: Arc<AuditTrail>,
}

impl PolicyEngine {
    #[must_use]
    pub fn new(store: JsonStore, audit: Arc<AuditTrail>) -> Self {
        Self { store, audit }
    }

    /// A live policy by name, ignoring case.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if storage fails.
    pub async fn get(&self, name: &str) -> Result<Option<Policy>, PolicyError> {
        Ok(self
            .store
            .get::<Policy>(&policy_key(name))
            .await?
            .filter(|p| p.deleted_at.is_none()))
    }

    async fn require(&self, name: &str) -> Result<Policy, PolicyError> {
        self.get(name).await?.ok_or_else(|| PolicyError::NotFound { name: name.to_owned() })
    }

    /// Every live policy, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if storage fails.
    pub async fn list(&self) -> Result<Vec<Policy>, PolicyError> {
        Ok(self
            .store
            .scan::<Policy>(POLICY_PREFIX)
            .await?
            .into_iter()
            .filter(|p| p.deleted_at.is_none())
            .collect())
    }

    /// Create a policy.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::InvalidArgument`] for an empty name, pattern or
    ///   capability list.
    /// - [`PolicyError::AlreadyExists`] if a live policy has the name.
    pub async fn create(
        &self,
        name: &str,
        path_pattern: &str,
        capabilities: &[&str],
        description: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<Policy, PolicyError> {
        validate_name(name)?;
        if path_pattern.trim().is_empty() {
            return Err(invalid("path pattern must not be empty"));
        }
        let capabilities = normalize_capabilities(capabilities)?;

        let now = Utc::now();
        let policy = Policy {
            id: Uuid::new_v4(),
            name: name.trim().to_owned(),
            path_pattern: path_pattern.trim().to_owned(),
            capabilities,
            description: description.map(str::to_owned),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        let key = policy_key(&policy.name);
        if !self.store.put_if_absent(&key, &policy).await? {
            match self.store.get::<Policy>(&key).await? {
                Some(existing) if existing.deleted_at.is_some() => self.reclaim(&key, existing, &policy).await?,
                _ => {
                    return Err(PolicyError::AlreadyExists {
                        name: policy.name.clone(),
                    });
                }
            }
        }

        self.audit
            .record(
                AuditEntry::new("policy.create", "Policy")
                    .entity(policy.name.clone())
                    .user(user_id)
                    .details(serde_json::json!({
                        "pathPattern": policy.path_pattern,
                        "capabilities": policy.capabilities,
                    })),
            )
            .await?;
        info!(name = %policy.name, pattern = %policy.path_pattern, "policy created");
        Ok(policy)
    }

    /// Move a soft-deleted record into the archive and take over its name.
    ///
    /// The archive write is the claim: only one creator can archive a given
    /// deleted record, so concurrent re-creates of the same name cannot both
    /// succeed.
    async fn reclaim(&self, key: &str, deleted: Policy, policy: &Policy) -> Result<(), PolicyError> {
        let archive_key = format!("{}{}", archive_prefix(&deleted.name), deleted.id);
        if !self.store.put_if_absent(&archive_key, &deleted).await? {
            return Err(PolicyError::AlreadyExists {
                name: policy.name.clone(),
            });
        }
        if let Err(e) = self.store.put(key, policy).await {
            // Release the claim so the name is not stuck behind it.
            if let Err(release) = self.store.delete(&archive_key).await {
                warn!(name = %policy.name, error = %release, "failed to release archived policy claim");
            }
            return Err(e.into());
        }
        debug!(name = %policy.name, archived = %deleted.id, "deleted policy archived");
        Ok(())
    }

    /// Soft-deleted policies that once held `name`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if storage fails.
    pub async fn deleted_versions(&self, name: &str) -> Result<Vec<Policy>, PolicyError> {
        let mut archived = self.store.scan::<Policy>(&archive_prefix(name)).await?;
        if let Some(current) = self.store.get::<Policy>(&policy_key(name)).await? {
            if current.deleted_at.is_some() {
                archived.push(current);
            }
        }
        archived.sort_by_key(|p| p.deleted_at);
        Ok(archived)
    }

    /// Change a policy's pattern, capabilities, or description.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::NotFound`] if no live policy has the name.
    /// - [`PolicyError::InvalidArgument`] for an empty pattern or capability list.
    pub async fn update(
        &self,
        name: &str,
        path_pattern: Option<&str>,
        capabilities: Option<&[&str]>,
        description: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<Policy, PolicyError> {
        let mut policy = self.require(name).await?;
        if let Some(pattern) = path_pattern {
            if pattern.trim().is_empty() {
                return Err(invalid("path pattern must not be empty"));
            }
            policy.path_pattern = pattern.trim().to_owned();
        }
        if let Some(caps) = capabilities {
            policy.capabilities = normalize_capabilities(caps)?;
        }
        if let Some(d) = description {
            policy.description = Some(d.to_owned());
        }
        policy.updated_at = Utc::now();
        self.store.put(&policy_key(&policy.name), &policy).await?;

        self.audit
            .record(
                AuditEntry::new("policy.update", "Policy")
                    .entity(policy.name.clone())
                    .user(user_id)
                    .details(serde_json::json!({
                        "pathPattern": policy.path_pattern,
                        "capabilities": policy.capabilities,
                    })),
            )
            .await?;
        info!(name = %policy.name, "policy updated");
        Ok(policy)
    }

    /// Soft-delete a policy. Existing assignments stop resolving.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::NotFound`] if no live policy has the name.
    pub async fn delete(&self, name: &str, user_id: Option<&str>) -> Result<(), PolicyError> {
        let mut policy = self.require(name).await?;
        policy.deleted_at = Some(Utc::now());
        self.store.put(&policy_key(&policy.name), &policy).await?;

        self.audit
            .record(
                AuditEntry::new("policy.delete", "Policy")
                    .entity(policy.name.clone())
                    .user(user_id),
            )
            .await?;
        info!(name = %policy.name, "policy deleted");
        Ok(())
    }

    // ── assignments ───────────────────────────────────────────────────

    /// Grant a policy to a user.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::NotFound`] if the policy does not exist.
    /// - [`PolicyError::AlreadyAssigned`] if the user already holds it.
    pub async fn assign(&self, user_id: &str, policy_name: &str, granted_by: Option<&str>) -> Result<(), PolicyError> {
        validate_user(user_id)?;
        let policy = self.require(policy_name).await?;
        let assignment = PolicyAssignment {
            user_id: user_id.to_owned(),
            policy_id: policy.id,
            granted_by: granted_by.map(str::to_owned),
            granted_at: Utc::now(),
        };
        if !self
            .store
            .put_if_absent(&assignment_key(user_id, policy.id), &assignment)
            .await?
        {
            return Err(PolicyError::AlreadyAssigned {
                user_id: user_id.to_owned(),
                policy: policy.name,
            });
        }

        self.audit
            .record(
                AuditEntry::new("policy.assign", "UserPolicy")
                    .entity(user_id.to_owned())
                    .user(granted_by)
                    .details(serde_json::json!({ "policy": policy.name })),
            )
            .await?;
        info!(user_id = %user_id, policy = %policy.name, "policy assigned");
        Ok(())
    }

    /// Remove a policy from a user.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::NotFound`] if the policy does not exist or is
    /// not assigned to the user.
    pub async fn unassign(&self, user_id: &str, policy_name: &str, revoked_by: Option<&str>) -> Result<(), PolicyError> {
        validate_user(user_id)?;
        let policy = self.require(policy_name).await?;
        let key = assignment_key(user_id, policy.id);
        if self.store.get::<PolicyAssignment>(&key).await?.is_none() {
            return Err(PolicyError::NotFound {
                name: format!("{} (assignment for {user_id})", policy.name),
            });
        }
        self.store.delete(&key).await?;

        self.audit
            .record(
                AuditEntry::new("policy.unassign", "UserPolicy")
                    .entity(user_id.to_owned())
                    .user(revoked_by)
                    .details(serde_json::json!({ "policy": policy.name })),
            )
            .await?;
        info!(user_id = %user_id, policy = %policy.name, "policy unassigned");
        Ok(())
    }

    /// Live policies assigned to a user.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if storage fails.
    pub async fn user_policies(&self, user_id: &str) -> Result<Vec<Policy>, PolicyError> {
        let assignments: Vec<PolicyAssignment> = self.store.scan(&assignment_prefix(user_id)).await?;
        if assignments.is_empty() {
            return Ok(Vec::new());
        }
        let all = self.list().await?;
        Ok(assignments
            .iter()
            .filter_map(|a| all.iter().find(|p| p.id == a.policy_id).cloned())
            .collect())
    }

    async fn named_policies(&self, names: &[String]) -> Result<Vec<Policy>, PolicyError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|p| names.iter().any(|n| n.eq_ignore_ascii_case(&p.name)))
            .collect())
    }

    // ── evaluation ────────────────────────────────────────────────────

    /// Decide whether `caller` may exercise `capability` on `resource_path`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if policies cannot be loaded. Callers
    /// must treat an error as a denial.
    pub async fn evaluate(
        &self,
        caller: &CallerContext,
        resource_path: &str,
        capability: &str,
    ) -> Result<PolicyEvaluation, PolicyError> {
        if caller.is_admin() {
            return Ok(PolicyEvaluation::allow(ADMIN_BYPASS, "Admin role has full access".to_owned()));
        }

        match caller.auth_method {
            AuthMethod::VaultToken => {
                if caller.role_claims.is_empty() {
                    return Ok(PolicyEvaluation::deny("Vault token has no policies"));
                }
                let policies = self.named_policies(&caller.role_claims).await?;
                Ok(first_grant(&policies, resource_path, capability, "token policy").unwrap_or_else(|| {
                    PolicyEvaluation::deny(format!("No token policy grants '{capability}' on '{resource_path}'"))
                }))
            }
            AuthMethod::Identity => match caller.user_id.as_deref() {
                None => Ok(PolicyEvaluation::deny("User not authenticated")),
                Some(user_id) => self.evaluate_for_user(user_id, resource_path, capability).await,
            },
        }
    }

    /// Evaluate against `user_id`'s assigned policies, ignoring roles.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if policies cannot be loaded.
    pub async fn evaluate_for_user(
        &self,
        user_id: &str,
        resource_path: &str,
        capability: &str,
    ) -> Result<PolicyEvaluation, PolicyError> {
        let policies = self.user_policies(user_id).await?;
        if policies.is_empty() {
            return Ok(PolicyEvaluation::deny("No vault policies assigned to user"));
        }
        let decision = first_grant(&policies, resource_path, capability, "policy").unwrap_or_else(|| {
            PolicyEvaluation::deny(format!("No policy grants '{capability}' on '{resource_path}'"))
        });
        debug!(
            user_id = %user_id,
            path = %resource_path,
            capability = %capability,
            allowed = decision.allowed,
            "policy evaluated"
        );
        Ok(decision)
    }

    /// Policies that apply to `caller`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if policies cannot be loaded.
    pub async fn effective_policies(&self, caller: &CallerContext) -> Result<Vec<EffectivePolicy>, PolicyError> {
        if caller.is_admin() {
            return Ok(vec![EffectivePolicy {
                name: "admin".to_owned(),
                path_pattern: "**".to_owned(),
                capabilities: vec![SUDO.to_owned()],
                source: ADMIN_BYPASS.to_owned(),
            }]);
        }
        match caller.auth_method {
            AuthMethod::VaultToken => Ok(self
                .named_policies(&caller.role_claims)
                .await?
                .into_iter()
                .map(|p| EffectivePolicy::from_policy(p, "vault-token"))
                .collect()),
            AuthMethod::Identity => match caller.user_id.as_deref() {
                None => Ok(Vec::new()),
                Some(user_id) => self.effective_policies_for_user(user_id).await,
            },
        }
    }

    /// Policies assigned to `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Store`] if policies cannot be loaded.
    pub async fn effective_policies_for_user(&self, user_id: &str) -> Result<Vec<EffectivePolicy>, PolicyError> {
        Ok(self
            .user_policies(user_id)
            .await?
            .into_iter()
            .map(|p| EffectivePolicy::from_policy(p, "user-assignment"))
            .collect())
    }
}

fn first_grant(policies: &[Policy], path: &str, capability: &str, kind: &str) -> Option<PolicyEvaluation> {
    policies
        .iter()
        .find(|p| p.grants(path, capability))
        .map(|p| PolicyEvaluation::allow(&p.name, format!("Granted by {kind} '{}'", p.name)))
}

impl fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyEngine").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ivf_vault_storage::MemoryBackend;

    fn engine() -> (PolicyEngine, Arc<AuditTrail>) {
        let storage = Arc::new(MemoryBackend::new());
        let audit = Arc::new(AuditTrail::new(storage.clone()));
        (PolicyEngine::new(JsonStore::new(storage), audit.clone()), audit)
    }

    // ── matching ──────────────────────────────────────────────────────

    #[test]
    fn single_star_matches_one_segment() {
        assert!(path_matches("patients/*", "patients/records"));
        assert!(!path_matches("patients/*", "patients/records/notes"));
        assert!(!path_matches("patients/*", "patients"));
    }

    #[test]
    fn double_star_matches_any_depth() {
        for path in ["secrets/a", "secrets/a/b", "secrets/a/b/c", "secrets"] {
            assert!(path_matches("secrets/**", path), "{path}");
        }
        assert!(!path_matches("secrets/**", "other/a"));
        assert!(path_matches("**", "anything/at/all"));
        assert!(path_matches("a/**/z", "a/z"));
        assert!(path_matches("a/**/z", "a/b/c/z"));
        assert!(!path_matches("a/**/z", "a/b/c"));
    }

    #[test]
    fn many_double_stars_against_deep_path() {
        let pattern = format!("{}z", "**/".repeat(40));
        let deep = vec!["seg"; 60].join("/");
        assert!(!path_matches(&pattern, &deep));
        assert!(path_matches(&pattern, &format!("{deep}/z")));
        assert!(path_matches("**/a/**/b/**", "x/a/y/y/b"));
        assert!(!path_matches("**/a/**/b/**", "x/b/y/a"));
    }

    #[test]
    fn matching_ignores_case_and_slashes() {
        assert!(path_matches("Patients/*", "/patients/42/"));
        assert!(path_matches("config/db-*", "config/DB-prod"));
        assert!(!path_matches("config/db-*", "config/db-"));
    }

    #[test]
    fn sudo_grants_everything() {
        let caps = vec![SUDO.to_owned()];
        assert!(capabilities_grant(&caps, "delete"));
        assert!(capabilities_grant(&caps, "anything"));
        let caps = vec!["read".to_owned()];
        assert!(capabilities_grant(&caps, "READ"));
        assert!(!capabilities_grant(&caps, "write"));
    }

    // ── crud ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn duplicate_name_conflicts() {
        let (e, _) = engine();
        e.create("readers", "patients/*", &["read"], None, None).await.unwrap();
        let err = e.create("Readers", "x/*", &["read"], None, None).await.unwrap_err();
        assert!(matches!(err, PolicyError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn deleted_name_can_be_reused() {
        let (e, _) = engine();
        e.create("readers", "patients/*", &["read"], None, None).await.unwrap();
        e.delete("readers", None).await.unwrap();
        assert!(e.get("readers").await.unwrap().is_none());
        e.create("readers", "cycles/*", &["list"], None, None).await.unwrap();
        assert_eq!(e.get("readers").await.unwrap().unwrap().path_pattern, "cycles/*");
    }

    #[tokio::test]
    async fn recreated_name_keeps_deleted_record() {
        let (e, _) = engine();
        let first = e.create("readers", "patients/*", &["read"], None, None).await.unwrap();
        e.delete("readers", None).await.unwrap();
        let second = e.create("readers", "cycles/*", &["list"], None, None).await.unwrap();
        e.delete("readers", None).await.unwrap();
        e.create("readers", "labs/*", &["read"], None, None).await.unwrap();

        let deleted = e.deleted_versions("Readers").await.unwrap();
        assert_eq!(deleted.len(), 2);
        assert_eq!(deleted[0].id, first.id);
        assert_eq!(deleted[0].path_pattern, "patients/*");
        assert_eq!(deleted[1].id, second.id);
        assert!(deleted.iter().all(|p| p.deleted_at.is_some()));
        assert_eq!(e.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn archived_record_blocks_second_reclaim() {
        let (e, _) = engine();
        let first = e.create("readers", "patients/*", &["read"], None, None).await.unwrap();
        e.delete("readers", None).await.unwrap();
        let deleted = e.store.get::<Policy>(&policy_key("readers")).await.unwrap().unwrap();

        // Another creator already archived this record and is about to
        // take the name.
        let archive_key = format!("{}{}", archive_prefix("readers"), first.id);
        assert!(e.store.put_if_absent(&archive_key, &deleted).await.unwrap());

        assert!(matches!(
            e.create("readers", "cycles/*", &["list"], None, None).await,
            Err(PolicyError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn create_validates_input() {
        let (e, _) = engine();
        assert!(matches!(
            e.create("", "x", &["read"], None, None).await,
            Err(PolicyError::InvalidArgument { .. })
        ));
        assert!(matches!(
            e.create("p", "x", &[], None, None).await,
            Err(PolicyError::InvalidArgument { .. })
        ));
        assert!(matches!(
            e.create("p", " ", &["read"], None, None).await,
            Err(PolicyError::InvalidArgument { .. })
        ));
    }

    #[tokio::test]
    async fn update_changes_grants() {
        let (e, _) = engine();
        e.create("ops", "config/*", &["read"], None, None).await.unwrap();
        e.assign("u1", "ops", None).await.unwrap();
        assert!(!e.evaluate_for_user("u1", "config/db", "update").await.unwrap().allowed);
        e.update("ops", None, Some(&["read", "update"]), None, None).await.unwrap();
        assert!(e.evaluate_for_user("u1", "config/db", "update").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn duplicate_assignment_conflicts() {
        let (e, _) = engine();
        e.create("readers", "patients/*", &["read"], None, None).await.unwrap();
        e.assign("u1", "readers", Some("admin")).await.unwrap();
        assert!(matches!(
            e.assign("u1", "readers", None).await,
            Err(PolicyError::AlreadyAssigned { .. })
        ));
        e.unassign("u1", "readers", None).await.unwrap();
        assert!(matches!(
            e.unassign("u1", "readers", None).await,
            Err(PolicyError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn assign_unknown_policy_is_not_found() {
        let (e, _) = engine();
        assert!(matches!(
            e.assign("u1", "ghost", None).await,
            Err(PolicyError::NotFound { .. })
        ));
    }

    // ── evaluation ────────────────────────────────────────────────────

    #[tokio::test]
    async fn assigned_user_scenario() {
        let (e, _) = engine();
        e.create("patient-readers", "patients/*", &["read", "list"], None, None)
            .await
            .unwrap();
        e.assign("U", "patient-readers", None).await.unwrap();
        let caller = CallerContext::user("U", Some("Doctor"));

        let allow = e.evaluate(&caller, "patients/42", "read").await.unwrap();
        assert!(allow.allowed);
        assert_eq!(allow.matched_policy.as_deref(), Some("patient-readers"));

        let deny = e.evaluate(&caller, "patients/42", "delete").await.unwrap();
        assert!(!deny.allowed);
    }

    #[tokio::test]
    async fn admin_bypasses_any_case() {
        let (e, _) = engine();
        let r = e.evaluate(&CallerContext::user("a", Some("aDmIn")), "x/y", "delete").await.unwrap();
        assert!(r.allowed);
        assert_eq!(r.matched_policy.as_deref(), Some(ADMIN_BYPASS));

        let eff = e.effective_policies(&CallerContext::user("a", Some("Admin"))).await.unwrap();
        assert_eq!(eff.len(), 1);
        assert_eq!(eff[0].path_pattern, "**");
        assert_eq!(eff[0].capabilities, vec![SUDO.to_owned()]);
    }

    #[tokio::test]
    async fn no_assignments_denies_generically() {
        let (e, _) = engine();
        let r = e.evaluate(&CallerContext::user("nobody", None), "a", "read").await.unwrap();
        assert!(!r.allowed);
        assert_eq!(r.reason, "No vault policies assigned to user");
    }

    #[tokio::test]
    async fn anonymous_is_denied() {
        let (e, _) = engine();
        let r = e.evaluate(&CallerContext::anonymous(), "a", "read").await.unwrap();
        assert!(!r.allowed);
        assert_eq!(r.reason, "User not authenticated");
    }

    #[tokio::test]
    async fn token_callers_use_role_claims_as_policy_names() {
        let (e, _) = engine();
        e.create("ci-deploy", "config/**", &["read"], None, None).await.unwrap();
        let caller = CallerContext::vault_token(vec!["CI-DEPLOY".to_owned()]);
        assert!(e.evaluate(&caller, "config/app/db", "read").await.unwrap().allowed);
        assert!(!e.evaluate(&caller, "config/app/db", "delete").await.unwrap().allowed);

        let none = CallerContext::vault_token(Vec::new());
        assert_eq!(
            e.evaluate(&none, "config/app", "read").await.unwrap().reason,
            "Vault token has no policies"
        );
        let eff = e.effective_policies(&caller).await.unwrap();
        assert_eq!(eff[0].source, "vault-token");
    }

    #[tokio::test]
    async fn deleted_policy_stops_granting() {
        let (e, _) = engine();
        e.create("readers", "patients/*", &["read"], None, None).await.unwrap();
        e.assign("u1", "readers", None).await.unwrap();
        e.delete("readers", None).await.unwrap();
        let r = e.evaluate_for_user("u1", "patients/1", "read").await.unwrap();
        assert!(!r.allowed);
    }

    #[tokio::test]
    async fn changes_are_audited() {
        let (e, audit) = engine();
        e.create("readers", "patients/*", &["read"], None, Some("admin")).await.unwrap();
        e.assign("u1", "readers", Some("admin")).await.unwrap();
        assert_eq!(audit.recent(10, Some("policy.")).await.unwrap().len(), 2);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn segments() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec("[a-z0-9_-]{1,8}", 1..6)
    }

    proptest! {
        /// A literal pattern matches exactly its own path.
        #[test]
        fn prop_literal_matches_itself(segs in segments()) {
            let path = segs.join("/");
            prop_assert!(path_matches(&path, &path));
            prop_assert!(path_matches(&path.to_uppercase(), &path));
        }

        /// One `*` per segment matches any path of the same depth only.
        #[test]
        fn prop_stars_match_same_depth(segs in segments(), extra in "[a-z]{1,5}") {
            let pattern = vec!["*"; segs.len()].join("/");
            let path = segs.join("/");
            prop_assert!(path_matches(&pattern, &path));
            let deeper = format!("{path}/{extra}");
            prop_assert!(!path_matches(&pattern, &deeper));
        }

        /// `prefix/**` matches the prefix and everything below it.
        #[test]
        fn prop_double_star_matches_descendants(prefix in segments(), rest in prop::collection::vec("[a-z0-9]{1,6}", 0..5)) {
            let pattern = format!("{}/**", prefix.join("/"));
            let mut path = prefix.clone();
            path.extend(rest);
            prop_assert!(path_matches(&pattern, &path.join("/")));
        }

        /// `*` never crosses a `/`.
        #[test]
        fn prop_star_does_not_cross_slash(a in "[a-z]{1,6}", b in "[a-z]{1,6}", c in "[a-z]{1,6}") {
            let pattern = format!("{a}/*");
            let path = format!("{a}/{b}/{c}");
            prop_assert!(!path_matches(&pattern, &path));
        }
    }
}
