//! Dynamic database credentials.
//!
//! [`DynamicCredentialEngine::generate`] creates a short-lived login role
//! named `ivf_dyn_<12 hex>` with a random password, grants it the requested
//! privileges, and tracks it at `sys/dynamic-creds/<id>`. Revocation drops
//! the role. The DDL is built here from sanitized identifiers and executed
//! by a [`RoleExecutor`], so the statements are testable without a database.
//!
//! The admin password needed to drop the role later is stored encrypted
//! under the KMS `data` purpose key. The generated role's password is only
//! ever returned to the caller, never persisted.
//!
//! The record is written as `pending` before any DDL runs and confirmed once
//! the role is verified. A pending record left behind by an interrupted
//! `generate` is swept like an expired one after [`PENDING_GRACE_SECS`].

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditTrail};
use crate::crypto;
use crate::error::CredentialError;
use crate::kms::{KmsProvider, purpose_key_name};
use crate::lease::expiry_after;
use crate::store::JsonStore;

const CRED_PREFIX: &str = "sys/dynamic-creds/";

/// Prefix of every generated role name.
pub const ROLE_PREFIX: &str = "ivf_dyn_";

/// Age after which an unconfirmed record counts as abandoned.
pub const PENDING_GRACE_SECS: i64 = 300;

/// Privileges granted to a writable role.
const READ_WRITE: &str = "SELECT, INSERT, UPDATE, DELETE";

// ── identifiers and DDL ──────────────────────────────────────────────

/// Keep only `[A-Za-z0-9_.]`.
///
/// Every identifier interpolated into generated SQL goes through this.
#[must_use]
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .collect()
}

/// Sanitize and double-quote an identifier, quoting each `.`-separated part
/// (`public.patients` → `"public"."patients"`). `None` if nothing survives.
#[must_use]
pub fn quote_identifier(identifier: &str) -> Option<String> {
    let clean = sanitize_identifier(identifier);
    let parts: Vec<String> = clean
        .split('.')
        .filter(|p| !p.is_empty())
        .map(|p| format!("\"{p}\""))
        .collect();
    (!parts.is_empty()).then(|| parts.join("."))
}

/// Single-quote a SQL string literal, doubling embedded quotes.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `Host=..;Port=..;Database=..;Username=..;Password=..`
#[must_use]
pub fn connection_string(host: &str, port: u16, database: &str, username: &str, password: &str) -> String {
    format!("Host={host};Port={port};Database={database};Username={username};Password={password}")
}

/// Role to create on the target database.
#[derive(Clone)]
pub struct RoleSpec {
    pub username: String,
    pub password: String,
    pub valid_until: DateTime<Utc>,
    pub database: String,
    pub read_only: bool,
    /// Tables to grant on; empty means every table in `public`.
    pub tables: Vec<String>,
}

impl fmt::Debug for RoleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleSpec")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("valid_until", &self.valid_until)
            .field("database", &self.database)
            .field("read_only", &self.read_only)
            .field("tables", &self.tables)
            .finish()
    }
}

fn invalid(reason: impl Into<String>) -> CredentialError {
    CredentialError::InvalidArgument { reason: reason.into() }
}

/// Statements that create and grant a role.
///
/// # Errors
///
/// Returns [`CredentialError::InvalidArgument`] if the role, database, or a
/// table name is empty after sanitization.
pub fn create_role_statements(spec: &RoleSpec) -> Result<Vec<String>, CredentialError> {
    let role = quote_identifier(&spec.username).ok_or_else(|| invalid("role name is empty"))?;
    let database = quote_identifier(&spec.database).ok_or_else(|| invalid("database name is empty"))?;
    let valid_until = spec.valid_until.format("%Y-%m-%d %H:%M:%S+00").to_string();
    let privilege = if spec.read_only { "SELECT" } else { READ_WRITE };

    let mut statements = vec![
        format!(
            "CREATE ROLE {role} LOGIN PASSWORD {} VALID UNTIL {}",
            quote_literal(&spec.password),
            quote_literal(&valid_until)
        ),
        format!("GRANT CONNECT ON DATABASE {database} TO {role}"),
    ];
    if spec.tables.is_empty() {
        statements.push(format!("GRANT {privilege} ON ALL TABLES IN SCHEMA public TO {role}"));
    } else {
        for table in &spec.tables {
            let table = quote_identifier(table).ok_or_else(|| invalid(format!("table name '{table}' is empty")))?;
            statements.push(format!("GRANT {privilege} ON TABLE {table} TO {role}"));
        }
    }
    Ok(statements)
}

/// Statements that strip and drop a role.
///
/// # Errors
///
/// Returns [`CredentialError::InvalidArgument`] if the role or database is
/// empty after sanitization.
pub fn drop_role_statements(username: &str, database: &str) -> Result<Vec<String>, CredentialError> {
    let role = quote_identifier(username).ok_or_else(|| invalid("role name is empty"))?;
    let database = quote_identifier(database).ok_or_else(|| invalid("database name is empty"))?;
    Ok(vec![
        format!("REVOKE ALL PRIVILEGES ON ALL TABLES IN SCHEMA public FROM {role}"),
        format!("REVOKE CONNECT ON DATABASE {database} FROM {role}"),
        format!("DROP ROLE IF EXISTS {role}"),
    ])
}

// ── executor ─────────────────────────────────────────────────────────

/// Database endpoint plus the admin login used to manage roles.
#[derive(Clone, PartialEq, Eq)]
pub struct DbTarget {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub admin_username: String,
    pub admin_password: String,
}

impl fmt::Debug for DbTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("admin_username", &self.admin_username)
            .field("admin_password", &"[REDACTED]")
            .finish()
    }
}

impl DbTarget {
    fn validate(&self) -> Result<(), CredentialError> {
        if self.host.trim().is_empty() || self.database.trim().is_empty() || self.admin_username.trim().is_empty() {
            return Err(invalid("host, database and admin username are required"));
        }
        if self.port == 0 {
            return Err(invalid("port must be non-zero"));
        }
        Ok(())
    }
}

/// Runs role DDL against a target database.
#[async_trait::async_trait]
pub trait RoleExecutor: Send + Sync {
    /// Create and grant the role described by `spec`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Ddl`] if the database rejects a statement.
    async fn create_role(&self, target: &DbTarget, spec: &RoleSpec) -> Result<(), CredentialError>;

    /// Revoke privileges and drop the role. Dropping a missing role succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Ddl`] if the database rejects a statement.
    async fn drop_role(&self, target: &DbTarget, username: &str) -> Result<(), CredentialError>;

    /// Whether a role with this name exists.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Ddl`] if the lookup fails.
    async fn role_exists(&self, target: &DbTarget, username: &str) -> Result<bool, CredentialError>;
}

/// In-memory role registry that records the DDL it would run.
#[derive(Debug, Default)]
pub struct MemoryRoleExecutor {
    roles: RwLock<BTreeSet<String>>,
    statements: RwLock<Vec<String>>,
    failing_drops: RwLock<BTreeSet<String>>,
    silent_creates: RwLock<bool>,
}

impl MemoryRoleExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Roles that currently exist.
    pub async fn roles(&self) -> BTreeSet<String> {
        self.roles.read().await.clone()
    }

    /// Every statement executed so far, in order.
    pub async fn statements(&self) -> Vec<String> {
        self.statements.read().await.clone()
    }

    /// Make `drop_role` fail for this username.
    pub async fn fail_drop(&self, username: &str) {
        self.failing_drops.write().await.insert(username.to_owned());
    }

    /// Make `create_role` report success without creating anything.
    pub async fn set_silent_creates(&self, silent: bool) {
        *self.silent_creates.write().await = silent;
    }
}

#[async_trait::async_trait]
impl RoleExecutor for MemoryRoleExecutor {
    async fn create_role(&self, _target: &DbTarget, spec: &RoleSpec) -> Result<(), CredentialError> {
        let statements = create_role_statements(spec)?;
        self.statements.write().await.extend(statements);
        if !*self.silent_creates.read().await {
            self.roles.write().await.insert(spec.username.clone());
        }
        Ok(())
    }

    async fn drop_role(&self, target: &DbTarget, username: &str) -> Result<(), CredentialError> {
        if self.failing_drops.read().await.contains(username) {
            return Err(CredentialError::Ddl {
                username: username.to_owned(),
                reason: "connection refused".to_owned(),
            });
        }
        let statements = drop_role_statements(username, &target.database)?;
        self.statements.write().await.extend(statements);
        self.roles.write().await.remove(username);
        Ok(())
    }

    async fn role_exists(&self, _target: &DbTarget, username: &str) -> Result<bool, CredentialError> {
        Ok(self.roles.read().await.contains(username))
    }
}

#[cfg(feature = "postgres")]
pub use pg::PgRoleExecutor;

#[cfg(feature = "postgres")]
mod pg {
    use sqlx::postgres::{PgConnectOptions, PgConnection};
    use sqlx::{Connection, Row};

    use super::{DbTarget, RoleExecutor, RoleSpec, create_role_statements, drop_role_statements};
    use crate::error::CredentialError;

    /// Runs role DDL over a fresh admin connection per call.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct PgRoleExecutor;

    fn ddl_error(username: &str, e: &sqlx::Error) -> CredentialError {
        CredentialError::Ddl {
            username: username.to_owned(),
            reason: e.to_string(),
        }
    }

    async fn connect(target: &DbTarget, username: &str) -> Result<PgConnection, CredentialError> {
        let options = PgConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .database(&target.database)
            .username(&target.admin_username)
            .password(&target.admin_password);
        PgConnection::connect_with(&options)
            .await
            .map_err(|e| ddl_error(username, &e))
    }

    async fn run(target: &DbTarget, username: &str, statements: &[String]) -> Result<(), CredentialError> {
        let mut conn = connect(target, username).await?;
        let mut tx = conn.begin().await.map_err(|e| ddl_error(username, &e))?;
        for statement in statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| ddl_error(username, &e))?;
        }
        tx.commit().await.map_err(|e| ddl_error(username, &e))
    }

    #[async_trait::async_trait]
    impl RoleExecutor for PgRoleExecutor {
        async fn create_role(&self, target: &DbTarget, spec: &RoleSpec) -> Result<(), CredentialError> {
            run(target, &spec.username, &create_role_statements(spec)?).await
        }

        async fn drop_role(&self, target: &DbTarget, username: &str) -> Result<(), CredentialError> {
            run(target, username, &drop_role_statements(username, &target.database)?).await
        }

        async fn role_exists(&self, target: &DbTarget, username: &str) -> Result<bool, CredentialError> {
            let mut conn = connect(target, username).await?;
            let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM pg_roles WHERE rolname = $1)")
                .bind(username)
                .fetch_one(&mut conn)
                .await
                .map_err(|e| ddl_error(username, &e))?;
            row.try_get::<bool, _>(0).map_err(|e| ddl_error(username, &e))
        }
    }
}

// ── engine ───────────────────────────────────────────────────────────

/// Parameters for [`DynamicCredentialEngine::generate`].
#[derive(Debug, Clone)]
pub struct CredentialRequest {
    pub target: DbTarget,
    pub ttl_seconds: i64,
    pub read_only: bool,
    /// Tables to grant on; empty grants every table in `public`.
    pub granted_tables: Vec<String>,
}

/// Admin password encrypted under the KMS `data` purpose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SealedPassword {
    ciphertext: String,
    iv: String,
    key_name: String,
}

/// Tracked dynamic credential. Holds no usable secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicCredential {
    pub id: Uuid,
    pub lease_id: String,
    pub backend: String,
    pub username: String,
    pub db_host: String,
    pub db_port: u16,
    pub db_name: String,
    pub admin_username: String,
    admin_password: SealedPassword,
    pub ttl_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    /// Written before the role exists; cleared once it is verified.
    #[serde(default)]
    pub pending: bool,
}

impl DynamicCredential {
    /// Whether `expires_at` has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Still pending well after creation, so its `generate` never finished.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.pending && Utc::now() - self.created_at > Duration::seconds(PENDING_GRACE_SECS)
    }
}

/// Returned once by [`DynamicCredentialEngine::generate`].
#[derive(Clone)]
pub struct IssuedCredential {
    pub id: Uuid,
    pub lease_id: String,
    pub username: String,
    pub password: String,
    pub connection_string: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("id", &self.id)
            .field("lease_id", &self.lease_id)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

fn cred_key(id: Uuid) -> String {
    format!("{CRED_PREFIX}{id}")
}

/// Issues and revokes least-privilege database roles.
pub struct DynamicCredentialEngine {
    store: JsonStore,
    kms: Arc<dyn KmsProvider>,
    executor: Arc<dyn RoleExecutor>,
    audit: Arc<AuditTrail>,
}

impl DynamicCredentialEngine {
    #[must_use]
    pub fn new(
        store: JsonStore,
        kms: Arc<dyn KmsProvider>,
        executor: Arc<dyn RoleExecutor>,
        audit: Arc<AuditTrail>,
    ) -> Self {
        Self {
            store,
            kms,
            executor,
            audit,
        }
    }

    /// Create a role, verify it exists, and track it.
    ///
    /// # Errors
    ///
    /// - [`CredentialError::InvalidArgument`] for missing target fields, a
    ///   non-positive or out-of-range TTL, or a table name that sanitizes
    ///   to nothing.
    /// - [`CredentialError::Ddl`] if the database rejects the DDL.
    /// - [`CredentialError::RoleMissing`] if the role is absent afterwards.
    pub async fn generate(&self, request: &CredentialRequest) -> Result<IssuedCredential, CredentialError> {
        request.target.validate()?;
        if request.ttl_seconds <= 0 {
            return Err(invalid(format!("ttl must be positive, got {}", request.ttl_seconds)));
        }

        let target = &request.target;
        let username = format!("{ROLE_PREFIX}{}", hex::encode(crypto::random_bytes(6)));
        let password = crypto::encode_b64(&crypto::random_bytes(24));
        let now = Utc::now();
        let expires_at = expiry_after(now, request.ttl_seconds)
            .ok_or_else(|| invalid(format!("ttl {} is out of range", request.ttl_seconds)))?;

        let spec = RoleSpec {
            username: username.clone(),
            password: password.clone(),
            valid_until: expires_at,
            database: target.database.clone(),
            read_only: request.read_only,
            tables: request.granted_tables.clone(),
        };
        // Validate identifiers before touching the database.
        create_role_statements(&spec)?;

        let mut record = self.track(target, &username, request.ttl_seconds, now, expires_at).await?;
        if let Err(e) = self.provision(target, &spec).await {
            self.abandon(target, record).await;
            return Err(e);
        }
        record.pending = false;
        if let Err(e) = self.store.put(&cred_key(record.id), &record).await {
            self.abandon(target, record).await;
            return Err(e.into());
        }

        self.audit
            .record(
                AuditEntry::new("credential.dynamic.create", "DynamicCredential")
                    .entity(record.id.to_string())
                    .details(serde_json::json!({
                        "username": username,
                        "database": target.database,
                        "readOnly": request.read_only,
                        "ttl": request.ttl_seconds,
                    })),
            )
            .await?;

        info!(username = %username, database = %target.database, expires_at = %expires_at, "dynamic credential created");
        Ok(IssuedCredential {
            id: record.id,
            lease_id: record.lease_id,
            connection_string: connection_string(&target.host, target.port, &target.database, &username, &password),
            username,
            password,
            expires_at,
        })
    }

    async fn track(
        &self,
        target: &DbTarget,
        username: &str,
        ttl_seconds: i64,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<DynamicCredential, CredentialError> {
        let sealed = self
            .kms
            .encrypt(&purpose_key_name("data"), target.admin_password.as_bytes())
            .await?;
        let record = DynamicCredential {
            id: Uuid::new_v4(),
            lease_id: format!("lease_{}", hex::encode(crypto::random_bytes(16))),
            backend: "postgres".to_owned(),
            username: username.to_owned(),
            db_host: target.host.clone(),
            db_port: target.port,
            db_name: target.database.clone(),
            admin_username: target.admin_username.clone(),
            admin_password: SealedPassword {
                ciphertext: crypto::encode_b64(&sealed.ciphertext),
                iv: crypto::encode_b64(&sealed.iv),
                key_name: sealed.key_name,
            },
            ttl_seconds,
            created_at: now,
            expires_at,
            revoked: false,
            revoked_at: None,
            pending: true,
        };
        self.store.put(&cred_key(record.id), &record).await?;
        Ok(record)
    }

    async fn provision(&self, target: &DbTarget, spec: &RoleSpec) -> Result<(), CredentialError> {
        self.executor.create_role(target, spec).await?;
        if self.executor.role_exists(target, &spec.username).await? {
            Ok(())
        } else {
            Err(CredentialError::RoleMissing {
                username: spec.username.clone(),
            })
        }
    }

    /// Drop a half-created role and close its record. If the drop fails the
    /// record stays pending for the sweep.
    async fn abandon(&self, target: &DbTarget, mut record: DynamicCredential) {
        if let Err(e) = self.executor.drop_role(target, &record.username).await {
            warn!(username = %record.username, error = %e, "failed to drop half-created role");
            return;
        }
        record.pending = false;
        record.revoked = true;
        record.revoked_at = Some(Utc::now());
        if let Err(e) = self.store.put(&cred_key(record.id), &record).await {
            warn!(username = %record.username, error = %e, "failed to close abandoned credential");
        }
    }

    async fn target_for(&self, cred: &DynamicCredential) -> Result<DbTarget, CredentialError> {
        let ciphertext = crypto::decode_b64("ciphertext", &cred.admin_password.ciphertext)
            .map_err(|e| invalid(e.to_string()))?;
        let iv = crypto::decode_b64("iv", &cred.admin_password.iv).map_err(|e| invalid(e.to_string()))?;
        let plain = self.kms.decrypt(&cred.admin_password.key_name, &ciphertext, &iv).await?;
        let admin_password = String::from_utf8(plain).map_err(|e| invalid(format!("admin password is not UTF-8: {e}")))?;
        Ok(DbTarget {
            host: cred.db_host.clone(),
            port: cred.db_port,
            database: cred.db_name.clone(),
            admin_username: cred.admin_username.clone(),
            admin_password,
        })
    }

    /// A tracked credential by id.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Store`] if storage fails.
    pub async fn get(&self, id: Uuid) -> Result<Option<DynamicCredential>, CredentialError> {
        Ok(self.store.get(&cred_key(id)).await?)
    }

    /// Tracked credentials, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Store`] if storage fails.
    pub async fn list(&self, include_revoked: bool) -> Result<Vec<DynamicCredential>, CredentialError> {
        let mut creds: Vec<DynamicCredential> = self
            .store
            .scan::<DynamicCredential>(CRED_PREFIX)
            .await?
            .into_iter()
            .filter(|c| include_revoked || !c.revoked)
            .collect();
        creds.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(creds)
    }

    /// Drop the role and mark the credential revoked. Returns `false` if it
    /// was already revoked.
    ///
    /// The record stays unrevoked when the drop fails, so a later sweep
    /// retries it.
    ///
    /// # Errors
    ///
    /// - [`CredentialError::NotFound`] if the id is unknown.
    /// - [`CredentialError::Ddl`] if the role could not be dropped.
    pub async fn revoke(&self, id: Uuid) -> Result<bool, CredentialError> {
        let mut cred = self
            .get(id)
            .await?
            .ok_or_else(|| CredentialError::NotFound { id: id.to_string() })?;
        if cred.revoked {
            return Ok(false);
        }

        let target = self.target_for(&cred).await?;
        // An abandoned record may never have reached CREATE ROLE.
        if !cred.pending || self.executor.role_exists(&target, &cred.username).await? {
            self.executor.drop_role(&target, &cred.username).await?;
        }

        cred.pending = false;
        cred.revoked = true;
        cred.revoked_at = Some(Utc::now());
        self.store.put(&cred_key(id), &cred).await?;

        self.audit
            .record(
                AuditEntry::new("credential.dynamic.revoke", "DynamicCredential")
                    .entity(id.to_string())
                    .details(serde_json::json!({ "username": cred.username })),
            )
            .await?;
        info!(username = %cred.username, "dynamic credential revoked");
        Ok(true)
    }

    /// Revoke every expired or abandoned, unrevoked credential. Failures are
    /// logged and the sweep moves on.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Store`] only if the list cannot be read.
    pub async fn revoke_expired(&self) -> Result<usize, CredentialError> {
        let expired: Vec<DynamicCredential> = self
            .list(false)
            .await?
            .into_iter()
            .filter(|c| c.is_expired() || c.is_abandoned())
            .collect();

        let mut revoked = 0usize;
        let mut failed = 0usize;
        for cred in expired {
            match self.revoke(cred.id).await {
                Ok(true) => revoked = revoked.saturating_add(1),
                Ok(false) => {}
                Err(e) => {
                    warn!(username = %cred.username, error = %e, "failed to revoke expired credential");
                    failed = failed.saturating_add(1);
                }
            }
        }

        if revoked > 0 || failed > 0 {
            info!(revoked, failed, "expired dynamic credentials swept");
        }
        Ok(revoked)
    }

    /// Overwrite a record. Test hook for moving expiry into the past.
    #[cfg(test)]
    pub(crate) async fn overwrite(&self, cred: &DynamicCredential) {
        let _ = self.store.put(&cred_key(cred.id), cred).await;
    }
}

impl fmt::Debug for DynamicCredentialEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicCredentialEngine").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionKey;
    use crate::kms::LocalKms;
    use crate::store::SettingsStore;
    use ivf_vault_storage::MemoryBackend;

    fn target() -> DbTarget {
        DbTarget {
            host: "db.internal".to_owned(),
            port: 5432,
            database: "ivf_db".to_owned(),
            admin_username: "postgres".to_owned(),
            admin_password: "admin-pw".to_owned(),
        }
    }

    fn request() -> CredentialRequest {
        CredentialRequest {
            target: target(),
            ttl_seconds: 3600,
            read_only: true,
            granted_tables: vec!["patients".to_owned(), "public.cycles".to_owned()],
        }
    }

    fn engine() -> (DynamicCredentialEngine, Arc<MemoryRoleExecutor>, Arc<MemoryBackend>) {
        let storage = Arc::new(MemoryBackend::new());
        let settings = SettingsStore::new(storage.clone());
        let kms: Arc<dyn KmsProvider> = Arc::new(LocalKms::new(settings, EncryptionKey::generate()));
        let exec = Arc::new(MemoryRoleExecutor::new());
        let audit = Arc::new(AuditTrail::new(storage.clone()));
        let engine = DynamicCredentialEngine::new(JsonStore::new(storage.clone()), kms, exec.clone(), audit);
        (engine, exec, storage)
    }

    // ── sanitizer ─────────────────────────────────────────────────────

    #[test]
    fn sanitizer_strips_injection_payloads() {
        let cases = [
            ("patients", "patients"),
            ("public.patients", "public.patients"),
            ("patients\"; DROP TABLE users; --", "patientsDROPTABLEusers"),
            ("x' OR '1'='1", "xOR11"),
            ("a\\b\0c", "abc"),
            ("tab\tle\nname", "tablename"),
            ("bệnh_nhân", "bnh_nhn"),
            ("$1;", "1"),
            ("", ""),
        ];
        for (input, expected) in cases {
            assert_eq!(sanitize_identifier(input), expected, "input {input:?}");
        }
    }

    #[test]
    fn quote_identifier_quotes_each_part() {
        assert_eq!(quote_identifier("public.patients").as_deref(), Some("\"public\".\"patients\""));
        assert_eq!(quote_identifier("..x..").as_deref(), Some("\"x\""));
        assert_eq!(quote_identifier("\"; --"), None);
    }

    #[test]
    fn quote_literal_doubles_quotes() {
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn connection_string_format() {
        assert_eq!(
            connection_string("h", 5433, "ivf_db", "u", "p"),
            "Host=h;Port=5433;Database=ivf_db;Username=u;Password=p"
        );
    }

    #[test]
    fn create_statements_for_read_only_tables() {
        let spec = RoleSpec {
            username: "ivf_dyn_abc".to_owned(),
            password: "pw".to_owned(),
            valid_until: DateTime::parse_from_rfc3339("2030-01-02T03:04:05Z").unwrap().with_timezone(&Utc),
            database: "ivf_db".to_owned(),
            read_only: true,
            tables: vec!["patients".to_owned()],
        };
        let s = create_role_statements(&spec).unwrap();
        assert_eq!(
            s,
            vec![
                "CREATE ROLE \"ivf_dyn_abc\" LOGIN PASSWORD 'pw' VALID UNTIL '2030-01-02 03:04:05+00'".to_owned(),
                "GRANT CONNECT ON DATABASE \"ivf_db\" TO \"ivf_dyn_abc\"".to_owned(),
                "GRANT SELECT ON TABLE \"patients\" TO \"ivf_dyn_abc\"".to_owned(),
            ]
        );
    }

    #[test]
    fn create_statements_default_to_schema_grant() {
        let spec = RoleSpec {
            username: "ivf_dyn_abc".to_owned(),
            password: "pw".to_owned(),
            valid_until: Utc::now(),
            database: "ivf_db".to_owned(),
            read_only: false,
            tables: Vec::new(),
        };
        let s = create_role_statements(&spec).unwrap();
        assert_eq!(
            s[2],
            "GRANT SELECT, INSERT, UPDATE, DELETE ON ALL TABLES IN SCHEMA public TO \"ivf_dyn_abc\""
        );
    }

    // ── engine ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn generate_creates_role_and_tracks_it() {
        let (engine, exec, _) = engine();
        let issued = engine.generate(&request()).await.unwrap();

        assert!(issued.username.starts_with(ROLE_PREFIX));
        assert_eq!(issued.username.len(), ROLE_PREFIX.len() + 12);
        assert!(issued.connection_string.starts_with("Host=db.internal;Port=5432;Database=ivf_db;"));
        assert!(issued.connection_string.ends_with(&format!("Password={}", issued.password)));
        assert!(exec.roles().await.contains(&issued.username));

        let tracked = engine.get(issued.id).await.unwrap().unwrap();
        assert_eq!(tracked.username, issued.username);
        assert!(!tracked.revoked);

        let statements = exec.statements().await;
        assert!(statements.iter().any(|s| s.contains("ON TABLE \"public\".\"cycles\"")));
    }

    #[tokio::test]
    async fn admin_password_is_not_stored_in_clear() {
        let (engine, _, storage) = engine();
        let issued = engine.generate(&request()).await.unwrap();
        let raw = ivf_vault_storage::StorageBackend::get(storage.as_ref(), &cred_key(issued.id))
            .await
            .unwrap()
            .unwrap();
        let text = String::from_utf8(raw).unwrap();
        assert!(!text.contains("admin-pw"));
        assert!(!text.contains(&issued.password));
    }

    #[tokio::test]
    async fn generate_fails_when_role_missing() {
        let (engine, exec, _) = engine();
        exec.set_silent_creates(true).await;
        let err = engine.generate(&request()).await.unwrap_err();
        assert!(matches!(err, CredentialError::RoleMissing { .. }));
        assert!(engine.list(false).await.unwrap().is_empty());
        let closed = engine.list(true).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert!(closed[0].revoked && !closed[0].pending);
    }

    #[tokio::test]
    async fn generate_rejects_ttl_beyond_calendar() {
        let (engine, exec, _) = engine();
        for ttl in [i64::MAX, i64::MAX / 1000, 400_000 * 365 * 86_400] {
            let mut req = request();
            req.ttl_seconds = ttl;
            assert!(matches!(engine.generate(&req).await, Err(CredentialError::InvalidArgument { .. })));
        }
        assert!(exec.statements().await.is_empty());
        assert!(engine.list(true).await.unwrap().is_empty());
    }

    /// Creates the role, then never returns.
    struct StallingExecutor(Arc<MemoryRoleExecutor>);

    #[async_trait::async_trait]
    impl RoleExecutor for StallingExecutor {
        async fn create_role(&self, target: &DbTarget, spec: &RoleSpec) -> Result<(), CredentialError> {
            self.0.create_role(target, spec).await?;
            std::future::pending().await
        }

        async fn drop_role(&self, target: &DbTarget, username: &str) -> Result<(), CredentialError> {
            self.0.drop_role(target, username).await
        }

        async fn role_exists(&self, target: &DbTarget, username: &str) -> Result<bool, CredentialError> {
            self.0.role_exists(target, username).await
        }
    }

    #[tokio::test]
    async fn interrupted_generate_leaves_record_for_sweep() {
        let storage = Arc::new(MemoryBackend::new());
        let kms: Arc<dyn KmsProvider> = Arc::new(LocalKms::new(
            SettingsStore::new(storage.clone()),
            EncryptionKey::generate(),
        ));
        let inner = Arc::new(MemoryRoleExecutor::new());
        let engine = DynamicCredentialEngine::new(
            JsonStore::new(storage.clone()),
            kms,
            Arc::new(StallingExecutor(inner.clone())),
            Arc::new(AuditTrail::new(storage)),
        );

        let dropped = tokio::time::timeout(std::time::Duration::from_millis(50), engine.generate(&request())).await;
        assert!(dropped.is_err());
        assert_eq!(inner.roles().await.len(), 1);

        let mut orphan = engine.list(false).await.unwrap().pop().unwrap();
        assert!(orphan.pending);
        assert!(inner.roles().await.contains(&orphan.username));
        // Young pending records are left alone.
        assert_eq!(engine.revoke_expired().await.unwrap(), 0);

        orphan.created_at = Utc::now() - Duration::seconds(PENDING_GRACE_SECS + 1);
        engine.overwrite(&orphan).await;
        assert_eq!(engine.revoke_expired().await.unwrap(), 1);
        assert!(inner.roles().await.is_empty());
        let closed = engine.get(orphan.id).await.unwrap().unwrap();
        assert!(closed.revoked && !closed.pending);
    }

    #[tokio::test]
    async fn abandoned_record_without_role_is_closed() {
        let (engine, exec, _) = engine();
        let issued = engine.generate(&request()).await.unwrap();
        let mut cred = engine.get(issued.id).await.unwrap().unwrap();
        engine.revoke(issued.id).await.unwrap();
        cred.pending = true;
        cred.created_at = Utc::now() - Duration::seconds(PENDING_GRACE_SECS + 1);
        engine.overwrite(&cred).await;
        exec.fail_drop(&cred.username).await;

        // The role is gone, so no drop is attempted.
        assert_eq!(engine.revoke_expired().await.unwrap(), 1);
        assert!(engine.get(issued.id).await.unwrap().unwrap().revoked);
    }

    #[tokio::test]
    async fn generate_rejects_bad_requests() {
        let (engine, exec, _) = engine();
        let mut req = request();
        req.ttl_seconds = 0;
        assert!(matches!(engine.generate(&req).await, Err(CredentialError::InvalidArgument { .. })));

        let mut req = request();
        req.granted_tables = vec!["\"; --".to_owned()];
        assert!(matches!(engine.generate(&req).await, Err(CredentialError::InvalidArgument { .. })));
        assert!(exec.statements().await.is_empty());
    }

    #[tokio::test]
    async fn revoke_drops_role_once() {
        let (engine, exec, _) = engine();
        let issued = engine.generate(&request()).await.unwrap();
        assert!(engine.revoke(issued.id).await.unwrap());
        assert!(!engine.revoke(issued.id).await.unwrap());
        assert!(!exec.roles().await.contains(&issued.username));
        assert!(engine.get(issued.id).await.unwrap().unwrap().revoked);
        assert!(engine.list(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn revoke_unknown_is_not_found() {
        let (engine, _, _) = engine();
        assert!(matches!(
            engine.revoke(Uuid::new_v4()).await,
            Err(CredentialError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn sweep_isolates_failures() {
        let (engine, exec, _) = engine();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let issued = engine.generate(&request()).await.unwrap();
            let mut cred = engine.get(issued.id).await.unwrap().unwrap();
            cred.expires_at = Utc::now() - Duration::seconds(1);
            engine.overwrite(&cred).await;
            ids.push((issued.id, issued.username));
        }
        let live = engine.generate(&request()).await.unwrap();
        exec.fail_drop(&ids[1].1).await;

        assert_eq!(engine.revoke_expired().await.unwrap(), 2);
        assert!(engine.get(ids[0].0).await.unwrap().unwrap().revoked);
        assert!(!engine.get(ids[1].0).await.unwrap().unwrap().revoked);
        assert!(engine.get(ids[2].0).await.unwrap().unwrap().revoked);
        assert!(!engine.get(live.id).await.unwrap().unwrap().revoked);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Sanitized output only ever contains the allow-list.
        #[test]
        fn prop_sanitized_is_allow_listed(input in ".*") {
            let out = sanitize_identifier(&input);
            prop_assert!(out.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.'));
        }

        /// Sanitizing twice changes nothing.
        #[test]
        fn prop_sanitize_idempotent(input in ".*") {
            let once = sanitize_identifier(&input);
            prop_assert_eq!(sanitize_identifier(&once), once);
        }

        /// Allow-listed input passes through unchanged.
        #[test]
        fn prop_clean_input_unchanged(input in "[A-Za-z0-9_.]{0,64}") {
            prop_assert_eq!(sanitize_identifier(&input), input);
        }

        /// A quoted identifier can never close its quotes early.
        #[test]
        fn prop_quoted_has_only_delimiter_quotes(input in ".*") {
            if let Some(q) = quote_identifier(&input) {
                for part in q.split('.') {
                    prop_assert!(part.len() >= 3);
                    prop_assert!(part.starts_with('"') && part.ends_with('"'));
                    prop_assert!(!part[1..part.len() - 1].contains('"'));
                }
            }
        }
    }
}
