//! Daemon configuration.
//!
//! Loaded from `IVF_VAULT_*` environment variables with defaults. Parsing
//! goes through a lookup function so tests never touch the process
//! environment.

use ivf_vault_core::dynamic::DbTarget;

/// Upper bound on `IVF_VAULT_SESSION_MAX_AGE_HOURS` (one year).
pub const MAX_SESSION_AGE_HOURS: i64 = 8_760;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub storage_backend: StorageBackendType,
    /// Log filter (e.g. `info`, `ivf_vault_core=debug`).
    pub log_level: String,
    /// JSON-lines audit file, if file audit is enabled.
    pub audit_file_path: Option<String>,
    /// `Local`, `Azure`, `AWS` or `HashiCorp`.
    pub kms_provider: String,
    /// Base64 root key for the local KMS.
    pub local_master_key: Option<String>,
    /// Seconds between maintenance sweeps.
    pub maintenance_interval_secs: u64,
    pub session_max_age_hours: i64,
    /// Withhold secrets until an unseal provider has supplied the master key.
    pub require_unseal: bool,
    pub db_rotation: Option<DbRotationConfig>,
}

/// Target of dual-slot credential rotation. Enabled when
/// `IVF_VAULT_DB_HOST` is set.
#[derive(Clone)]
pub struct DbRotationConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub admin_username: String,
    pub admin_password: String,
    pub credential_ttl_secs: i64,
}

impl std::fmt::Debug for DbRotationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbRotationConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("admin_username", &self.admin_username)
            .field("credential_ttl_secs", &self.credential_ttl_secs)
            .finish_non_exhaustive()
    }
}

impl DbRotationConfig {
    #[must_use]
    pub fn target(&self) -> DbTarget {
        DbTarget {
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            admin_username: self.admin_username.clone(),
            admin_password: self.admin_password.clone(),
        }
    }
}

/// Supported storage backends.
#[derive(Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory (data lost on exit).
    Memory,
    Postgres { url: String },
}

impl std::fmt::Debug for StorageBackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => f.write_str("Memory"),
            Self::Postgres { .. } => f.write_str("Postgres { url: [redacted] }"),
        }
    }
}

impl VaultConfig {
    /// Load configuration from the process environment.
    ///
    /// Environment variables:
    /// - `IVF_VAULT_STORAGE`: `memory` or `postgres` (default: `memory`)
    /// - `IVF_VAULT_DATABASE_URL`, falling back to `DATABASE_URL`
    /// - `IVF_VAULT_LOG_LEVEL` (default: `info`)
    /// - `IVF_VAULT_AUDIT_FILE` (optional)
    /// - `IVF_VAULT_KMS_PROVIDER` (default: `Local`)
    /// - `IVF_VAULT_LOCAL_MASTER_KEY`: base64 32-byte key
    /// - `IVF_VAULT_MAINTENANCE_INTERVAL` seconds (default: `60`)
    /// - `IVF_VAULT_SESSION_MAX_AGE_HOURS` (default: `8`, at most `8760`)
    /// - `IVF_VAULT_REQUIRE_UNSEAL`: `true` or `1` (default: off)
    /// - `IVF_VAULT_DB_HOST`, `IVF_VAULT_DB_PORT` (`5432`), `IVF_VAULT_DB_NAME`
    ///   (`ivf_db`), `IVF_VAULT_DB_ADMIN_USER` (`postgres`),
    ///   `IVF_VAULT_DB_ADMIN_PASSWORD`, `IVF_VAULT_DB_CREDENTIAL_TTL` seconds
    ///   (`86400`)
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_owned());

        let storage_backend = match var("IVF_VAULT_STORAGE", "memory").to_lowercase().as_str() {
            "postgres" | "postgresql" => {
                let url = lookup("IVF_VAULT_DATABASE_URL")
                    .or_else(|| lookup("DATABASE_URL"))
                    .unwrap_or_else(|| "postgres://localhost/ivf_vault".to_owned());
                StorageBackendType::Postgres { url }
            }
            _ => StorageBackendType::Memory,
        };

        let maintenance_interval_secs = lookup("IVF_VAULT_MAINTENANCE_INTERVAL")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(60);

        let session_max_age_hours = lookup("IVF_VAULT_SESSION_MAX_AGE_HOURS")
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|hours| (1..=MAX_SESSION_AGE_HOURS).contains(hours))
            .unwrap_or(8);

        let require_unseal = lookup("IVF_VAULT_REQUIRE_UNSEAL")
            .is_some_and(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"));

        let db_rotation = lookup("IVF_VAULT_DB_HOST").map(|host| DbRotationConfig {
            host,
            port: lookup("IVF_VAULT_DB_PORT").and_then(|v| v.parse().ok()).unwrap_or(5432),
            database: var("IVF_VAULT_DB_NAME", "ivf_db"),
            admin_username: var("IVF_VAULT_DB_ADMIN_USER", "postgres"),
            admin_password: lookup("IVF_VAULT_DB_ADMIN_PASSWORD").unwrap_or_default(),
            credential_ttl_secs: lookup("IVF_VAULT_DB_CREDENTIAL_TTL")
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|ttl| *ttl > 0)
                .unwrap_or(86_400),
        });

        Self {
            storage_backend,
            log_level: var("IVF_VAULT_LOG_LEVEL", "info"),
            audit_file_path: lookup("IVF_VAULT_AUDIT_FILE").filter(|p| !p.trim().is_empty()),
            kms_provider: var("IVF_VAULT_KMS_PROVIDER", "Local"),
            local_master_key: lookup("IVF_VAULT_LOCAL_MASTER_KEY").filter(|k| !k.trim().is_empty()),
            maintenance_interval_secs,
            session_max_age_hours,
            require_unseal,
            db_rotation,
        }
    }
}
