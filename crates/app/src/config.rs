//! CLI configuration
//!
//! Engine settings come from three layers: an optional YAML file, then environment variables,
//! then flags. clap resolves the last two; the file is merged underneath.

use std::{path::PathBuf, time::Duration};

use clap::Args;
use tenantgate::config::{ConfigError, EngineConfig, PartialEngineConfig};

/// Engine settings.
#[derive(Debug, Default, Args)]
pub struct EngineArgs {
    /// YAML configuration file; environment variables and flags override its values
    #[arg(long = "config", env = "TENANTGATE_CONFIG", global = true)]
    pub config_file: Option<PathBuf>,

    /// Registry file mapping tenants to subdomains
    #[arg(long, env = "TENANTGATE_REGISTRY_PATH", global = true)]
    pub registry_path: Option<PathBuf>,

    /// Credential cache file read by the connection pooler
    #[arg(long, env = "TENANTGATE_CACHE_PATH", global = true)]
    pub cache_path: Option<PathBuf>,

    /// Shared root hostname tenant subdomains live under
    #[arg(long, env = "TENANTGATE_ROOT_IDENTITY", global = true)]
    pub root_identity: Option<String>,

    /// Attempts per external call
    #[arg(long, env = "TENANTGATE_RETRY_LIMIT", global = true)]
    pub retry_limit: Option<u32>,

    /// Base delay between attempts in milliseconds
    #[arg(long, env = "TENANTGATE_RETRY_BACKOFF_MS", global = true)]
    pub retry_backoff_ms: Option<u64>,

    /// Directory for credential cache backups
    #[arg(long, env = "TENANTGATE_BACKUP_DIR", global = true)]
    pub backup_dir: Option<PathBuf>,

    /// Directory for lock files
    #[arg(long, env = "TENANTGATE_LOCK_DIR", global = true)]
    pub lock_dir: Option<PathBuf>,

    /// Longest wait in milliseconds for another operation on the same tenant
    #[arg(long, env = "TENANTGATE_TENANT_LOCK_TIMEOUT_MS", global = true)]
    pub tenant_lock_timeout_ms: Option<u64>,

    /// Platform administrator role receiving reassigned ownership
    #[arg(long, env = "TENANTGATE_ADMIN_ROLE", global = true)]
    pub admin_role: Option<String>,
}

impl EngineArgs {
    fn overrides(&self) -> PartialEngineConfig {
        PartialEngineConfig {
            registry_path: self.registry_path.clone(),
            cache_path: self.cache_path.clone(),
            root_identity: self.root_identity.clone(),
            retry_limit: self.retry_limit,
            retry_backoff_ms: self.retry_backoff_ms,
            backup_dir: self.backup_dir.clone(),
            lock_dir: self.lock_dir.clone(),
            tenant_lock_timeout_ms: self.tenant_lock_timeout_ms,
            admin_role: self.admin_role.clone(),
            ..PartialEngineConfig::default()
        }
    }

    /// Resolve the engine configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the file cannot be read, a required value is missing or
    /// validation fails.
    pub fn load(&self) -> Result<EngineConfig, ConfigError> {
        let file = match &self.config_file {
            Some(path) => PartialEngineConfig::from_yaml_file(path)?,
            None => PartialEngineConfig::default(),
        };

        file.merge(self.overrides()).into_config()
    }
}

/// Settings of the concrete collaborators.
#[derive(Debug, Args)]
pub struct AdapterArgs {
    /// Administrative `PostgreSQL` connection string; the `PG*` variables apply when unset
    #[arg(long, env = "DATABASE_URL", hide = true, global = true)]
    pub database_url: Option<String>,

    /// Service-manager unit of the connection pooler
    #[arg(
        long,
        env = "TENANTGATE_POOLER_UNIT",
        default_value = "pgbouncer",
        global = true
    )]
    pub pooler_unit: String,

    /// Seconds to wait for a single service-manager action
    #[arg(
        long,
        env = "TENANTGATE_POOLER_TIMEOUT_SECONDS",
        default_value_t = 30_u64,
        global = true
    )]
    pub pooler_timeout_seconds: u64,
}

impl AdapterArgs {
    /// Timeout for a single service-manager action.
    #[must_use]
    pub const fn pooler_timeout(&self) -> Duration {
        Duration::from_secs(self.pooler_timeout_seconds)
    }
}
