//! Engine configuration

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{identity::RoleName, retry::RetryPolicy};

/// Default number of attempts per external call.
pub const DEFAULT_RETRY_LIMIT: u32 = 5;

/// Default base delay between attempts, in milliseconds.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 100;

/// Upper bound on a single backoff delay.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Default longest wait for another operation on the same tenant, in milliseconds.
pub const DEFAULT_TENANT_LOCK_TIMEOUT_MS: u64 = 10 * 60 * 1000;

/// Default permission bits of the credential cache.
pub const DEFAULT_CACHE_FILE_MODE: u32 = 0o600;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required value was not provided by any source.
    #[error("missing required configuration value `{0}`")]
    Missing(&'static str),

    /// A provided value is out of range.
    #[error("invalid configuration value `{field}`: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,

        /// Why it was rejected.
        reason: &'static str,
    },

    /// Config file could not be read.
    #[error("failed to read config file {path}")]
    Read {
        /// File path.
        path: PathBuf,

        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid YAML for [`PartialEngineConfig`].
    #[error("failed to parse config file")]
    Parse(#[from] serde_norway::Error),
}

/// Explicit configuration handed to every engine component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Location of the registry file.
    pub registry_path: PathBuf,

    /// Location of the pooler's credential cache.
    pub cache_path: PathBuf,

    /// Shared root network identity, e.g. `db.example.com`.
    pub root_identity: String,

    /// Maximum attempts per external call.
    pub retry_limit: u32,

    /// Base backoff between attempts.
    pub retry_backoff_ms: u64,

    /// Where sync backups go; defaults to the cache's directory.
    pub backup_dir: Option<PathBuf>,

    /// Where lock files go; defaults to the registry's directory.
    pub lock_dir: Option<PathBuf>,

    /// Longest wait for another operation on the same tenant to finish.
    pub tenant_lock_timeout_ms: u64,

    /// Administrator role receiving reassigned ownership on teardown.
    pub admin_role: String,

    /// Databases exempt from the access gate.
    pub administrative_databases: Vec<String>,

    /// Permission bits applied to the credential cache.
    pub cache_file_mode: u32,
}

impl EngineConfig {
    /// Configuration with defaults for everything but the three paths.
    #[must_use]
    pub fn new(
        registry_path: impl Into<PathBuf>,
        cache_path: impl Into<PathBuf>,
        root_identity: impl Into<String>,
    ) -> Self {
        Self {
            registry_path: registry_path.into(),
            cache_path: cache_path.into(),
            root_identity: root_identity.into(),
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            backup_dir: None,
            lock_dir: None,
            tenant_lock_timeout_ms: DEFAULT_TENANT_LOCK_TIMEOUT_MS,
            admin_role: default_admin_role(),
            administrative_databases: default_administrative_databases(),
            cache_file_mode: DEFAULT_CACHE_FILE_MODE,
        }
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a zero retry limit, an empty root identity or
    /// admin role name, or a cache mode with bits outside `0o777`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "retryLimit",
                reason: "must be at least 1",
            });
        }

        let root = self.root_identity.trim();

        if root.is_empty() || root.starts_with('.') || root.ends_with('.') {
            return Err(ConfigError::Invalid {
                field: "rootIdentity",
                reason: "must be a non-empty hostname",
            });
        }

        self.admin_role()?;

        if self.cache_file_mode & !0o777 != 0 {
            return Err(ConfigError::Invalid {
                field: "cacheFileMode",
                reason: "must only contain permission bits",
            });
        }

        Ok(())
    }

    /// Retry policy for external calls.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_limit,
            Duration::from_millis(self.retry_backoff_ms),
            MAX_RETRY_BACKOFF,
        )
    }

    /// Longest wait for a tenant lock held by another operation.
    #[must_use]
    pub fn tenant_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.tenant_lock_timeout_ms)
    }

    /// Directory sync backups are written to.
    #[must_use]
    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| parent_or_current(&self.cache_path))
    }

    /// Directory lock files are created in.
    #[must_use]
    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| parent_or_current(&self.registry_path))
    }

    /// Administrator role as a validated name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when `adminRole` is not a valid role name.
    pub fn admin_role(&self) -> Result<RoleName, ConfigError> {
        RoleName::parse(&self.admin_role).map_err(|_error| ConfigError::Invalid {
            field: "adminRole",
            reason: "must be a valid role name",
        })
    }

    /// Whether `database` is exempt from the access gate.
    #[must_use]
    pub fn is_administrative_database(&self, database: &str) -> bool {
        self.administrative_databases
            .iter()
            .any(|admin| admin == database)
    }
}

fn parent_or_current(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn default_admin_role() -> String {
    "postgres".to_string()
}

fn default_administrative_databases() -> Vec<String> {
    ["postgres", "template0", "template1"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Layer of configuration values from one source (file, environment, flags).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PartialEngineConfig {
    /// Registry file.
    pub registry_path: Option<PathBuf>,

    /// Credential cache file.
    pub cache_path: Option<PathBuf>,

    /// Shared root identity.
    pub root_identity: Option<String>,

    /// Attempts per external call.
    pub retry_limit: Option<u32>,

    /// Base backoff in milliseconds.
    pub retry_backoff_ms: Option<u64>,

    /// Backup directory.
    pub backup_dir: Option<PathBuf>,

    /// Lock directory.
    pub lock_dir: Option<PathBuf>,

    /// Tenant lock wait in milliseconds.
    pub tenant_lock_timeout_ms: Option<u64>,

    /// Administrator role.
    pub admin_role: Option<String>,

    /// Gate-exempt databases.
    pub administrative_databases: Option<Vec<String>>,

    /// Cache permission bits.
    pub cache_file_mode: Option<u32>,
}

impl PartialEngineConfig {
    /// Parse a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on invalid YAML or unknown keys.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_norway::from_str(yaml)?)
    }

    /// Read and parse a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_yaml_str(&yaml)
    }

    /// Overlay `other` on top of `self`; values set in `other` win.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            registry_path: other.registry_path.or(self.registry_path),
            cache_path: other.cache_path.or(self.cache_path),
            root_identity: other.root_identity.or(self.root_identity),
            retry_limit: other.retry_limit.or(self.retry_limit),
            retry_backoff_ms: other.retry_backoff_ms.or(self.retry_backoff_ms),
            backup_dir: other.backup_dir.or(self.backup_dir),
            lock_dir: other.lock_dir.or(self.lock_dir),
            tenant_lock_timeout_ms: other
                .tenant_lock_timeout_ms
                .or(self.tenant_lock_timeout_ms),
            admin_role: other.admin_role.or(self.admin_role),
            administrative_databases: other
                .administrative_databases
                .or(self.administrative_databases),
            cache_file_mode: other.cache_file_mode.or(self.cache_file_mode),
        }
    }

    /// Fill defaults and validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when a path or the root identity is unset, or
    /// [`ConfigError::Invalid`] when validation fails.
    pub fn into_config(self) -> Result<EngineConfig, ConfigError> {
        let registry_path = self
            .registry_path
            .ok_or(ConfigError::Missing("registryPath"))?;
        let cache_path = self.cache_path.ok_or(ConfigError::Missing("cachePath"))?;
        let root_identity = self
            .root_identity
            .ok_or(ConfigError::Missing("rootIdentity"))?;

        let mut config = EngineConfig::new(registry_path, cache_path, root_identity);

        if let Some(retry_limit) = self.retry_limit {
            config.retry_limit = retry_limit;
        }

        if let Some(retry_backoff_ms) = self.retry_backoff_ms {
            config.retry_backoff_ms = retry_backoff_ms;
        }

        if let Some(timeout) = self.tenant_lock_timeout_ms {
            config.tenant_lock_timeout_ms = timeout;
        }

        if let Some(admin_role) = self.admin_role {
            config.admin_role = admin_role;
        }

        if let Some(databases) = self.administrative_databases {
            config.administrative_databases = databases;
        }

        if let Some(mode) = self.cache_file_mode {
            config.cache_file_mode = mode;
        }

        config.backup_dir = self.backup_dir;
        config.lock_dir = self.lock_dir;

        config.validate()?;

        Ok(config)
    }
}
