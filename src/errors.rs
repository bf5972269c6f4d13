//! Error classification
//!
//! Every component keeps its own error enum; [`ErrorKind`] is the closed classification they
//! all map onto, used by callers to decide on retries and by the CLI to pick exit codes.

use std::fmt;

use serde::Serialize;

/// Closed classification of engine failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Tenant, role or mapping does not exist.
    NotFound,

    /// Tenant id, subdomain or role name collides with another live tenant.
    DuplicateIdentity,

    /// Declared network identity did not exactly match the tenant's subdomain.
    IdentityMismatch,

    /// Registry file could not be read, parsed or written.
    RegistryUnavailable,

    /// Credential cache write or pooling-layer reload failed.
    SyncFailure,

    /// Teardown could not resolve role dependencies.
    DependencyUnresolved,

    /// Credential cache line is malformed.
    CorruptCacheEntry,

    /// Caller supplied an invalid name, scope or configuration value.
    InvalidInput,

    /// Operation was aborted by the operator.
    Aborted,

    /// Primary store rejected or failed a request.
    StoreFailure,
}

impl ErrorKind {
    /// Stable name of the kind, as printed by the CLI.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::DuplicateIdentity => "DuplicateIdentity",
            Self::IdentityMismatch => "IdentityMismatch",
            Self::RegistryUnavailable => "RegistryUnavailable",
            Self::SyncFailure => "SyncFailure",
            Self::DependencyUnresolved => "DependencyUnresolved",
            Self::CorruptCacheEntry => "CorruptCacheEntry",
            Self::InvalidInput => "InvalidInput",
            Self::Aborted => "Aborted",
            Self::StoreFailure => "StoreFailure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
