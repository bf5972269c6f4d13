//! Registry errors.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::{
    errors::ErrorKind,
    identity::{Subdomain, TenantId},
    retry::Transient,
};

/// Registry error variants.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No record for the tenant.
    #[error("tenant {0} not found")]
    NotFound(TenantId),

    /// No live tenant is reachable through the subdomain.
    #[error("no live tenant for subdomain {0}")]
    UnknownSubdomain(Subdomain),

    /// Another tenant already holds the id, subdomain or a role name.
    #[error("{field} {value:?} is already used by tenant {owner}")]
    DuplicateIdentity {
        /// `id`, `subdomain` or `role`.
        field: &'static str,

        /// Colliding value.
        value: String,

        /// Tenant holding it.
        owner: TenantId,
    },

    /// Registry file is structurally invalid.
    #[error("registry file is malformed at line {line}: {reason}")]
    Malformed {
        /// 1-based line number.
        line: usize,

        /// What was wrong.
        reason: String,
    },

    /// Another writer holds the registry lock.
    #[error("registry is locked by another writer")]
    Locked,

    /// Registry file could not be read.
    #[error("failed to read registry {path}")]
    Read {
        /// Registry path.
        path: PathBuf,

        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Registry file could not be replaced.
    #[error("failed to write registry {path}")]
    Write {
        /// Registry path.
        path: PathBuf,

        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

impl RegistryError {
    /// Error classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::UnknownSubdomain(_) => ErrorKind::NotFound,
            Self::DuplicateIdentity { .. } => ErrorKind::DuplicateIdentity,
            Self::Malformed { .. } | Self::Locked | Self::Read { .. } | Self::Write { .. } => {
                ErrorKind::RegistryUnavailable
            }
        }
    }
}

impl Transient for RegistryError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Locked | Self::Read { .. } | Self::Write { .. })
    }
}
