//! Lifecycle errors.

use thiserror::Error;

use crate::{
    credentials::SyncError,
    errors::ErrorKind,
    identity::{NameError, RoleName, TenantId},
    registry::{RegistryError, TeardownStage},
    secrets::PasswordError,
    store::StoreError,
};

/// Tenant lifecycle errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Tenant id, subdomain or role name is not valid.
    #[error(transparent)]
    InvalidName(#[from] NameError),

    /// Supplied password is not usable.
    #[error(transparent)]
    InvalidPassword(#[from] PasswordError),

    /// Requested subdomain would expose the tenant through the root identity.
    #[error("subdomain {0} is reserved for the root identity")]
    ReservedSubdomain(String),

    /// Tenant database would be exempt from the access gate.
    #[error("{0} is an administrative database and cannot hold a tenant")]
    AdministrativeDatabase(TenantId),

    /// Tenant is already registered or its database or owner role already exists.
    #[error("tenant {0} already exists")]
    AlreadyExists(TenantId),

    /// Role already exists.
    #[error("role {0} already exists")]
    RoleExists(RoleName),

    /// Role is not part of the tenant.
    #[error("role {role} does not belong to tenant {tenant}")]
    UnknownRole {
        /// Tenant id.
        tenant: TenantId,

        /// Role name.
        role: RoleName,
    },

    /// Operation needs a live tenant.
    #[error("tenant {tenant} is {status}")]
    NotLive {
        /// Tenant id.
        tenant: TenantId,

        /// Current status.
        status: &'static str,
    },

    /// Tenant was already quarantined; its leftovers need manual attention.
    #[error("tenant {0} is already destroyed-quarantined")]
    AlreadyQuarantined(TenantId),

    /// Registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Primary store failure.
    #[error("primary store failed to {operation}")]
    Store {
        /// Operation attempted.
        operation: &'static str,

        /// Store error.
        #[source]
        source: StoreError,
    },

    /// Credential cache could not be synchronized.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Another process holds the tenant lock.
    #[error("tenant {0} is locked by another operation")]
    Locked(TenantId),

    /// Teardown was aborted; the tenant stays tearing down at `stage`.
    #[error("teardown of {tenant} aborted at {stage}")]
    Aborted {
        /// Tenant id.
        tenant: TenantId,

        /// Stage a later call resumes from.
        stage: TeardownStage,
    },

    /// Quarantine itself failed; the tenant stays tearing down.
    #[error("failed to quarantine {tenant}")]
    QuarantineFailed {
        /// Tenant id.
        tenant: TenantId,

        /// Store error.
        #[source]
        source: StoreError,
    },
}

impl LifecycleError {
    /// Error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidName(_)
            | Self::InvalidPassword(_)
            | Self::ReservedSubdomain(_)
            | Self::AdministrativeDatabase(_)
            | Self::NotLive { .. } => ErrorKind::InvalidInput,
            Self::AlreadyExists(_) | Self::RoleExists(_) => ErrorKind::DuplicateIdentity,
            Self::UnknownRole { .. } => ErrorKind::NotFound,
            Self::AlreadyQuarantined(_) | Self::QuarantineFailed { .. } => {
                ErrorKind::DependencyUnresolved
            }
            Self::Registry(error) => error.kind(),
            Self::Store { source, .. } => source.kind(),
            Self::Sync(error) => error.kind(),
            Self::Locked(_) => ErrorKind::RegistryUnavailable,
            Self::Aborted { .. } => ErrorKind::Aborted,
        }
    }

    pub(crate) fn store(operation: &'static str) -> impl Fn(StoreError) -> Self {
        move |source| Self::Store { operation, source }
    }
}
