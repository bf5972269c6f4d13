//! Tenantgate prelude.
//!
//! Convenience exports for common library consumers.

pub use crate::{
    config::{ConfigError, EngineConfig, PartialEngineConfig},
    credentials::{
        CacheDocument, CacheEntry, CredentialSynchronizer, EntryChange, ReloadOutcome,
        RepairReport, SyncAction, SyncError, SyncOneReport, SyncReport,
    },
    engine::Engine,
    errors::ErrorKind,
    gate::{
        AccessDecision, AccessGate, AdmittedSession, AllowReason, ConnectionAttempt,
        DeclaredIdentity, IdentitySource, RejectReason, RejectedSession, Session,
    },
    identity::{NameError, RoleName, Subdomain, TenantId},
    lifecycle::{
        AbortHandle, CreatedTenant, DestroyOutcome, DestroyReport, LifecycleError,
        LifecycleManager, members::MemberCredentials,
    },
    process::{ControllerError, ProcessController, ProcessStatus},
    registry::{
        MemberAccess, MemberRole, RegistryError, RoleScope, TeardownMode, TeardownStage, Tenant,
        TenantRegistry, TenantStatus,
    },
    retry::{RetryError, RetryPolicy, Transient},
    secrets::{Password, SecretHash},
    store::{PrimaryStore, StoreError},
};
