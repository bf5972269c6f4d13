//! Access Gate
//!
//! Evaluated once per session: a tenant database is reachable only when the session declares
//! exactly the tenant's own network identity. The gate reads a fresh registry snapshot for
//! every evaluation and takes no locks. Any doubt about the registry rejects the session.

use std::{fmt, sync::Arc};

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    config::EngineConfig,
    errors::ErrorKind,
    identity::{RoleName, Subdomain, TenantId},
    registry::{RoleScope, TenantRegistry},
};

pub mod session;

pub use session::{AdmittedSession, IdentityDeclared, RejectedSession, Session, Unauthenticated};

/// Where a declared identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentitySource {
    /// Server name negotiated during the TLS handshake.
    TlsServerName,

    /// Header injected by a proxy inside the trust boundary.
    TrustedProxyHeader,

    /// The client-settable `application_name`; never trusted.
    ApplicationName,
}

impl IdentitySource {
    /// Whether the connecting client cannot choose this value freely.
    #[must_use]
    pub const fn is_trusted(self) -> bool {
        matches!(self, Self::TlsServerName | Self::TrustedProxyHeader)
    }
}

/// Network identity a session claims to connect through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeclaredIdentity {
    /// Origin of the value.
    pub source: IdentitySource,

    /// Hostname as declared.
    pub value: String,
}

impl DeclaredIdentity {
    /// Identity taken from the TLS server name.
    #[must_use]
    pub fn tls_server_name(value: impl Into<String>) -> Self {
        Self {
            source: IdentitySource::TlsServerName,
            value: value.into(),
        }
    }
}

/// Inbound session as seen by the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAttempt {
    /// Connecting role.
    pub role: RoleName,

    /// Scope of the connecting role.
    pub scope: RoleScope,

    /// Target database.
    pub database: String,

    /// Declared network identity, if any.
    pub identity: Option<DeclaredIdentity>,
}

/// Why a session was allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllowReason {
    /// Superuser bypass.
    Superuser,

    /// Target is an administrative database.
    AdministrativeDatabase,

    /// Declared identity equals the tenant's subdomain.
    IdentityMatched,
}

/// Why a session was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    /// No identity, or an empty one, was declared.
    MissingIdentity,

    /// Identity came from a client-settable source.
    UntrustedIdentitySource,

    /// No tenant is registered for the target database.
    UnknownDatabase,

    /// Tenant exists but is being torn down or is quarantined.
    TenantNotLive,

    /// Declared identity differs from the tenant's subdomain.
    IdentityMismatch,

    /// Registry could not be read or parsed.
    RegistryUnavailable,
}

impl RejectReason {
    /// Error classification.
    #[must_use]
    pub const fn kind(self) -> ErrorKind {
        match self {
            Self::MissingIdentity | Self::UntrustedIdentitySource | Self::IdentityMismatch => {
                ErrorKind::IdentityMismatch
            }
            Self::UnknownDatabase | Self::TenantNotLive => ErrorKind::NotFound,
            Self::RegistryUnavailable => ErrorKind::RegistryUnavailable,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MissingIdentity => "no network identity declared",
            Self::UntrustedIdentitySource => "identity source is client-settable",
            Self::UnknownDatabase => "no tenant registered for database",
            Self::TenantNotLive => "tenant is not live",
            Self::IdentityMismatch => "declared identity does not match the tenant subdomain",
            Self::RegistryUnavailable => "registry unavailable",
        })
    }
}

/// Terminal decision for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "kebab-case")]
pub enum AccessDecision {
    /// Session may run statements.
    Allowed(AllowReason),

    /// Session must not run any statement.
    Rejected(RejectReason),
}

impl AccessDecision {
    /// Whether the session was allowed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }
}

/// Per-session identity check.
#[derive(Debug, Clone)]
pub struct AccessGate {
    registry: Arc<TenantRegistry>,
    root_identity: String,
    administrative_databases: Vec<String>,
}

impl AccessGate {
    /// Gate reading `registry`.
    #[must_use]
    pub fn new(registry: Arc<TenantRegistry>, config: &EngineConfig) -> Self {
        Self {
            registry,
            root_identity: config.root_identity.clone(),
            administrative_databases: config.administrative_databases.clone(),
        }
    }

    /// Decide whether the session may proceed.
    pub fn evaluate(&self, attempt: &ConnectionAttempt) -> AccessDecision {
        let decision = self.decide(attempt);

        match decision {
            AccessDecision::Allowed(reason) => {
                debug!(
                    role = %attempt.role,
                    database = %attempt.database,
                    ?reason,
                    "session allowed"
                );
            }
            AccessDecision::Rejected(reason) => {
                warn!(
                    role = %attempt.role,
                    database = %attempt.database,
                    identity = attempt.identity.as_ref().map(|identity| identity.value.as_str()),
                    %reason,
                    "session rejected"
                );
            }
        }

        decision
    }

    /// Diagnostic check: would a tenant-scoped session declaring `identity` through the TLS
    /// server name reach tenant `id`? Reads the registry only.
    pub fn validate_access(&self, id: &TenantId, identity: &str) -> AccessDecision {
        self.evaluate(&ConnectionAttempt {
            role: id.owner_role(),
            scope: RoleScope::TenantOwner,
            database: id.to_string(),
            identity: Some(DeclaredIdentity::tls_server_name(identity)),
        })
    }

    fn decide(&self, attempt: &ConnectionAttempt) -> AccessDecision {
        if attempt.scope.bypasses_isolation() {
            return AccessDecision::Allowed(AllowReason::Superuser);
        }

        if self
            .administrative_databases
            .iter()
            .any(|database| *database == attempt.database)
        {
            return AccessDecision::Allowed(AllowReason::AdministrativeDatabase);
        }

        let Some(identity) = attempt
            .identity
            .as_ref()
            .filter(|identity| !identity.value.trim().is_empty())
        else {
            return AccessDecision::Rejected(RejectReason::MissingIdentity);
        };

        if !identity.source.is_trusted() {
            return AccessDecision::Rejected(RejectReason::UntrustedIdentitySource);
        }

        let Ok(id) = TenantId::parse(&attempt.database) else {
            return AccessDecision::Rejected(RejectReason::UnknownDatabase);
        };

        let snapshot = match self.registry.snapshot() {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(%error, "registry unavailable during access check");

                return AccessDecision::Rejected(RejectReason::RegistryUnavailable);
            }
        };

        let Some(tenant) = snapshot.get(&id) else {
            return AccessDecision::Rejected(RejectReason::UnknownDatabase);
        };

        if !tenant.is_live() {
            return AccessDecision::Rejected(RejectReason::TenantNotLive);
        }

        if identity_matches(&identity.value, &tenant.subdomain, &self.root_identity) {
            AccessDecision::Allowed(AllowReason::IdentityMatched)
        } else {
            AccessDecision::Rejected(RejectReason::IdentityMismatch)
        }
    }
}

/// Exact comparison of a declared hostname against a tenant subdomain.
///
/// Accepts the bare label or the label qualified by the root identity, compared over the
/// full length, ignoring ASCII case. No prefix, suffix or substring match is ever accepted.
#[must_use]
pub fn identity_matches(declared: &str, subdomain: &Subdomain, root_identity: &str) -> bool {
    declared.eq_ignore_ascii_case(subdomain.as_str())
        || declared.eq_ignore_ascii_case(&subdomain.hostname(root_identity))
}
