//! Session states
//!
//! `Unauthenticated → IdentityDeclared → {Allowed, Rejected}`, one type per state. Only an
//! [`AdmittedSession`] can run statements, and only [`Session::authorize`] can produce one.

use thiserror::Error;

use crate::{
    gate::{
        AccessDecision, AccessGate, AllowReason, ConnectionAttempt, DeclaredIdentity, RejectReason,
    },
    identity::RoleName,
    registry::RoleScope,
};

/// Session before any identity has been extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unauthenticated;

/// Session with its identity extracted, awaiting the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityDeclared;

/// Session in state `S`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session<S> {
    attempt: ConnectionAttempt,
    state: S,
}

impl Session<Unauthenticated> {
    /// New session for `role` targeting `database`.
    #[must_use]
    pub fn new(role: RoleName, scope: RoleScope, database: impl Into<String>) -> Self {
        Self {
            attempt: ConnectionAttempt {
                role,
                scope,
                database: database.into(),
                identity: None,
            },
            state: Unauthenticated,
        }
    }

    /// Record the identity extracted from the connection; `None` when nothing was declared.
    #[must_use]
    pub fn declare_identity(self, identity: Option<DeclaredIdentity>) -> Session<IdentityDeclared> {
        Session {
            attempt: ConnectionAttempt {
                identity,
                ..self.attempt
            },
            state: IdentityDeclared,
        }
    }
}

impl Session<IdentityDeclared> {
    /// Run the gate.
    ///
    /// # Errors
    ///
    /// Returns a [`RejectedSession`] when the gate rejects the session.
    pub fn authorize(self, gate: &AccessGate) -> Result<AdmittedSession, RejectedSession> {
        match gate.evaluate(&self.attempt) {
            AccessDecision::Allowed(reason) => Ok(AdmittedSession {
                attempt: self.attempt,
                reason,
            }),
            AccessDecision::Rejected(reason) => Err(RejectedSession {
                attempt: self.attempt,
                reason,
            }),
        }
    }
}

impl<S> Session<S> {
    /// Connection details.
    #[must_use]
    pub const fn attempt(&self) -> &ConnectionAttempt {
        &self.attempt
    }

    /// Current state marker.
    #[must_use]
    pub const fn state(&self) -> &S {
        &self.state
    }
}

/// Session the gate allowed.
#[derive(Debug)]
pub struct AdmittedSession {
    attempt: ConnectionAttempt,
    reason: AllowReason,
}

impl AdmittedSession {
    /// Why the session was allowed.
    #[must_use]
    pub const fn reason(&self) -> AllowReason {
        self.reason
    }

    /// Connection details.
    #[must_use]
    pub const fn attempt(&self) -> &ConnectionAttempt {
        &self.attempt
    }

    /// Run a statement within the admitted session.
    pub fn execute<T>(&self, statement: impl FnOnce(&ConnectionAttempt) -> T) -> T {
        statement(&self.attempt)
    }
}

/// Session the gate rejected. Terminal: it cannot run statements.
#[derive(Debug, Error)]
#[error("session for {} on {} rejected: {reason}", .attempt.role, .attempt.database)]
pub struct RejectedSession {
    attempt: ConnectionAttempt,
    reason: RejectReason,
}

impl RejectedSession {
    /// Why the session was rejected.
    #[must_use]
    pub const fn reason(&self) -> RejectReason {
        self.reason
    }

    /// Connection details.
    #[must_use]
    pub const fn attempt(&self) -> &ConnectionAttempt {
        &self.attempt
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use testresult::TestResult;

    use super::*;
    use crate::{
        config::EngineConfig,
        identity::{Subdomain, TenantId},
        registry::{Tenant, TenantRegistry},
    };

    fn gate(dir: &std::path::Path) -> TestResult<AccessGate> {
        let config = EngineConfig::new(dir.join("hosts"), dir.join("userlist"), "db.example.com");
        let registry = Arc::new(TenantRegistry::from_config(&config));

        registry.put(Tenant::new(TenantId::parse("alpha")?, Subdomain::parse("alpha")?))?;

        Ok(AccessGate::new(registry, &config))
    }

    #[test]
    fn matching_identity_admits_session() -> TestResult {
        let dir = tempfile::tempdir()?;
        let gate = gate(dir.path())?;

        let session = Session::new(RoleName::parse("alpha_owner")?, RoleScope::TenantOwner, "alpha")
            .declare_identity(Some(DeclaredIdentity::tls_server_name(
                "alpha.db.example.com",
            )))
            .authorize(&gate)?;

        assert_eq!(session.reason(), AllowReason::IdentityMatched);
        assert_eq!(session.execute(|attempt| attempt.database.clone()), "alpha");

        Ok(())
    }

    #[test]
    fn root_identity_is_rejected() -> TestResult {
        let dir = tempfile::tempdir()?;
        let gate = gate(dir.path())?;

        let result = Session::new(RoleName::parse("alpha_owner")?, RoleScope::TenantOwner, "alpha")
            .declare_identity(Some(DeclaredIdentity::tls_server_name("db.example.com")))
            .authorize(&gate);

        assert_eq!(
            result.err().map(|rejected| rejected.reason()),
            Some(RejectReason::IdentityMismatch)
        );

        Ok(())
    }
}
