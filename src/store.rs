//! Primary store interface
//!
//! The primary store is the authoritative holder of roles, secret hashes and tenant data.
//! The engine only talks to it through [`PrimaryStore`].

use std::{error::Error as StdError, fmt};

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    errors::ErrorKind,
    identity::{RoleName, TenantId},
    registry::RoleScope,
    retry::Transient,
    secrets::{Password, SecretHash},
};

/// Login-capable role with its current secret hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRole {
    /// Role name.
    pub name: RoleName,

    /// Current secret hash.
    pub secret_hash: SecretHash,
}

/// Role to create.
#[derive(Debug, Clone)]
pub struct NewRole {
    /// Role name.
    pub name: RoleName,

    /// Scope, deciding the privileges granted.
    pub scope: RoleScope,

    /// Tenant the role belongs to.
    pub tenant: TenantId,

    /// Initial password.
    pub password: Password,
}

/// Kind of catalog object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectKind {
    /// Database.
    Database,

    /// Schema.
    Schema,

    /// Table.
    Table,

    /// View or materialized view.
    View,

    /// Sequence.
    Sequence,

    /// Function or procedure.
    Function,

    /// Type or domain.
    Type,

    /// Table constraint.
    Constraint,

    /// Row-level security policy.
    Policy,

    /// Default-privilege entry.
    DefaultAcl,

    /// Role.
    Role,
}

impl ObjectKind {
    /// Whether quarantine can rename objects of this kind in place.
    #[must_use]
    pub const fn is_renamable(self) -> bool {
        matches!(
            self,
            Self::Schema | Self::Table | Self::View | Self::Sequence | Self::Function | Self::Type
        )
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Schema => "schema",
            Self::Table => "table",
            Self::View => "view",
            Self::Sequence => "sequence",
            Self::Function => "function",
            Self::Type => "type",
            Self::Constraint => "constraint",
            Self::Policy => "policy",
            Self::DefaultAcl => "default acl",
            Self::Role => "role",
        }
    }
}

/// Reference to a catalog object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObjectRef {
    /// Object kind.
    pub kind: ObjectKind,

    /// Database holding the object.
    pub database: String,

    /// Schema, for schema-qualified objects.
    pub schema: Option<String>,

    /// Object name.
    pub name: String,

    /// Parent object name, e.g. the table of a constraint or policy.
    pub parent: Option<String>,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.kind.as_str())?;

        if let Some(schema) = &self.schema {
            write!(f, "{schema}.")?;
        }

        if let Some(parent) = &self.parent {
            write!(f, "{parent}.")?;
        }

        write!(f, "{} in {}", self.name, self.database)
    }
}

/// How a dependency references the role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyKind {
    /// Role owns the object.
    Owner,

    /// Object ACL names the role.
    AclEntry,

    /// Default-privilege entry for or by the role.
    DefaultPrivilege,

    /// Role membership granted to or by the role.
    Membership,

    /// Foreign key linking the role's objects to others.
    ForeignKey,

    /// Policy naming the role.
    Policy,
}

/// Something in the primary store that still references a role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Dependency {
    /// Referenced role.
    pub role: RoleName,

    /// How it is referenced.
    pub kind: DependencyKind,

    /// Referencing object.
    pub object: ObjectRef,

    /// Objects whose dependencies must be cleared before this one.
    pub requires: Vec<ObjectRef>,
}

/// Primary store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Object does not exist.
    #[error("{0} does not exist")]
    Missing(String),

    /// Objects still depend on the role.
    #[error("objects still depend on role {role}: {detail}")]
    DependentObjects {
        /// Role being removed.
        role: RoleName,

        /// Store-provided detail.
        detail: String,
    },

    /// Dependency cannot be removed by the engine.
    #[error("cannot clear {object}: {detail}")]
    Irrecoverable {
        /// Blocking object.
        object: String,

        /// Store-provided detail.
        detail: String,
    },

    /// Store could not be reached or is temporarily busy.
    #[error("primary store unavailable")]
    Unavailable(#[source] Box<dyn StdError + Send + Sync>),

    /// Store rejected the request.
    #[error("primary store rejected the request: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Error classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyExists(_) => ErrorKind::DuplicateIdentity,
            Self::Missing(_) => ErrorKind::NotFound,
            Self::DependentObjects { .. } | Self::Irrecoverable { .. } => {
                ErrorKind::DependencyUnresolved
            }
            Self::Unavailable(_) | Self::Rejected(_) => ErrorKind::StoreFailure,
        }
    }
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[automock]
#[async_trait]
/// Operations the engine needs from the primary store.
pub trait PrimaryStore: Send + Sync {
    /// Every login-capable role with its current secret hash.
    async fn list_login_roles(&self) -> Result<Vec<LoginRole>, StoreError>;

    /// A single login-capable role; `None` if it does not exist or cannot log in.
    async fn login_role(&self, name: &RoleName) -> Result<Option<LoginRole>, StoreError>;

    /// Whether a role exists, login-capable or not.
    async fn role_exists(&self, name: &RoleName) -> Result<bool, StoreError>;

    /// Whether a database exists.
    async fn database_exists(&self, name: &str) -> Result<bool, StoreError>;

    /// Create a login role.
    async fn create_role(&self, role: &NewRole) -> Result<(), StoreError>;

    /// Create the tenant database owned by `owner`.
    async fn create_database(&self, tenant: &TenantId, owner: &RoleName) -> Result<(), StoreError>;

    /// Grant the privileges of `scope` on the tenant database.
    async fn grant_scope(
        &self,
        tenant: &TenantId,
        role: &RoleName,
        scope: RoleScope,
    ) -> Result<(), StoreError>;

    /// Replace a role's password.
    async fn set_password(&self, role: &RoleName, password: &Password) -> Result<(), StoreError>;

    /// Remove the login capability of a role.
    async fn disable_login(&self, role: &RoleName) -> Result<(), StoreError>;

    /// Drop a role; succeeds if it does not exist.
    async fn drop_role(&self, role: &RoleName) -> Result<(), StoreError>;

    /// Drop a database; succeeds if it does not exist.
    async fn drop_database(&self, name: &str) -> Result<(), StoreError>;

    /// Reassign everything `role` owns in the database to `to`.
    async fn reassign_owned(
        &self,
        database: &str,
        role: &RoleName,
        to: &RoleName,
    ) -> Result<(), StoreError>;

    /// Revoke memberships and grants held by or naming `role`.
    async fn revoke_grants(&self, database: &str, role: &RoleName) -> Result<(), StoreError>;

    /// Cascading drop of everything `role` owns in the database.
    async fn drop_owned_cascade(&self, database: &str, role: &RoleName) -> Result<(), StoreError>;

    /// Objects in the database that still reference `role`.
    async fn dependencies(
        &self,
        database: &str,
        role: &RoleName,
    ) -> Result<Vec<Dependency>, StoreError>;

    /// Drop or alter the specific object behind one dependency.
    async fn clear_dependency(&self, dependency: &Dependency) -> Result<(), StoreError>;

    /// Rename an object in place.
    async fn rename_object(&self, object: &ObjectRef, new_name: &str) -> Result<(), StoreError>;

    /// Rename a database.
    async fn rename_database(&self, from: &str, to: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_display_includes_parent_table() {
        let object = ObjectRef {
            kind: ObjectKind::Constraint,
            database: "alpha".to_string(),
            schema: Some("public".to_string()),
            name: "orders_customer_fk".to_string(),
            parent: Some("orders".to_string()),
        };

        assert_eq!(
            object.to_string(),
            "constraint public.orders.orders_customer_fk in alpha"
        );
        assert!(!object.kind.is_renamable());
    }

    #[test]
    fn only_unavailable_is_transient() {
        assert!(StoreError::Unavailable("connection reset".into()).is_transient());
        assert!(!StoreError::Rejected("permission denied".to_string()).is_transient());
        assert_eq!(
            StoreError::Irrecoverable {
                object: "x".to_string(),
                detail: "pinned".to_string()
            }
            .kind(),
            ErrorKind::DependencyUnresolved
        );
    }
}
