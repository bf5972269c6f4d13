//! Registry Models

use std::{fmt, str::FromStr};

use serde::Serialize;
use smallvec::SmallVec;
use thiserror::Error;

use crate::identity::{RoleName, Subdomain, TenantId};

/// Closed set of role scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoleScope {
    /// Platform administrator; bypasses the access gate.
    Superuser,

    /// Owns the tenant database.
    TenantOwner,

    /// Tenant member with read/write access to the tenant's data.
    TenantMemberFull,

    /// Tenant member with read access only.
    TenantMemberReadonly,
}

/// Privileges a scope grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Privilege {
    /// Bypass the access gate and every per-object check.
    BypassIsolation,

    /// Own the tenant database.
    OwnDatabase,

    /// `CONNECT` on the tenant database.
    Connect,

    /// `TEMPORARY` on the tenant database.
    Temporary,

    /// `CREATE` schemas in the tenant database.
    CreateSchema,

    /// `USAGE` on schemas.
    UseSchema,

    /// `SELECT` on tables and sequences.
    Read,

    /// `INSERT`, `UPDATE`, `DELETE` and `TRUNCATE` on tables.
    Write,

    /// `EXECUTE` on functions.
    Execute,
}

const SUPERUSER: &[Privilege] = &[
    Privilege::BypassIsolation,
    Privilege::OwnDatabase,
    Privilege::Connect,
    Privilege::Temporary,
    Privilege::CreateSchema,
    Privilege::UseSchema,
    Privilege::Read,
    Privilege::Write,
    Privilege::Execute,
];

const TENANT_OWNER: &[Privilege] = &[
    Privilege::OwnDatabase,
    Privilege::Connect,
    Privilege::Temporary,
    Privilege::CreateSchema,
    Privilege::UseSchema,
    Privilege::Read,
    Privilege::Write,
    Privilege::Execute,
];

const TENANT_MEMBER_FULL: &[Privilege] = &[
    Privilege::Connect,
    Privilege::Temporary,
    Privilege::UseSchema,
    Privilege::Read,
    Privilege::Write,
    Privilege::Execute,
];

const TENANT_MEMBER_READONLY: &[Privilege] =
    &[Privilege::Connect, Privilege::UseSchema, Privilege::Read];

impl RoleScope {
    /// Exact privilege set of the scope.
    #[must_use]
    pub const fn privileges(self) -> &'static [Privilege] {
        match self {
            Self::Superuser => SUPERUSER,
            Self::TenantOwner => TENANT_OWNER,
            Self::TenantMemberFull => TENANT_MEMBER_FULL,
            Self::TenantMemberReadonly => TENANT_MEMBER_READONLY,
        }
    }

    /// Whether the scope includes `privilege`.
    #[must_use]
    pub fn grants(self, privilege: Privilege) -> bool {
        self.privileges().contains(&privilege)
    }

    /// Whether sessions in this scope skip the access gate.
    #[must_use]
    pub fn bypasses_isolation(self) -> bool {
        self.grants(Privilege::BypassIsolation)
    }

    /// Stable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Superuser => "superuser",
            Self::TenantOwner => "tenant-owner",
            Self::TenantMemberFull => "tenant-member-full",
            Self::TenantMemberReadonly => "tenant-member-readonly",
        }
    }
}

impl fmt::Display for RoleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown enumeration value in registry or CLI input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} {value:?}")]
pub struct UnknownVariant {
    /// Enumeration being parsed.
    pub kind: &'static str,

    /// Rejected value.
    pub value: String,
}

impl UnknownVariant {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Access level of a member role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemberAccess {
    /// Read/write.
    Full,

    /// Read only.
    Readonly,
}

impl MemberAccess {
    /// Scope of a member with this access.
    #[must_use]
    pub const fn scope(self) -> RoleScope {
        match self {
            Self::Full => RoleScope::TenantMemberFull,
            Self::Readonly => RoleScope::TenantMemberReadonly,
        }
    }

    /// Stable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Readonly => "readonly",
        }
    }
}

impl FromStr for MemberAccess {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "full" => Ok(Self::Full),
            "readonly" => Ok(Self::Readonly),
            other => Err(UnknownVariant::new("member access", other)),
        }
    }
}

/// Restricted role scoped to one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MemberRole {
    /// Role name.
    pub name: RoleName,

    /// Access level.
    pub access: MemberAccess,
}

/// How teardown treats the tenant's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TeardownMode {
    /// Hand the data to the platform administrator and keep it.
    ReassignOwnership,

    /// Drop the tenant database.
    DropData,
}

impl TeardownMode {
    /// Stable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReassignOwnership => "reassign",
            Self::DropData => "drop",
        }
    }
}

impl FromStr for TeardownMode {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "reassign" => Ok(Self::ReassignOwnership),
            "drop" => Ok(Self::DropData),
            other => Err(UnknownVariant::new("teardown mode", other)),
        }
    }
}

impl fmt::Display for TeardownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First unresolved step of a teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TeardownStage {
    /// Tier 1: reassign owned objects and revoke grants.
    OwnershipTransfer,

    /// Tier 2: cascading drop of everything still owned.
    CascadingDropOwned,

    /// Tier 3: explicit dependency walk, then tier 2 again.
    DependencyWalk,

    /// Tier 4: rename instead of delete.
    Quarantine,

    /// Dependencies resolved; remove cache entries, roles and the registry record.
    Finalize,
}

impl TeardownStage {
    /// Stable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OwnershipTransfer => "ownership-transfer",
            Self::CascadingDropOwned => "cascading-drop-owned",
            Self::DependencyWalk => "dependency-walk",
            Self::Quarantine => "quarantine",
            Self::Finalize => "finalize",
        }
    }
}

impl FromStr for TeardownStage {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ownership-transfer" => Ok(Self::OwnershipTransfer),
            "cascading-drop-owned" => Ok(Self::CascadingDropOwned),
            "dependency-walk" => Ok(Self::DependencyWalk),
            "quarantine" => Ok(Self::Quarantine),
            "finalize" => Ok(Self::Finalize),
            other => Err(UnknownVariant::new("teardown stage", other)),
        }
    }
}

impl fmt::Display for TeardownStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destruction status of a tenant.
///
/// `Destroyed-Clean` has no variant: a cleanly destroyed tenant has no record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum TenantStatus {
    /// Reachable through its subdomain.
    Live,

    /// Teardown started and has not finished.
    TearingDown {
        /// Requested teardown mode.
        mode: TeardownMode,

        /// First unresolved step.
        stage: TeardownStage,
    },

    /// Teardown fell back to renaming data that could not be removed safely.
    DestroyedQuarantined {
        /// Names the conflicting objects or database were renamed to.
        quarantined: Vec<String>,
    },
}

impl TenantStatus {
    /// Stable name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::TearingDown { .. } => "tearing-down",
            Self::DestroyedQuarantined { .. } => "destroyed-quarantined",
        }
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tenant record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tenant {
    /// Tenant id; also the database name.
    pub id: TenantId,

    /// Subdomain the tenant is reachable through while live.
    pub subdomain: Subdomain,

    /// Owner role.
    pub owner_role: RoleName,

    /// Restricted member roles.
    pub member_roles: Vec<MemberRole>,

    /// Destruction status.
    pub status: TenantStatus,
}

impl Tenant {
    /// New live tenant with the conventional owner role and no members.
    #[must_use]
    pub fn new(id: TenantId, subdomain: Subdomain) -> Self {
        let owner_role = id.owner_role();

        Self {
            id,
            subdomain,
            owner_role,
            member_roles: Vec::new(),
            status: TenantStatus::Live,
        }
    }

    /// Whether the tenant is live.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self.status, TenantStatus::Live)
    }

    /// Whether the tenant still claims its id, subdomain and role names.
    #[must_use]
    pub const fn holds_identity(&self) -> bool {
        matches!(
            self.status,
            TenantStatus::Live | TenantStatus::TearingDown { .. }
        )
    }

    /// Hostname mapping consulted by the access gate; only live tenants have one.
    #[must_use]
    pub fn mapping(&self) -> Option<HostnameMapping> {
        self.is_live().then(|| HostnameMapping {
            tenant_id: self.id.clone(),
            subdomain: self.subdomain.clone(),
        })
    }

    /// All roles of the tenant: members first, owner last.
    #[must_use]
    pub fn roles(&self) -> SmallVec<[RoleName; 4]> {
        self.member_roles
            .iter()
            .map(|member| member.name.clone())
            .chain(std::iter::once(self.owner_role.clone()))
            .collect()
    }

    /// Scope of `role` within this tenant.
    #[must_use]
    pub fn scope_of(&self, role: &RoleName) -> Option<RoleScope> {
        if *role == self.owner_role {
            return Some(RoleScope::TenantOwner);
        }

        self.member(role).map(|member| member.access.scope())
    }

    /// Member record for `role`.
    #[must_use]
    pub fn member(&self, role: &RoleName) -> Option<&MemberRole> {
        self.member_roles.iter().find(|member| member.name == *role)
    }
}

/// `(tenant, subdomain)` pair the access gate resolves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct HostnameMapping {
    /// Tenant id.
    pub tenant_id: TenantId,

    /// Subdomain.
    pub subdomain: Subdomain,
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    #[test]
    fn readonly_members_cannot_write() {
        assert!(RoleScope::TenantMemberFull.grants(Privilege::Write));
        assert!(!RoleScope::TenantMemberReadonly.grants(Privilege::Write));
        assert!(RoleScope::TenantMemberReadonly.grants(Privilege::Read));
    }

    #[test]
    fn only_superusers_bypass_isolation() {
        assert!(RoleScope::Superuser.bypasses_isolation());
        assert!(!RoleScope::TenantOwner.bypasses_isolation());
        assert!(!RoleScope::TenantMemberFull.bypasses_isolation());
    }

    #[test]
    fn roles_list_members_before_owner() -> TestResult {
        let mut tenant = Tenant::new(TenantId::parse("alpha")?, Subdomain::parse("alpha")?);

        tenant.member_roles.push(MemberRole {
            name: RoleName::parse("alpha_reader")?,
            access: MemberAccess::Readonly,
        });

        let roles: Vec<_> = tenant.roles().iter().map(ToString::to_string).collect();

        assert_eq!(roles, ["alpha_reader", "alpha_owner"]);
        assert_eq!(
            tenant.scope_of(&RoleName::parse("alpha_reader")?),
            Some(RoleScope::TenantMemberReadonly)
        );

        Ok(())
    }

    #[test]
    fn only_live_tenants_have_a_mapping() -> TestResult {
        let mut tenant = Tenant::new(TenantId::parse("alpha")?, Subdomain::parse("alpha")?);

        assert!(tenant.mapping().is_some());

        tenant.status = TenantStatus::TearingDown {
            mode: TeardownMode::DropData,
            stage: TeardownStage::OwnershipTransfer,
        };

        assert!(tenant.mapping().is_none());
        assert!(tenant.holds_identity());

        Ok(())
    }
}
