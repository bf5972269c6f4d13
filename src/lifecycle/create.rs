//! Tenant creation.

use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    credentials::SyncAction,
    gate::AccessDecision,
    identity::{Subdomain, TenantId},
    lifecycle::{Compensation, LifecycleError, LifecycleManager},
    registry::{Collision, RegistryError, RoleScope, Tenant},
    secrets::Password,
    store::NewRole,
};

/// Gate decisions observed right after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SelfTest {
    /// Connecting through the tenant's own hostname.
    pub tenant_identity: AccessDecision,

    /// Connecting through the platform's root identity.
    pub root_identity: AccessDecision,
}

impl SelfTest {
    /// Whether the tenant is reachable through its hostname and only through it.
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.tenant_identity.is_allowed() && !self.root_identity.is_allowed()
    }
}

/// A newly created tenant.
#[derive(Debug)]
pub struct CreatedTenant {
    /// Registry record.
    pub tenant: Tenant,

    /// Owner password; shown to the operator once.
    pub owner_password: Password,

    /// Whether the password was generated rather than supplied.
    pub password_generated: bool,

    /// End-to-end gate check.
    pub self_test: SelfTest,
}

impl LifecycleManager {
    /// Create a tenant: database, owner role, registry mapping and credential cache entry.
    ///
    /// The subdomain defaults to the id and a random owner password is generated when none is
    /// supplied. A failure while provisioning undoes the completed steps in reverse order. A
    /// failing self-test is logged and reported but leaves the tenant in place.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::AlreadyExists`] or a `DuplicateIdentity` registry error when
    /// the tenant collides with an existing one, otherwise the error of the failed step.
    pub async fn create_tenant(
        &self,
        id: TenantId,
        subdomain: Option<Subdomain>,
        owner_password: Option<Password>,
    ) -> Result<CreatedTenant, LifecycleError> {
        let subdomain = match subdomain {
            Some(subdomain) => subdomain,
            None => id.default_subdomain()?,
        };

        self.reject_administrative(&id)?;
        self.reject_reserved(&subdomain)?;

        let _guard = self.locks.acquire(&id).await?;

        let snapshot = self
            .registry_call("read registry", || self.registry.snapshot())
            .await?;

        if snapshot.get(&id).is_some() {
            return Err(LifecycleError::AlreadyExists(id));
        }

        let tenant = Tenant::new(id, subdomain);

        if let Some(Collision {
            field,
            value,
            owner,
        }) = snapshot.find_collision(&tenant)
        {
            return Err(RegistryError::DuplicateIdentity {
                field,
                value,
                owner,
            }
            .into());
        }

        self.reject_existing_objects(&tenant).await?;

        let password_generated = owner_password.is_none();
        let owner_password = owner_password.unwrap_or_else(Password::generate);

        let mut compensations = Vec::new();

        if let Err(error) = self
            .provision(&tenant, &owner_password, &mut compensations)
            .await
        {
            warn!(tenant = %tenant.id, %error, "tenant creation failed, rolling back");

            self.compensate(compensations).await;

            return Err(error);
        }

        info!(tenant = %tenant.id, subdomain = %tenant.subdomain, "created tenant");

        let self_test = self.self_test(&tenant);

        Ok(CreatedTenant {
            tenant,
            owner_password,
            password_generated,
            self_test,
        })
    }

    async fn reject_existing_objects(&self, tenant: &Tenant) -> Result<(), LifecycleError> {
        let role_exists = self
            .store_call("look up owner role", || {
                self.store.role_exists(&tenant.owner_role)
            })
            .await?;
        let database_exists = self
            .store_call("look up database", || {
                self.store.database_exists(tenant.id.as_str())
            })
            .await?;

        if role_exists || database_exists {
            return Err(LifecycleError::AlreadyExists(tenant.id.clone()));
        }

        Ok(())
    }

    async fn provision(
        &self,
        tenant: &Tenant,
        password: &Password,
        compensations: &mut Vec<Compensation>,
    ) -> Result<(), LifecycleError> {
        let owner = NewRole {
            name: tenant.owner_role.clone(),
            scope: RoleScope::TenantOwner,
            tenant: tenant.id.clone(),
            password: password.clone(),
        };

        self.store_call("create owner role", || self.store.create_role(&owner))
            .await?;
        compensations.push(Compensation::DropRole(owner.name.clone()));

        self.store_call("create database", || {
            self.store.create_database(&tenant.id, &owner.name)
        })
        .await?;
        compensations.push(Compensation::DropDatabase(tenant.id.to_string()));

        self.store_call("grant owner privileges", || {
            self.store
                .grant_scope(&tenant.id, &owner.name, RoleScope::TenantOwner)
        })
        .await?;

        self.registry_call("register tenant", || {
            self.registry.insert(tenant.clone())
        })
        .await?;
        compensations.push(Compensation::DeleteRecord(tenant.id.clone()));

        compensations.push(Compensation::RemoveCacheEntry(owner.name.clone()));
        self.sync_role(&owner.name, SyncAction::Add).await
    }

    fn self_test(&self, tenant: &Tenant) -> SelfTest {
        let hostname = tenant.subdomain.hostname(&self.root_identity);

        let self_test = SelfTest {
            tenant_identity: self.gate.validate_access(&tenant.id, &hostname),
            root_identity: self.gate.validate_access(&tenant.id, &self.root_identity),
        };

        if self_test.passed() {
            info!(
                tenant = %tenant.id,
                %hostname,
                root_identity = %self.root_identity,
                "self-test passed: tenant hostname allowed, root identity rejected"
            );
        } else {
            error!(
                tenant = %tenant.id,
                %hostname,
                tenant_identity = ?self_test.tenant_identity,
                root_identity = ?self_test.root_identity,
                "self-test failed: access gate is misconfigured for this tenant"
            );
        }

        self_test
    }
}
