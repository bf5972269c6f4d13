//! Member roles, password rotation and subdomain remapping on live tenants.

use tracing::info;

use crate::{
    credentials::SyncAction,
    identity::{RoleName, Subdomain, TenantId},
    lifecycle::{Compensation, LifecycleError, LifecycleManager},
    registry::{MemberAccess, MemberRole, Tenant},
    secrets::Password,
    store::NewRole,
};

/// Credentials issued for a role.
#[derive(Debug)]
pub struct MemberCredentials {
    /// Tenant the role belongs to.
    pub tenant: TenantId,

    /// Role name.
    pub role: RoleName,

    /// New password; shown to the operator once.
    pub password: Password,

    /// Whether the password was generated rather than supplied.
    pub password_generated: bool,
}

impl LifecycleManager {
    /// Add a restricted member role to a live tenant.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::RoleExists`] when the role already exists anywhere, or the
    /// error of the failed step after undoing the completed ones.
    pub async fn add_member(
        &self,
        id: &TenantId,
        role: RoleName,
        access: MemberAccess,
        password: Option<Password>,
    ) -> Result<MemberCredentials, LifecycleError> {
        let _guard = self.locks.acquire(id).await?;

        let tenant = self.live_tenant(id).await?;

        if tenant.scope_of(&role).is_some()
            || self
                .store_call("look up role", || self.store.role_exists(&role))
                .await?
        {
            return Err(LifecycleError::RoleExists(role));
        }

        let password_generated = password.is_none();
        let password = password.unwrap_or_else(Password::generate);

        let mut updated = tenant.clone();
        updated.member_roles.push(MemberRole {
            name: role.clone(),
            access,
        });

        let new_role = NewRole {
            name: role.clone(),
            scope: access.scope(),
            tenant: id.clone(),
            password: password.clone(),
        };

        let mut compensations = Vec::new();

        let result = async {
            self.store_call("create member role", || self.store.create_role(&new_role))
                .await?;
            compensations.push(Compensation::DropRole(role.clone()));

            self.store_call("grant member privileges", || {
                self.store.grant_scope(id, &role, access.scope())
            })
            .await?;

            self.registry_call("add member", || self.registry.put(updated.clone()))
                .await?;
            compensations.push(Compensation::RestoreRecord(Box::new(tenant.clone())));

            compensations.push(Compensation::RemoveCacheEntry(role.clone()));
            self.sync_role(&role, SyncAction::Add).await
        }
        .await;

        if let Err(error) = result {
            self.compensate(compensations).await;

            return Err(error);
        }

        info!(tenant = %id, %role, access = access.as_str(), "added member role");

        Ok(MemberCredentials {
            tenant: id.clone(),
            role,
            password,
            password_generated,
        })
    }

    /// Remove a member role, handing whatever it owns to the tenant owner.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::UnknownRole`] when the role is not a member of the tenant.
    pub async fn remove_member(
        &self,
        id: &TenantId,
        role: &RoleName,
    ) -> Result<Tenant, LifecycleError> {
        let _guard = self.locks.acquire(id).await?;

        let mut tenant = self.live_tenant(id).await?;

        if tenant.member(role).is_none() {
            return Err(LifecycleError::UnknownRole {
                tenant: id.clone(),
                role: role.clone(),
            });
        }

        let database = id.as_str();

        self.store_call("reassign member objects", || {
            self.store
                .reassign_owned(database, role, &tenant.owner_role)
        })
        .await?;
        self.store_call("revoke member grants", || {
            self.store.revoke_grants(database, role)
        })
        .await?;
        self.store_call("drop member objects", || {
            self.store.drop_owned_cascade(database, role)
        })
        .await?;
        self.store_call("drop member role", || self.store.drop_role(role))
            .await?;

        self.sync_role(role, SyncAction::Delete).await?;

        tenant.member_roles.retain(|member| member.name != *role);

        self.registry_call("remove member", || self.registry.put(tenant.clone()))
            .await?;

        info!(tenant = %id, %role, "removed member role");

        Ok(tenant)
    }

    /// Replace the password of the tenant's owner or one of its members.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::UnknownRole`] when the role does not belong to the tenant.
    pub async fn rotate_password(
        &self,
        id: &TenantId,
        role: &RoleName,
        password: Option<Password>,
    ) -> Result<MemberCredentials, LifecycleError> {
        let _guard = self.locks.acquire(id).await?;

        let tenant = self.live_tenant(id).await?;

        if tenant.scope_of(role).is_none() {
            return Err(LifecycleError::UnknownRole {
                tenant: id.clone(),
                role: role.clone(),
            });
        }

        let password_generated = password.is_none();
        let password = password.unwrap_or_else(Password::generate);

        self.store_call("set password", || self.store.set_password(role, &password))
            .await?;

        self.sync_role(role, SyncAction::Update).await?;

        info!(tenant = %id, %role, "rotated password");

        Ok(MemberCredentials {
            tenant: id.clone(),
            role: role.clone(),
            password,
            password_generated,
        })
    }

    /// Point a live tenant at a different subdomain.
    ///
    /// # Errors
    ///
    /// Returns a `DuplicateIdentity` registry error when another tenant holds the subdomain.
    pub async fn remap_subdomain(
        &self,
        id: &TenantId,
        subdomain: Subdomain,
    ) -> Result<Tenant, LifecycleError> {
        self.reject_reserved(&subdomain)?;

        let _guard = self.locks.acquire(id).await?;

        let mut tenant = self.live_tenant(id).await?;

        if tenant.subdomain == subdomain {
            return Ok(tenant);
        }

        let previous = std::mem::replace(&mut tenant.subdomain, subdomain);

        self.registry_call("remap subdomain", || self.registry.put(tenant.clone()))
            .await?;

        info!(tenant = %id, from = %previous, to = %tenant.subdomain, "remapped subdomain");

        Ok(tenant)
    }
}
