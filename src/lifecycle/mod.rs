//! Tenant Lifecycle Manager
//!
//! The only writer of the registry. Every operation runs under the tenant's lock; operations on
//! different tenants run in parallel. Creation compensates partial work in reverse order and
//! teardown escalates through the tiers in [`tiers`], recording its stage in the registry so a
//! retry resumes where the previous attempt stopped.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{debug, warn};

use crate::{
    config::{ConfigError, EngineConfig},
    credentials::{CredentialSynchronizer, SyncAction},
    gate::AccessGate,
    identity::{RoleName, Subdomain, TenantId},
    registry::{RegistryError, Tenant, TenantRegistry},
    retry::RetryPolicy,
    store::{PrimaryStore, StoreError},
};

pub mod create;
pub mod destroy;
pub mod errors;
pub mod locks;
pub mod members;
pub mod tiers;

pub use create::{CreatedTenant, SelfTest};
pub use destroy::{DestroyOutcome, DestroyReport};
pub use errors::LifecycleError;
pub use locks::{TenantGuard, TenantLocks};
pub use members::MemberCredentials;
pub use tiers::{TierOutcome, next_stage};

/// Cooperative cancellation for long-running teardowns.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Handle that has not been triggered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the operation to stop at the next safe point.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether an abort was requested.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Creates, changes and destroys tenants.
pub struct LifecycleManager {
    registry: Arc<TenantRegistry>,
    store: Arc<dyn PrimaryStore>,
    sync: Arc<CredentialSynchronizer>,
    gate: AccessGate,
    locks: TenantLocks,
    retry: RetryPolicy,
    admin_role: RoleName,
    root_identity: String,
    administrative_databases: Vec<String>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("registry", &self.registry)
            .field("locks", &self.locks)
            .field("admin_role", &self.admin_role)
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    /// Manager writing `registry` and keeping `sync`'s cache current.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the configured admin role is not a valid role name.
    pub fn new(
        config: &EngineConfig,
        registry: Arc<TenantRegistry>,
        store: Arc<dyn PrimaryStore>,
        sync: Arc<CredentialSynchronizer>,
    ) -> Result<Self, ConfigError> {
        let retry = config.retry_policy();

        Ok(Self {
            gate: AccessGate::new(Arc::clone(&registry), config),
            registry,
            store,
            sync,
            locks: TenantLocks::new(config.lock_dir(), config.tenant_lock_timeout()),
            retry,
            admin_role: config.admin_role()?,
            root_identity: config.root_identity.clone(),
            administrative_databases: config.administrative_databases.clone(),
        })
    }

    /// Every tenant record, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Registry`] when the registry cannot be read.
    pub async fn list_tenants(&self) -> Result<Vec<Tenant>, LifecycleError> {
        self.registry_call("list tenants", || self.registry.list())
            .await
    }

    /// Live tenant record.
    async fn live_tenant(&self, id: &TenantId) -> Result<Tenant, LifecycleError> {
        let tenant = self
            .registry_call("read tenant", || self.registry.get(id))
            .await?;

        if !tenant.is_live() {
            return Err(LifecycleError::NotLive {
                tenant: tenant.id,
                status: tenant.status.as_str(),
            });
        }

        Ok(tenant)
    }

    fn reject_reserved(&self, subdomain: &Subdomain) -> Result<(), LifecycleError> {
        let root = self.root_identity.as_str();
        let first_label = root.split('.').next().unwrap_or(root);

        if subdomain.as_str().eq_ignore_ascii_case(root)
            || subdomain.as_str().eq_ignore_ascii_case(first_label)
        {
            return Err(LifecycleError::ReservedSubdomain(subdomain.to_string()));
        }

        Ok(())
    }

    fn reject_administrative(&self, id: &TenantId) -> Result<(), LifecycleError> {
        if self
            .administrative_databases
            .iter()
            .any(|database| database == id.as_str())
        {
            return Err(LifecycleError::AdministrativeDatabase(id.clone()));
        }

        Ok(())
    }

    async fn registry_call<T>(
        &self,
        operation: &'static str,
        call: impl Fn() -> Result<T, RegistryError>,
    ) -> Result<T, LifecycleError> {
        self.retry
            .run(operation, || async { call() })
            .await
            .map_err(|error| LifecycleError::Registry(error.into_inner()))
    }

    async fn store_call<T, F, Fut>(
        &self,
        operation: &'static str,
        call: F,
    ) -> Result<T, LifecycleError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.retry
            .run(operation, call)
            .await
            .map_err(|error| LifecycleError::store(operation)(error.into_inner()))
    }

    async fn sync_role(&self, role: &RoleName, action: SyncAction) -> Result<(), LifecycleError> {
        self.sync.sync_one(role, action).await?;

        Ok(())
    }

    /// Undo partial work in reverse order, logging failures and carrying on.
    async fn compensate(&self, compensations: Vec<Compensation>) {
        for compensation in compensations.into_iter().rev() {
            debug!(?compensation, "compensating");

            let result = match &compensation {
                Compensation::RemoveCacheEntry(role) => {
                    self.sync_role(role, SyncAction::Delete).await
                }
                Compensation::DeleteRecord(id) => self
                    .registry_call("delete tenant record", || self.registry.delete(id))
                    .await
                    .map(drop),
                Compensation::RestoreRecord(tenant) => {
                    self.registry_call("restore tenant record", || {
                        self.registry.put(Tenant::clone(tenant))
                    })
                    .await
                }
                Compensation::DropDatabase(name) => {
                    self.store_call("drop database", || self.store.drop_database(name))
                        .await
                }
                Compensation::DropRole(role) => {
                    self.store_call("drop role", || self.store.drop_role(role))
                        .await
                }
            };

            if let Err(error) = result {
                warn!(?compensation, %error, "compensation failed");
            }
        }
    }
}

/// Step that undoes partially completed work.
#[derive(Debug)]
enum Compensation {
    RemoveCacheEntry(RoleName),
    DeleteRecord(TenantId),
    RestoreRecord(Box<Tenant>),
    DropDatabase(String),
    DropRole(RoleName),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_is_shared_between_clones() {
        let handle = AbortHandle::new();
        let clone = handle.clone();

        clone.abort();

        assert!(handle.is_aborted());
    }
}
