//! Tenant Registry
//!
//! The registry is a single text file replaced atomically on every write. Readers never lock:
//! each read parses whatever complete file is currently in place. Writers are serialized by an
//! in-process mutex plus an advisory lock file, so writers in other processes queue as well.

use std::{
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use tracing::{debug, info};

use crate::{
    config::EngineConfig,
    files::{self, FileLock, LockError},
    identity::{Subdomain, TenantId},
};

pub mod document;
pub mod errors;
pub mod models;

pub use document::{Collision, RegistrySnapshot};
pub use errors::RegistryError;
pub use models::{
    HostnameMapping, MemberAccess, MemberRole, Privilege, RoleScope, TeardownMode, TeardownStage,
    Tenant, TenantStatus, UnknownVariant,
};

/// Permission bits of the registry file; the reverse proxy reads it.
pub const REGISTRY_FILE_MODE: u32 = 0o644;

const LOCK_FILE_NAME: &str = "registry.lock";

/// Durable tenant registry.
#[derive(Debug)]
pub struct TenantRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    writer: Mutex<()>,
}

impl TenantRegistry {
    /// Registry backed by `path`, locking through `lock_path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_path: lock_path.into(),
            writer: Mutex::new(()),
        }
    }

    /// Registry at the configured location.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.registry_path.clone(),
            config.lock_dir().join(LOCK_FILE_NAME),
        )
    }

    /// Registry file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consistent point-in-time view. A missing file is an empty registry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Read`] or [`RegistryError::Malformed`].
    pub fn snapshot(&self) -> Result<RegistrySnapshot, RegistryError> {
        let contents = files::read_optional(&self.path).map_err(|source| RegistryError::Read {
            path: self.path.clone(),
            source,
        })?;

        match contents {
            Some(contents) => RegistrySnapshot::parse(&contents).map_err(|error| {
                RegistryError::Malformed {
                    line: error.line,
                    reason: error.reason,
                }
            }),
            None => Ok(RegistrySnapshot::default()),
        }
    }

    /// Tenant record by id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] or a read failure.
    pub fn get(&self, id: &TenantId) -> Result<Tenant, RegistryError> {
        self.snapshot()?
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    /// Live tenant reachable through `subdomain`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownSubdomain`] or a read failure.
    pub fn resolve_by_subdomain(&self, subdomain: &Subdomain) -> Result<TenantId, RegistryError> {
        self.snapshot()?
            .resolve_by_subdomain(subdomain)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownSubdomain(subdomain.clone()))
    }

    /// Every tenant record, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns a read failure.
    pub fn list(&self) -> Result<Vec<Tenant>, RegistryError> {
        Ok(self.snapshot()?.tenants().cloned().collect())
    }

    /// Insert or update a tenant record.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateIdentity`] when the subdomain or a role name is held
    /// by a different tenant, [`RegistryError::Locked`] while another process writes, or an
    /// IO failure.
    pub fn put(&self, tenant: Tenant) -> Result<(), RegistryError> {
        self.write(|snapshot| {
            reject_collision(snapshot, &tenant)?;

            debug!(tenant = %tenant.id, status = %tenant.status, "registry put");

            snapshot.upsert(tenant);

            Ok(())
        })
    }

    /// Insert a record for a tenant id that is not yet registered.
    ///
    /// # Errors
    ///
    /// As [`Self::put`], plus [`RegistryError::DuplicateIdentity`] for an existing id.
    pub fn insert(&self, tenant: Tenant) -> Result<(), RegistryError> {
        self.write(|snapshot| {
            if snapshot.get(&tenant.id).is_some() {
                return Err(RegistryError::DuplicateIdentity {
                    field: "id",
                    value: tenant.id.to_string(),
                    owner: tenant.id.clone(),
                });
            }

            reject_collision(snapshot, &tenant)?;

            info!(tenant = %tenant.id, subdomain = %tenant.subdomain, "registered tenant");

            snapshot.upsert(tenant);

            Ok(())
        })
    }

    /// Remove a record.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`], [`RegistryError::Locked`] or an IO failure.
    pub fn delete(&self, id: &TenantId) -> Result<Tenant, RegistryError> {
        self.write(|snapshot| {
            let removed = snapshot
                .remove(id)
                .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

            info!(tenant = %id, "removed tenant from registry");

            Ok(removed)
        })
    }

    fn write<T>(
        &self,
        mutate: impl FnOnce(&mut RegistrySnapshot) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let _lock = FileLock::try_acquire(&self.lock_path).map_err(|error| match error {
            LockError::Contended { .. } => RegistryError::Locked,
            LockError::Io { path, source } => RegistryError::Write { path, source },
        })?;

        let mut snapshot = self.snapshot()?;
        let value = mutate(&mut snapshot)?;

        files::write_atomic(&self.path, snapshot.render().as_bytes(), REGISTRY_FILE_MODE).map_err(
            |source| RegistryError::Write {
                path: self.path.clone(),
                source,
            },
        )?;

        Ok(value)
    }
}

fn reject_collision(snapshot: &RegistrySnapshot, tenant: &Tenant) -> Result<(), RegistryError> {
    match snapshot.find_collision(tenant) {
        Some(Collision {
            field,
            value,
            owner,
        }) => Err(RegistryError::DuplicateIdentity {
            field,
            value,
            owner,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    fn registry(dir: &Path) -> TenantRegistry {
        TenantRegistry::new(dir.join("hosts"), dir.join("registry.lock"))
    }

    fn tenant(id: &str, subdomain: &str) -> Result<Tenant, crate::identity::NameError> {
        Ok(Tenant::new(TenantId::parse(id)?, Subdomain::parse(subdomain)?))
    }

    #[test]
    fn missing_file_is_an_empty_registry() -> TestResult {
        let dir = tempfile::tempdir()?;

        assert!(registry(dir.path()).list()?.is_empty());

        Ok(())
    }

    #[test]
    fn put_get_resolve_delete() -> TestResult {
        let dir = tempfile::tempdir()?;
        let registry = registry(dir.path());

        registry.put(tenant("alpha", "alpha")?)?;

        let id = TenantId::parse("alpha")?;

        assert_eq!(registry.get(&id)?.subdomain.as_str(), "alpha");
        assert_eq!(registry.resolve_by_subdomain(&Subdomain::parse("alpha")?)?, id);

        registry.delete(&id)?;

        assert!(matches!(registry.get(&id), Err(RegistryError::NotFound(_))));
        assert!(matches!(
            registry.resolve_by_subdomain(&Subdomain::parse("alpha")?),
            Err(RegistryError::UnknownSubdomain(_))
        ));

        Ok(())
    }

    #[test]
    fn put_rejects_subdomain_held_by_another_tenant() -> TestResult {
        let dir = tempfile::tempdir()?;
        let registry = registry(dir.path());

        registry.put(tenant("alpha", "shop")?)?;

        let result = registry.put(tenant("beta", "shop")?);

        assert!(matches!(
            result,
            Err(RegistryError::DuplicateIdentity {
                field: "subdomain",
                ..
            })
        ));

        Ok(())
    }

    #[test]
    fn put_updates_existing_record() -> TestResult {
        let dir = tempfile::tempdir()?;
        let registry = registry(dir.path());

        registry.put(tenant("alpha", "alpha")?)?;
        registry.put(tenant("alpha", "alpha-shop")?)?;

        assert_eq!(
            registry.get(&TenantId::parse("alpha")?)?.subdomain.as_str(),
            "alpha-shop"
        );

        Ok(())
    }

    #[test]
    fn insert_rejects_existing_id() -> TestResult {
        let dir = tempfile::tempdir()?;
        let registry = registry(dir.path());

        registry.insert(tenant("alpha", "alpha")?)?;

        let result = registry.insert(tenant("alpha", "other")?);

        assert!(matches!(
            result,
            Err(RegistryError::DuplicateIdentity { field: "id", .. })
        ));

        Ok(())
    }

    #[test]
    fn malformed_file_is_registry_unavailable() -> TestResult {
        let dir = tempfile::tempdir()?;
        let registry = registry(dir.path());

        std::fs::write(registry.path(), "alpha\n")?;

        let error = registry.snapshot().err();

        assert_eq!(
            error.map(|error| error.kind()),
            Some(crate::errors::ErrorKind::RegistryUnavailable)
        );

        Ok(())
    }

    #[test]
    fn writes_fail_while_another_process_holds_the_lock() -> TestResult {
        let dir = tempfile::tempdir()?;
        let registry = registry(dir.path());

        let _held = FileLock::try_acquire(&dir.path().join("registry.lock"))?;

        assert!(matches!(
            registry.put(tenant("alpha", "alpha")?),
            Err(RegistryError::Locked)
        ));

        Ok(())
    }
}
