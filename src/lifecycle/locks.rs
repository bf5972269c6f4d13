//! Per-tenant mutual exclusion.
//!
//! Tasks in one process queue on an in-memory mutex per tenant id; other processes are kept out
//! by a lock file per tenant. Operations on different tenants never share a lock. A waiter
//! gives up after the configured timeout, which must outlast a whole lifecycle operation.

use std::{
    fs, io,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use rustc_hash::FxHashMap;
use tokio::{
    sync::{Mutex as AsyncMutex, OwnedMutexGuard},
    time::{self, Instant},
};
use tracing::{debug, warn};

use crate::{
    files::{self, FileLock, LockError},
    identity::TenantId,
    lifecycle::errors::LifecycleError,
    registry::RegistryError,
};

/// Held for the duration of one lifecycle operation.
#[derive(Debug)]
pub struct TenantGuard {
    _file: FileLock,
    _local: OwnedMutexGuard<()>,
}

/// Lock table keyed by tenant id.
#[derive(Debug)]
pub struct TenantLocks {
    dir: PathBuf,
    timeout: Duration,
    local: Mutex<FxHashMap<TenantId, Arc<AsyncMutex<()>>>>,
}

impl TenantLocks {
    /// Lock table keeping its lock files in `dir`, waiting at most `timeout` per acquisition.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
            local: Mutex::default(),
        }
    }

    /// Wait for exclusive access to `id`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Locked`] when another task or process keeps the tenant for
    /// longer than the timeout.
    pub async fn acquire(&self, id: &TenantId) -> Result<TenantGuard, LifecycleError> {
        let deadline = Instant::now() + self.timeout;

        let local = time::timeout_at(deadline, self.local_mutex(id).lock_owned())
            .await
            .map_err(|_elapsed| LifecycleError::Locked(id.clone()))?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let file = files::wait_for_lock(&self.path(id), remaining)
            .await
            .map_err(|error| match error {
                LockError::Contended { .. } => LifecycleError::Locked(id.clone()),
                LockError::Io { path, source } => {
                    LifecycleError::Registry(RegistryError::Write { path, source })
                }
            })?;

        debug!(tenant = %id, "acquired tenant lock");

        Ok(TenantGuard {
            _file: file,
            _local: local,
        })
    }

    /// Delete the lock file of a tenant that no longer exists.
    ///
    /// Called while `_guard` is held, so no other operation can be waiting on the same file
    /// inside this process.
    pub fn release_file(&self, id: &TenantId, _guard: &TenantGuard) {
        match fs::remove_file(self.path(id)) {
            Ok(()) => debug!(tenant = %id, "removed tenant lock file"),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => warn!(tenant = %id, %error, "failed to remove tenant lock file"),
        }
    }

    fn path(&self, id: &TenantId) -> PathBuf {
        self.dir.join(format!("tenant-{id}.lock"))
    }

    fn local_mutex(&self, id: &TenantId) -> Arc<AsyncMutex<()>> {
        let mut table = self.local.lock().unwrap_or_else(PoisonError::into_inner);

        // Only the table holds unused entries.
        table.retain(|_, mutex| Arc::strong_count(mutex) > 1);

        Arc::clone(table.entry(id.clone()).or_default())
    }
}
