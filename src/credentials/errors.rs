//! Credential synchronizer errors.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::{
    errors::ErrorKind,
    process::{ControllerError, ProcessStatus},
    retry::{RetryError, Transient},
    store::StoreError,
};

/// Credential cache file errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Cache could not be read.
    #[error("failed to read credential cache {path}")]
    Read {
        /// Cache path.
        path: PathBuf,

        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Cache could not be replaced; the previous cache is still live.
    #[error("failed to write credential cache {path}")]
    Write {
        /// Cache path.
        path: PathBuf,

        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Backup or quarantine file could not be written.
    #[error("failed to write sync backup {path}")]
    Backup {
        /// Backup path.
        path: PathBuf,

        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Another writer kept the cache lock for the whole retry budget.
    #[error("credential cache lock {path} is held by another writer")]
    Locked {
        /// Lock file.
        path: PathBuf,
    },
}

impl Transient for CacheError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Write { .. } | Self::Backup { .. })
    }
}

/// Synchronizer errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Login roles could not be read from the primary store.
    #[error("failed to read login roles from the primary store")]
    Store(#[source] RetryError<StoreError>),

    /// Cache file failure.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Cache write did not go through within the retry budget.
    #[error("failed to write the credential cache")]
    Write(#[source] RetryError<CacheError>),

    /// Neither reload nor restart of the pooling layer succeeded.
    #[error("pooling layer did not pick up the new credential cache")]
    Reload(#[source] ControllerError),

    /// Pooling layer is not running after a restart.
    #[error("pooling layer is {0:?} after restart")]
    NotRunning(ProcessStatus),
}

impl SyncError {
    /// Error classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::SyncFailure
    }
}
