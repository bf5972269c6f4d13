//! CLI errors and exit codes

use std::error::Error as StdError;

use tenantgate::{
    config::ConfigError,
    credentials::SyncError,
    errors::ErrorKind,
    identity::NameError,
    lifecycle::LifecycleError,
    registry::RegistryError,
    secrets::PasswordError,
};
use thiserror::Error;

/// Exit code for a successful command.
pub const EXIT_SUCCESS: u8 = 0;

/// Exit code for command-line usage errors (`EX_USAGE`).
pub const EXIT_USAGE: u8 = 64;

/// Exit code for failures writing the command result.
pub const EXIT_IO: u8 = 74;

/// Failed command, reduced to its classification and a printable message.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct CliError {
    /// Classification.
    pub kind: ErrorKind,

    /// Message including the chain of causes.
    pub message: String,
}

impl CliError {
    /// Error of `kind` with a plain message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Error of `kind` described by `error` and its sources.
    pub fn from_error(kind: ErrorKind, error: &(dyn StdError + 'static)) -> Self {
        Self::new(kind, chain(error))
    }

    /// Process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        exit_code(self.kind)
    }
}

/// Process exit code for an error classification.
#[must_use]
pub const fn exit_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::StoreFailure => 1,
        ErrorKind::NotFound => 2,
        ErrorKind::DuplicateIdentity => 3,
        ErrorKind::SyncFailure => 4,
        ErrorKind::DependencyUnresolved => 5,
        ErrorKind::IdentityMismatch => 6,
        ErrorKind::RegistryUnavailable => 7,
        ErrorKind::Aborted => 8,
        ErrorKind::CorruptCacheEntry => 9,
        ErrorKind::InvalidInput => EXIT_USAGE,
    }
}

fn chain(error: &(dyn StdError + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();

    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    message
}

impl From<LifecycleError> for CliError {
    fn from(error: LifecycleError) -> Self {
        Self::from_error(error.kind(), &error)
    }
}

impl From<SyncError> for CliError {
    fn from(error: SyncError) -> Self {
        Self::from_error(error.kind(), &error)
    }
}

impl From<RegistryError> for CliError {
    fn from(error: RegistryError) -> Self {
        Self::from_error(error.kind(), &error)
    }
}

impl From<ConfigError> for CliError {
    fn from(error: ConfigError) -> Self {
        Self::from_error(ErrorKind::InvalidInput, &error)
    }
}

impl From<NameError> for CliError {
    fn from(error: NameError) -> Self {
        Self::from_error(ErrorKind::InvalidInput, &error)
    }
}

impl From<PasswordError> for CliError {
    fn from(error: PasswordError) -> Self {
        Self::from_error(ErrorKind::InvalidInput, &error)
    }
}
