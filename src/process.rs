//! Pooling-layer process control.

use async_trait::async_trait;
use mockall::automock;
use serde::Serialize;
use thiserror::Error;

use crate::retry::Transient;

/// Observed state of the pooling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessStatus {
    /// Running and accepting connections.
    Running,

    /// Not running.
    Stopped,

    /// Service manager could not tell.
    Unknown,
}

/// Process controller errors.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The action is not supported by the pooling layer or service manager.
    #[error("{0} is not supported")]
    Unsupported(&'static str),

    /// The service manager ran the action and reported failure.
    #[error("{action} failed: {detail}")]
    Failed {
        /// Action attempted.
        action: &'static str,

        /// Service manager output.
        detail: String,
    },

    /// The service manager could not be invoked.
    #[error("failed to invoke service manager for {action}")]
    Spawn {
        /// Action attempted.
        action: &'static str,

        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The action did not finish in time.
    #[error("{0} timed out")]
    TimedOut(&'static str),
}

impl Transient for ControllerError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::TimedOut(_))
    }
}

#[automock]
#[async_trait]
/// Control surface of the pooling layer.
pub trait ProcessController: Send + Sync {
    /// Reload the credential cache without dropping active sessions.
    async fn reload(&self) -> Result<(), ControllerError>;

    /// Restart the pooling layer.
    async fn restart(&self) -> Result<(), ControllerError>;

    /// Current status.
    async fn status(&self) -> Result<ProcessStatus, ControllerError>;
}
