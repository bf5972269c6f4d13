//! Recording process controller.

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::time;

use crate::process::{ControllerError, ProcessController, ProcessStatus};

#[derive(Debug)]
struct ControllerState {
    actions: Vec<&'static str>,
    reload_supported: bool,
    reload_delay: Duration,
    status: ProcessStatus,
}

/// [`ProcessController`] that only records what it was asked to do.
#[derive(Debug)]
pub struct RecordingController {
    state: Mutex<ControllerState>,
}

impl Default for RecordingController {
    fn default() -> Self {
        Self {
            state: Mutex::new(ControllerState {
                actions: Vec::new(),
                reload_supported: true,
                reload_delay: Duration::ZERO,
                status: ProcessStatus::Running,
            }),
        }
    }
}

impl RecordingController {
    /// Running pooler that supports reloads.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pooler that rejects reloads, forcing the restart fallback.
    #[must_use]
    pub fn without_reload() -> Self {
        let controller = Self::default();

        controller.state().reload_supported = false;

        controller
    }

    /// Pooler whose reloads take `delay` to complete.
    #[must_use]
    pub fn with_reload_delay(delay: Duration) -> Self {
        let controller = Self::default();

        controller.state().reload_delay = delay;

        controller
    }

    /// Status reported from now on.
    pub fn set_status(&self, status: ProcessStatus) {
        self.state().status = status;
    }

    /// Actions requested so far, in order.
    pub fn actions(&self) -> Vec<&'static str> {
        self.state().actions.clone()
    }

    fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ProcessController for RecordingController {
    async fn reload(&self) -> Result<(), ControllerError> {
        let delay = self.state().reload_delay;

        if !delay.is_zero() {
            time::sleep(delay).await;
        }

        let mut state = self.state();

        state.actions.push("reload");

        if state.reload_supported {
            Ok(())
        } else {
            Err(ControllerError::Unsupported("reload"))
        }
    }

    async fn restart(&self) -> Result<(), ControllerError> {
        self.state().actions.push("restart");

        Ok(())
    }

    async fn status(&self) -> Result<ProcessStatus, ControllerError> {
        let mut state = self.state();

        state.actions.push("status");

        Ok(state.status)
    }
}
