//! systemd-backed pooler control

use std::{io, process::Output, time::Duration};

use async_trait::async_trait;
use tenantgate::process::{ControllerError, ProcessController, ProcessStatus};
use tokio::{process::Command, time};
use tracing::debug;

/// Controls the pooling layer through `systemctl`.
#[derive(Debug, Clone)]
pub struct SystemdController {
    program: String,
    unit: String,
    timeout: Duration,
}

impl SystemdController {
    /// Controller for `unit`, waiting at most `timeout` per action.
    #[must_use]
    pub fn new(unit: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: "systemctl".to_string(),
            unit: unit.into(),
            timeout,
        }
    }

    /// Run `program` instead of `systemctl`.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn systemctl(&self, action: &'static str, verb: &str) -> Result<Output, ControllerError> {
        debug!(unit = %self.unit, action, "invoking service manager");

        let child = Command::new(&self.program)
            .arg(verb)
            .arg(&self.unit)
            .kill_on_drop(true)
            .output();

        match time::timeout(self.timeout, child).await {
            Ok(result) => result.map_err(|source| spawn_error(action, source)),
            Err(_elapsed) => Err(ControllerError::TimedOut(action)),
        }
    }

    async fn run(&self, action: &'static str, verb: &str) -> Result<(), ControllerError> {
        let output = self.systemctl(action, verb).await?;

        if output.status.success() {
            return Ok(());
        }

        let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();

        // Units without ExecReload refuse `reload` outright.
        if action == "reload" && detail.contains("does not support reload") {
            return Err(ControllerError::Unsupported(action));
        }

        Err(ControllerError::Failed { action, detail })
    }
}

fn spawn_error(action: &'static str, source: io::Error) -> ControllerError {
    ControllerError::Spawn { action, source }
}

/// Map the first line printed by `systemctl is-active`.
fn parse_status(stdout: &str) -> ProcessStatus {
    match stdout.lines().next().map(str::trim) {
        Some("active" | "reloading") => ProcessStatus::Running,
        Some("inactive" | "failed" | "deactivating") => ProcessStatus::Stopped,
        _ => ProcessStatus::Unknown,
    }
}

#[async_trait]
impl ProcessController for SystemdController {
    async fn reload(&self) -> Result<(), ControllerError> {
        self.run("reload", "reload").await
    }

    async fn restart(&self) -> Result<(), ControllerError> {
        self.run("restart", "restart").await
    }

    async fn status(&self) -> Result<ProcessStatus, ControllerError> {
        // `is-active` exits non-zero for anything but an active unit; the text is what counts.
        let output = self.systemctl("status", "is-active").await?;

        Ok(parse_status(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    #[test]
    fn is_active_output_maps_to_status() {
        assert_eq!(parse_status("active\n"), ProcessStatus::Running);
        assert_eq!(parse_status("failed\n"), ProcessStatus::Stopped);
        assert_eq!(parse_status("inactive\n"), ProcessStatus::Stopped);
        assert_eq!(parse_status("activating\n"), ProcessStatus::Unknown);
        assert_eq!(parse_status(""), ProcessStatus::Unknown);
    }

    #[tokio::test]
    async fn successful_actions_return_ok() -> TestResult {
        let controller =
            SystemdController::new("pgbouncer", Duration::from_secs(5)).with_program("true");

        controller.reload().await?;
        controller.restart().await?;

        Ok(())
    }

    #[tokio::test]
    async fn failing_actions_are_reported() {
        let controller =
            SystemdController::new("pgbouncer", Duration::from_secs(5)).with_program("false");

        let result = controller.restart().await;

        assert!(matches!(
            result,
            Err(ControllerError::Failed {
                action: "restart",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn missing_service_manager_cannot_be_spawned() {
        let controller = SystemdController::new("pgbouncer", Duration::from_secs(5))
            .with_program("/nonexistent/systemctl");

        let result = controller.status().await;

        assert!(matches!(result, Err(ControllerError::Spawn { .. })));
    }
}
