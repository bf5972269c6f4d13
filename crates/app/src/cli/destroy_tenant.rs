use clap::{Args, ValueEnum};
use serde_json::json;
use tenantgate::{
    engine::Engine,
    errors::ErrorKind,
    identity::TenantId,
    lifecycle::{AbortHandle, DestroyOutcome},
    registry::TeardownMode,
};
use tenantgate_app::{errors::CliError, output::Report};
use tokio::signal;
use tracing::warn;

use super::Completed;

/// What happens to the tenant's data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum Mode {
    /// Hand the data to the platform administrator and keep it.
    Reassign,

    /// Drop the tenant database.
    Drop,
}

impl From<Mode> for TeardownMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Reassign => Self::ReassignOwnership,
            Mode::Drop => Self::DropData,
        }
    }
}

#[derive(Debug, Args)]
pub(crate) struct DestroyTenantArgs {
    /// Tenant id
    tenant: String,

    /// What happens to the tenant's data
    #[arg(long, value_enum, default_value_t = Mode::Reassign)]
    mode: Mode,
}

pub(crate) async fn run(args: DestroyTenantArgs, engine: &Engine) -> Result<Completed, CliError> {
    let id = TenantId::parse(&args.tenant)?;
    let mode = TeardownMode::from(args.mode);

    let abort = AbortHandle::new();
    let interrupt = tokio::spawn({
        let abort = abort.clone();

        async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; stopping after the current step");
                abort.abort();
            }
        }
    });

    let result = engine.lifecycle().destroy_tenant(&id, mode, &abort).await;

    interrupt.abort();

    let destroyed = result?;

    let mut report = Report::new(json!(destroyed))
        .field("tenant", &destroyed.tenant)
        .field("mode", destroyed.mode);

    if let Some(stage) = destroyed.resumed_from {
        report = report.field("resumed_from", stage);
    }

    Ok(match &destroyed.outcome {
        DestroyOutcome::Clean { resolved_by } => {
            let resolved_by =
                resolved_by.map_or_else(|| "finalization".to_string(), |stage| stage.to_string());

            report
                .field("outcome", "clean")
                .field("resolved_by", resolved_by)
                .into()
        }
        DestroyOutcome::Quarantined { quarantined } => Completed::failing(
            report
                .field("outcome", "quarantined")
                .field("quarantined", quarantined.join(", ")),
            ErrorKind::DependencyUnresolved,
        ),
    })
}

#[cfg(test)]
mod tests {
    use clap::{Parser, error::ErrorKind as ClapErrorKind};

    use super::*;
    use crate::cli::{Cli, Commands};

    fn mode(args: &[&str]) -> Result<Mode, clap::Error> {
        let argv = ["tenantgate", "destroy-tenant", "alpha"].iter().chain(args);
        let cli = Cli::try_parse_from(argv)?;

        match cli.command {
            Commands::DestroyTenant(args) => Ok(args.mode),
            _ => Err(clap::Error::new(ClapErrorKind::InvalidSubcommand)),
        }
    }

    #[test]
    fn mode_defaults_to_reassign() -> Result<(), clap::Error> {
        assert_eq!(mode(&[])?, Mode::Reassign);
        assert_eq!(TeardownMode::from(mode(&["--mode", "drop"])?), TeardownMode::DropData);

        Ok(())
    }

    #[test]
    fn unknown_modes_are_rejected_by_the_parser() {
        let error = mode(&["--mode", "purge"]).err().map(|error| error.kind());

        assert_eq!(error, Some(ClapErrorKind::InvalidValue));
    }
}
