use std::path::Path;

use clap::{Args, ValueEnum};
use serde_json::json;
use tenantgate::{
    credentials::{
        FindingAction, ReloadOutcome, RepairReport, SyncAction, SyncOneReport, SyncReport,
    },
    engine::Engine,
    errors::ErrorKind,
    identity::RoleName,
};
use tenantgate_app::{errors::CliError, output::Report};

use super::{Completed, label};

/// What happened to the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum Action {
    /// Role was created.
    Add,

    /// Role's secret changed.
    Update,

    /// Role was dropped or lost its login capability.
    Delete,
}

impl From<Action> for SyncAction {
    fn from(action: Action) -> Self {
        match action {
            Action::Add => Self::Add,
            Action::Update => Self::Update,
            Action::Delete => Self::Delete,
        }
    }
}

#[derive(Debug, Args)]
pub(crate) struct SyncCredentialsArgs {
    /// Converge only the entry of this user
    #[arg(long, requires = "action")]
    user: Option<String>,

    /// What happened to the user
    #[arg(long, value_enum, requires = "user")]
    action: Option<Action>,

    /// Check every cache line without writing anything
    #[arg(long, conflicts_with_all = ["user", "repair"])]
    verify_only: bool,

    /// Repair corrupt lines in place, quarantining the ones that cannot be repaired
    #[arg(long, conflicts_with = "user")]
    repair: bool,
}

pub(crate) async fn run(args: SyncCredentialsArgs, engine: &Engine) -> Result<Completed, CliError> {
    let sync = engine.sync();

    if args.verify_only {
        let verified = sync.verify()?;
        let corrupt = verified.corrupt();
        let report = repair_fields(Report::new(json!(verified)), &verified);

        return Ok(if corrupt == 0 {
            report.into()
        } else {
            Completed::failing(report, ErrorKind::CorruptCacheEntry)
        });
    }

    if args.repair {
        let repaired = sync.verify_and_repair().await?;

        return Ok(repair_fields(Report::new(json!(repaired)), &repaired).into());
    }

    if let (Some(user), Some(action)) = (args.user, args.action) {
        let username = RoleName::parse(&user)?;
        let synced = sync.sync_one(&username, action.into()).await?;

        return Ok(sync_one_fields(Report::new(json!(synced)), &synced).into());
    }

    let synced = sync.full_resync().await?;

    Ok(full_fields(Report::new(json!(synced)), &synced).into())
}

fn path_or_none(path: Option<&Path>) -> String {
    path.map_or_else(|| "none".to_string(), |path| path.display().to_string())
}

fn reload_or_none(reload: Option<ReloadOutcome>) -> String {
    reload.map_or_else(|| "none".to_string(), |reload| label(&reload))
}

fn full_fields(report: Report, synced: &SyncReport) -> Report {
    report
        .field("added", synced.added)
        .field("updated", synced.updated)
        .field("removed", synced.removed)
        .field("unchanged", synced.unchanged)
        .field("discarded_corrupt", synced.discarded_corrupt)
        .field("written", synced.written)
        .field("backup", path_or_none(synced.backup.as_deref()))
        .field("reload", reload_or_none(synced.reload))
}

fn sync_one_fields(report: Report, synced: &SyncOneReport) -> Report {
    report
        .field("user", &synced.username)
        .field("action", synced.action)
        .field("change", label(&synced.change))
        .field("backup", path_or_none(synced.backup.as_deref()))
        .field("reload", reload_or_none(synced.reload))
}

fn repair_fields(report: Report, repaired: &RepairReport) -> Report {
    let report = report
        .field("lines", repaired.lines)
        .field("corrupt", repaired.corrupt())
        .field("repaired", repaired.repaired)
        .field("quarantined", repaired.quarantined)
        .field("duplicates_dropped", repaired.duplicates_dropped)
        .field("written", repaired.written)
        .field("backup", path_or_none(repaired.backup.as_deref()))
        .field("quarantine", path_or_none(repaired.quarantine.as_deref()))
        .field("reload", reload_or_none(repaired.reload));

    let rows = repaired
        .findings
        .iter()
        .map(|finding| {
            vec![
                finding.line.to_string(),
                finding.username.clone().unwrap_or_default(),
                finding_action(&finding.action),
            ]
        })
        .collect::<Vec<_>>();

    if rows.is_empty() {
        report
    } else {
        report.table(vec!["line", "user", "action"], rows)
    }
}

fn finding_action(action: &FindingAction) -> String {
    match action {
        FindingAction::Repaired { fixes } => {
            let fixes = fixes.iter().map(label).collect::<Vec<_>>().join(", ");

            format!("repaired ({fixes})")
        }
        FindingAction::Quarantined { reason } => format!("quarantined ({})", label(reason)),
        FindingAction::DuplicateDropped => "duplicate dropped".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use clap::{Parser, error::ErrorKind as ClapErrorKind};

    use super::*;
    use crate::cli::{Cli, Commands};

    fn parse(args: &[&str]) -> Result<SyncCredentialsArgs, clap::Error> {
        let cli = Cli::try_parse_from(["tenantgate", "sync-credentials"].iter().chain(args))?;

        match cli.command {
            Commands::SyncCredentials(args) => Ok(args),
            _ => Err(clap::Error::new(ClapErrorKind::InvalidSubcommand)),
        }
    }

    #[test]
    fn actions_are_parsed_by_name() -> Result<(), clap::Error> {
        let args = parse(&["--user", "alice", "--action", "delete"])?;

        assert_eq!(args.action.map(SyncAction::from), Some(SyncAction::Delete));

        Ok(())
    }

    #[test]
    fn unknown_actions_are_rejected_by_the_parser() {
        let error = parse(&["--user", "alice", "--action", "rename"])
            .err()
            .map(|error| error.kind());

        assert_eq!(error, Some(ClapErrorKind::InvalidValue));
    }

    #[test]
    fn action_requires_a_user() {
        let error = parse(&["--action", "add"]).err().map(|error| error.kind());

        assert_eq!(error, Some(ClapErrorKind::MissingRequiredArgument));
    }
}
