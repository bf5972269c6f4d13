use clap::Args;
use serde_json::json;
use tenantgate::{engine::Engine, gate::AccessDecision, identity::TenantId};
use tenantgate_app::{errors::CliError, output::Report};

use super::{Completed, label};

#[derive(Debug, Args)]
pub(crate) struct ValidateAccessArgs {
    /// Tenant id
    tenant: String,

    /// Hostname the client would declare through the TLS server name
    identity: String,
}

/// Reads the registry only; safe to repeat.
pub(crate) fn run(args: &ValidateAccessArgs, engine: &Engine) -> Result<Completed, CliError> {
    let id = TenantId::parse(&args.tenant)?;

    match engine.gate().validate_access(&id, &args.identity) {
        decision @ AccessDecision::Allowed(reason) => Ok(Report::new(json!(decision))
            .field("tenant", &id)
            .field("identity", &args.identity)
            .field("decision", "allowed")
            .field("reason", label(&reason))
            .into()),
        AccessDecision::Rejected(reason) => Err(CliError::new(
            reason.kind(),
            format!(
                "access to tenant {id} through {} rejected: {reason}",
                args.identity
            ),
        )),
    }
}
