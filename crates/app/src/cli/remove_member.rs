use clap::Args;
use serde_json::json;
use tenantgate::{
    engine::Engine,
    identity::{RoleName, TenantId},
};
use tenantgate_app::{errors::CliError, output::Report};

use super::{Completed, tenant_fields};

#[derive(Debug, Args)]
pub(crate) struct RemoveMemberArgs {
    /// Tenant id
    tenant: String,

    /// Member role to remove; objects it owns pass to the tenant owner
    role: String,
}

pub(crate) async fn run(args: &RemoveMemberArgs, engine: &Engine) -> Result<Completed, CliError> {
    let id = TenantId::parse(&args.tenant)?;
    let role = RoleName::parse(&args.role)?;

    let tenant = engine.lifecycle().remove_member(&id, &role).await?;

    let report = Report::new(json!({ "removed": role, "tenant": tenant })).field("removed", &role);

    Ok(tenant_fields(report, &tenant, &engine.config().root_identity).into())
}
