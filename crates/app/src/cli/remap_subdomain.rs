use clap::Args;
use serde_json::json;
use tenantgate::{
    engine::Engine,
    identity::{Subdomain, TenantId},
};
use tenantgate_app::{errors::CliError, output::Report};

use super::{Completed, tenant_fields};

#[derive(Debug, Args)]
pub(crate) struct RemapSubdomainArgs {
    /// Tenant id
    tenant: String,

    /// New subdomain label
    subdomain: String,
}

pub(crate) async fn run(args: &RemapSubdomainArgs, engine: &Engine) -> Result<Completed, CliError> {
    let id = TenantId::parse(&args.tenant)?;
    let subdomain = Subdomain::parse(&args.subdomain)?;

    let tenant = engine.lifecycle().remap_subdomain(&id, subdomain).await?;

    Ok(tenant_fields(
        Report::new(json!(tenant)),
        &tenant,
        &engine.config().root_identity,
    )
    .into())
}
