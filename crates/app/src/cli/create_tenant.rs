use clap::Args;
use serde_json::json;
use tenantgate::{
    engine::Engine,
    identity::{Subdomain, TenantId},
    secrets::Password,
};
use tenantgate_app::{errors::CliError, output::Report};

use super::{Completed, tenant_fields};

#[derive(Debug, Args)]
pub(crate) struct CreateTenantArgs {
    /// Tenant id; also the name of its database
    tenant: String,

    /// Subdomain label; defaults to the tenant id
    #[arg(long)]
    subdomain: Option<String>,

    /// Owner password; generated when omitted
    #[arg(long, env = "TENANTGATE_OWNER_PASSWORD", hide_env_values = true)]
    owner_password: Option<String>,
}

pub(crate) async fn run(args: CreateTenantArgs, engine: &Engine) -> Result<Completed, CliError> {
    let id = TenantId::parse(&args.tenant)?;
    let subdomain = args.subdomain.as_deref().map(Subdomain::parse).transpose()?;
    let password = args.owner_password.map(Password::new).transpose()?;

    let created = engine
        .lifecycle()
        .create_tenant(id, subdomain, password)
        .await?;

    let root_identity = &engine.config().root_identity;
    let generated = created
        .password_generated
        .then(|| created.owner_password.expose().to_string());

    let mut report = tenant_fields(
        Report::new(json!({
            "tenant": created.tenant,
            "hostname": created.tenant.subdomain.hostname(root_identity),
            "owner_password": generated,
            "self_test": created.self_test,
            "self_test_passed": created.self_test.passed(),
        })),
        &created.tenant,
        root_identity,
    );

    if let Some(password) = &generated {
        report = report
            .field("owner_password", password)
            .field("note", "store this password now; it is only shown once");
    }

    Ok(report
        .field("self_test", if created.self_test.passed() { "passed" } else { "failed" })
        .into())
}
