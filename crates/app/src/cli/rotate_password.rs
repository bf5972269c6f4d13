use clap::Args;
use serde_json::json;
use tenantgate::{
    engine::Engine,
    identity::{RoleName, TenantId},
    secrets::Password,
};
use tenantgate_app::{errors::CliError, output::Report};

use super::Completed;

#[derive(Debug, Args)]
pub(crate) struct RotatePasswordArgs {
    /// Tenant id
    tenant: String,

    /// Owner or member role of the tenant
    role: String,

    /// New password; generated when omitted
    #[arg(long, env = "TENANTGATE_NEW_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

pub(crate) async fn run(args: RotatePasswordArgs, engine: &Engine) -> Result<Completed, CliError> {
    let id = TenantId::parse(&args.tenant)?;
    let role = RoleName::parse(&args.role)?;
    let password = args.password.map(Password::new).transpose()?;

    let rotated = engine
        .lifecycle()
        .rotate_password(&id, &role, password)
        .await?;

    let generated = rotated
        .password_generated
        .then(|| rotated.password.expose().to_string());

    let mut report = Report::new(json!({
        "tenant": rotated.tenant,
        "role": rotated.role,
        "password": generated,
    }))
    .field("tenant", &rotated.tenant)
    .field("role", &rotated.role);

    if let Some(password) = &generated {
        report = report
            .field("password", password)
            .field("note", "store this password now; it is only shown once");
    }

    Ok(report.into())
}
