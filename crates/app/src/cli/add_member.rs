use clap::Args;
use serde_json::json;
use tenantgate::{
    engine::Engine,
    identity::{RoleName, TenantId},
    registry::MemberAccess,
    secrets::Password,
};
use tenantgate_app::{errors::CliError, output::Report};

use super::Completed;

#[derive(Debug, Args)]
pub(crate) struct AddMemberArgs {
    /// Tenant id
    tenant: String,

    /// Name of the new role
    role: String,

    /// Grant read access only
    #[arg(long)]
    readonly: bool,

    /// Role password; generated when omitted
    #[arg(long, env = "TENANTGATE_MEMBER_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

pub(crate) async fn run(args: AddMemberArgs, engine: &Engine) -> Result<Completed, CliError> {
    let id = TenantId::parse(&args.tenant)?;
    let role = RoleName::parse(&args.role)?;
    let password = args.password.map(Password::new).transpose()?;
    let access = if args.readonly {
        MemberAccess::Readonly
    } else {
        MemberAccess::Full
    };

    let added = engine
        .lifecycle()
        .add_member(&id, role, access, password)
        .await?;

    let generated = added
        .password_generated
        .then(|| added.password.expose().to_string());

    let mut report = Report::new(json!({
        "tenant": added.tenant,
        "role": added.role,
        "access": access,
        "password": generated,
    }))
    .field("tenant", &added.tenant)
    .field("role", &added.role)
    .field("access", access.as_str());

    if let Some(password) = &generated {
        report = report
            .field("password", password)
            .field("note", "store this password now; it is only shown once");
    }

    Ok(report.into())
}
