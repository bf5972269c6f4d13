use serde_json::json;
use tenantgate::{engine::Engine, registry::Tenant};
use tenantgate_app::{errors::CliError, output::Report};

use super::Completed;

pub(crate) async fn run(engine: &Engine) -> Result<Completed, CliError> {
    let tenants = engine.lifecycle().list_tenants().await?;
    let root_identity = &engine.config().root_identity;

    let rows = tenants
        .iter()
        .map(|tenant| row(tenant, root_identity))
        .collect::<Vec<_>>();

    Ok(Report::new(json!(tenants))
        .field("tenants", tenants.len())
        .table(
            vec!["tenant", "hostname", "status", "owner", "members"],
            rows,
        )
        .into())
}

fn row(tenant: &Tenant, root_identity: &str) -> Vec<String> {
    // Only live tenants are reachable through their hostname.
    let hostname = if tenant.is_live() {
        tenant.subdomain.hostname(root_identity)
    } else {
        "-".to_string()
    };

    vec![
        tenant.id.to_string(),
        hostname,
        tenant.status.to_string(),
        tenant.owner_role.to_string(),
        tenant.member_roles.len().to_string(),
    ]
}
