use std::{io, sync::Arc};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tenantgate::{engine::Engine, errors::ErrorKind, registry::Tenant};
use tenantgate_app::{
    config::{AdapterArgs, EngineArgs},
    errors::{CliError, EXIT_IO, EXIT_SUCCESS, exit_code},
    observability::LoggingConfig,
    output::{OutputFormat, Report, write_error},
    postgres::{self, PgPrimaryStore},
    systemd::SystemdController,
};
use tracing::{debug, error};

mod add_member;
mod create_tenant;
mod destroy_tenant;
mod list_tenants;
mod remap_subdomain;
mod remove_member;
mod rotate_password;
mod sync_credentials;
mod validate_access;

#[derive(Debug, Parser)]
#[command(
    name = "tenantgate",
    version,
    about = "Tenant isolation and credential sync for hosted PostgreSQL",
    long_about = None
)]
pub(crate) struct Cli {
    #[command(flatten)]
    pub(crate) logging: LoggingConfig,

    #[command(flatten)]
    engine: EngineArgs,

    #[command(flatten)]
    adapters: AdapterArgs,

    /// Result format (text, json)
    #[arg(long, value_enum, default_value_t, global = true)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a tenant with its owner role, database and subdomain
    CreateTenant(create_tenant::CreateTenantArgs),

    /// Destroy a tenant, or resume an interrupted teardown
    DestroyTenant(destroy_tenant::DestroyTenantArgs),

    /// Bring the pooler credential cache in line with the primary store
    SyncCredentials(sync_credentials::SyncCredentialsArgs),

    /// Check whether a declared identity would reach a tenant
    ValidateAccess(validate_access::ValidateAccessArgs),

    /// List every tenant in the registry
    ListTenants,

    /// Add a restricted member role to a tenant
    AddMember(add_member::AddMemberArgs),

    /// Remove a member role from a tenant
    RemoveMember(remove_member::RemoveMemberArgs),

    /// Replace the password of a tenant role
    RotatePassword(rotate_password::RotatePasswordArgs),

    /// Point a tenant at a different subdomain
    RemapSubdomain(remap_subdomain::RemapSubdomainArgs),
}

/// Finished command: its report and the exit code to leave with.
#[derive(Debug)]
pub(crate) struct Completed {
    report: Report,
    exit_code: u8,
}

impl Completed {
    /// Report that still ends the process with the exit code of `kind`.
    pub(crate) fn failing(report: Report, kind: ErrorKind) -> Self {
        Self {
            report,
            exit_code: exit_code(kind),
        }
    }
}

impl From<Report> for Completed {
    fn from(report: Report) -> Self {
        Self {
            report,
            exit_code: EXIT_SUCCESS,
        }
    }
}

impl Cli {
    /// Run the command, print its result and return the process exit code.
    pub(crate) async fn run(self) -> u8 {
        let format = self.output;
        let result = self.execute().await;

        emit(format, result)
    }

    async fn execute(self) -> Result<Completed, CliError> {
        let engine = build_engine(&self.engine, &self.adapters)?;

        match self.command {
            Commands::CreateTenant(args) => create_tenant::run(args, &engine).await,
            Commands::DestroyTenant(args) => destroy_tenant::run(args, &engine).await,
            Commands::SyncCredentials(args) => sync_credentials::run(args, &engine).await,
            Commands::ValidateAccess(args) => validate_access::run(&args, &engine),
            Commands::ListTenants => list_tenants::run(&engine).await,
            Commands::AddMember(args) => add_member::run(args, &engine).await,
            Commands::RemoveMember(args) => remove_member::run(&args, &engine).await,
            Commands::RotatePassword(args) => rotate_password::run(args, &engine).await,
            Commands::RemapSubdomain(args) => remap_subdomain::run(&args, &engine).await,
        }
    }
}

fn build_engine(engine: &EngineArgs, adapters: &AdapterArgs) -> Result<Engine, CliError> {
    let config = engine.load()?;

    let options = postgres::connect_options(adapters.database_url.as_deref())
        .map_err(|error| CliError::from_error(ErrorKind::InvalidInput, &error))?;

    let store = Arc::new(PgPrimaryStore::connect_lazy(options));
    let controller = Arc::new(SystemdController::new(
        adapters.pooler_unit.clone(),
        adapters.pooler_timeout(),
    ));

    debug!(unit = %adapters.pooler_unit, "adapters ready");

    Ok(Engine::new(config, store, controller)?)
}

fn emit(format: OutputFormat, result: Result<Completed, CliError>) -> u8 {
    let mut out = io::stdout().lock();

    let (written, code) = match result {
        Ok(completed) => (
            completed.report.write_to(format, &mut out),
            completed.exit_code,
        ),
        Err(failure) => {
            error!(kind = %failure.kind, message = %failure.message, "command failed");

            (write_error(&failure, format, &mut out), failure.exit_code())
        }
    };

    match written {
        Ok(()) => code,
        Err(write_failure) => {
            error!(error = %write_failure, "failed to write command result");

            EXIT_IO
        }
    }
}

/// Serialized name of a unit enum variant, e.g. `tls-server-name`.
pub(crate) fn label(value: &impl Serialize) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// `key: value` lines describing a tenant record.
pub(crate) fn tenant_fields(report: Report, tenant: &Tenant, root_identity: &str) -> Report {
    let members = tenant
        .member_roles
        .iter()
        .map(|member| format!("{} ({})", member.name, member.access.as_str()))
        .collect::<Vec<_>>()
        .join(", ");

    report
        .field("tenant", &tenant.id)
        .field("subdomain", &tenant.subdomain)
        .field("hostname", tenant.subdomain.hostname(root_identity))
        .field("status", &tenant.status)
        .field("owner_role", &tenant.owner_role)
        .field("member_roles", members)
}
