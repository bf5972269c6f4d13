//! `PgPrimaryStore` against a disposable `PostgreSQL` container.
//!
//! These tests need a container runtime and are ignored by default:
//! `cargo test -p tenantgate-app -- --ignored`.

use once_cell::sync::Lazy;
use tenantgate::{
    identity::{RoleName, TenantId},
    registry::RoleScope,
    secrets::{HashScheme, Password},
    store::{DependencyKind, NewRole, ObjectKind, PrimaryStore},
};
use tenantgate_app::postgres::{PgPrimaryStore, connect_options};
use testcontainers::{ContainerAsync, TestcontainersError, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres as PostgresImage;
use testresult::TestResult;
use tokio::sync::OnceCell;

/// Shared `PostgreSQL` container that starts once and is reused across all tests
static POSTGRES_CONTAINER: Lazy<OnceCell<ContainerAsync<PostgresImage>>> = Lazy::new(OnceCell::new);

async fn init_postgres_container() -> Result<ContainerAsync<PostgresImage>, TestcontainersError> {
    PostgresImage::default().start().await
}

async fn store() -> TestResult<PgPrimaryStore> {
    let container = POSTGRES_CONTAINER
        .get_or_try_init(init_postgres_container)
        .await?;

    let port = container.get_host_port_ipv4(5432).await?;
    let host =
        std::env::var("TESTCONTAINERS_HOST_OVERRIDE").unwrap_or_else(|_| "localhost".to_string());

    let options = connect_options(Some(&format!(
        "postgresql://postgres:postgres@{host}:{port}/postgres"
    )))?;

    Ok(PgPrimaryStore::connect_lazy(options))
}

fn new_role(name: &str, scope: RoleScope, tenant: &TenantId) -> TestResult<NewRole> {
    Ok(NewRole {
        name: RoleName::parse(name)?,
        scope,
        tenant: tenant.clone(),
        password: Password::new("correct horse battery staple")?,
    })
}

#[tokio::test]
#[ignore = "requires a container runtime"]
async fn login_roles_carry_scram_hashes() -> TestResult {
    let store = store().await?;
    let tenant = TenantId::parse("it_login")?;
    let role = new_role("it_login_owner", RoleScope::TenantOwner, &tenant)?;

    store.create_role(&role).await?;

    let created = store.login_role(&role.name).await?;
    let first_hash = created.map(|login| login.secret_hash);

    assert_eq!(
        first_hash.as_ref().map(tenantgate::secrets::SecretHash::scheme),
        Some(HashScheme::ScramSha256)
    );

    store
        .set_password(&role.name, &Password::new("another long password")?)
        .await?;

    let rotated = store.login_role(&role.name).await?;

    assert_ne!(rotated.map(|login| login.secret_hash), first_hash);

    store.disable_login(&role.name).await?;

    assert!(store.login_role(&role.name).await?.is_none());
    assert!(store.role_exists(&role.name).await?);

    store.drop_role(&role.name).await?;

    assert!(!store.role_exists(&role.name).await?);

    Ok(())
}

#[tokio::test]
#[ignore = "requires a container runtime"]
async fn duplicate_roles_are_reported() -> TestResult {
    let store = store().await?;
    let tenant = TenantId::parse("it_duplicate")?;
    let role = new_role("it_duplicate_owner", RoleScope::TenantOwner, &tenant)?;

    store.create_role(&role).await?;

    let error = store.create_role(&role).await.err();

    assert!(matches!(
        error,
        Some(tenantgate::store::StoreError::AlreadyExists(_))
    ));

    store.drop_role(&role.name).await?;

    Ok(())
}

#[tokio::test]
#[ignore = "requires a container runtime"]
async fn tenant_databases_are_torn_down_by_tier() -> TestResult {
    let store = store().await?;
    let tenant = TenantId::parse("it_teardown")?;
    let owner = new_role("it_teardown_owner", RoleScope::TenantOwner, &tenant)?;
    let member = new_role("it_teardown_ro", RoleScope::TenantMemberReadonly, &tenant)?;
    let admin = RoleName::parse("postgres")?;

    store.create_role(&owner).await?;
    store.create_database(&tenant, &owner.name).await?;
    store
        .grant_scope(&tenant, &owner.name, RoleScope::TenantOwner)
        .await?;
    store.create_role(&member).await?;
    store
        .grant_scope(&tenant, &member.name, RoleScope::TenantMemberReadonly)
        .await?;

    assert!(store.database_exists(tenant.as_str()).await?);

    let member_dependencies = store.dependencies(tenant.as_str(), &member.name).await?;

    assert!(member_dependencies.iter().any(|dependency| {
        dependency.kind == DependencyKind::AclEntry
            && dependency.object.kind == ObjectKind::Database
    }));

    store.revoke_grants(tenant.as_str(), &member.name).await?;
    store
        .drop_owned_cascade(tenant.as_str(), &member.name)
        .await?;
    store.drop_role(&member.name).await?;

    store
        .reassign_owned(tenant.as_str(), &owner.name, &admin)
        .await?;
    store.revoke_grants(tenant.as_str(), &owner.name).await?;

    let owner_dependencies = store.dependencies(tenant.as_str(), &owner.name).await?;

    assert!(!owner_dependencies.iter().any(|dependency| {
        dependency.kind == DependencyKind::Owner && dependency.object.kind == ObjectKind::Database
    }));

    store
        .drop_owned_cascade(tenant.as_str(), &owner.name)
        .await?;
    store.drop_role(&owner.name).await?;
    store.drop_database(tenant.as_str()).await?;

    assert!(!store.database_exists(tenant.as_str()).await?);

    Ok(())
}

#[tokio::test]
#[ignore = "requires a container runtime"]
async fn databases_can_be_renamed_aside() -> TestResult {
    let store = store().await?;
    let tenant = TenantId::parse("it_rename")?;
    let owner = new_role("it_rename_owner", RoleScope::TenantOwner, &tenant)?;

    store.create_role(&owner).await?;
    store.create_database(&tenant, &owner.name).await?;
    store
        .rename_database(tenant.as_str(), "q20260101000000_it_rename")
        .await?;

    assert!(!store.database_exists(tenant.as_str()).await?);
    assert!(store.database_exists("q20260101000000_it_rename").await?);

    store.drop_database("q20260101000000_it_rename").await?;
    store.drop_role(&owner.name).await?;

    Ok(())
}
