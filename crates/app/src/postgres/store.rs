//! `PostgreSQL` primary store

use async_trait::async_trait;
use sqlx::{
    Connection, FromRow, PgConnection, PgPool, Row,
    postgres::{PgConnectOptions, PgPoolOptions, PgRow},
    query, query_as, query_scalar,
};
use tenantgate::{
    identity::{RoleName, TenantId},
    registry::{Privilege, RoleScope},
    secrets::{Password, SecretHash},
    store::{
        Dependency, DependencyKind, LoginRole, NewRole, ObjectKind, ObjectRef, PrimaryStore,
        StoreError,
    },
};
use tracing::{debug, warn};

use super::{
    errors::{drop_role_error, store_error},
    quote_ident,
};

const LIST_LOGIN_ROLES_SQL: &str = include_str!("sql/list_login_roles.sql");
const LOGIN_ROLE_SQL: &str = include_str!("sql/login_role.sql");
const ROLE_EXISTS_SQL: &str = include_str!("sql/role_exists.sql");
const DATABASE_EXISTS_SQL: &str = include_str!("sql/database_exists.sql");
const QUOTE_LITERAL_SQL: &str = include_str!("sql/quote_literal.sql");
const TERMINATE_ROLE_SESSIONS_SQL: &str = include_str!("sql/terminate_role_sessions.sql");
const TERMINATE_DATABASE_SESSIONS_SQL: &str = include_str!("sql/terminate_database_sessions.sql");
const USER_SCHEMAS_SQL: &str = include_str!("sql/user_schemas.sql");
const SHARED_DEPENDENCIES_SQL: &str = include_str!("sql/shared_dependencies.sql");
const FOREIGN_KEY_DEPENDENCIES_SQL: &str = include_str!("sql/foreign_key_dependencies.sql");
const MEMBERSHIPS_SQL: &str = include_str!("sql/memberships.sql");

/// Role flags every non-superuser role is created with.
const RESTRICTED_ROLE_FLAGS: &str =
    "NOSUPERUSER NOCREATEDB NOCREATEROLE NOREPLICATION NOBYPASSRLS";

/// Primary store backed by a `PostgreSQL` cluster, reached through an administrative role.
#[derive(Debug, Clone)]
pub struct PgPrimaryStore {
    pool: PgPool,
    options: PgConnectOptions,
}

impl PgPrimaryStore {
    /// Store connecting with `options`. No connection is opened until the first call.
    #[must_use]
    pub fn connect_lazy(options: PgConnectOptions) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_lazy_with(options.clone());

        Self { pool, options }
    }

    /// Open a dedicated connection to `database`; per-database catalogs are only visible there.
    async fn connect_to(&self, database: &str) -> Result<PgConnection, StoreError> {
        PgConnection::connect_with(&self.options.clone().database(database))
            .await
            .map_err(|error| store_error(error, format_args!("database {database}")))
    }

    async fn execute(&self, sql: &str, subject: &str) -> Result<(), StoreError> {
        debug!(%subject, "executing statement");

        query(sql)
            .execute(&self.pool)
            .await
            .map_err(|error| store_error(error, subject))?;

        Ok(())
    }

    async fn execute_in(
        connection: &mut PgConnection,
        sql: &str,
        subject: &str,
    ) -> Result<(), StoreError> {
        debug!(%subject, "executing statement");

        query(sql)
            .execute(connection)
            .await
            .map_err(|error| store_error(error, subject))?;

        Ok(())
    }

    /// Quote a password server-side; it cannot be bound as a parameter in role DDL.
    async fn password_literal(
        &self,
        role: &RoleName,
        password: &Password,
    ) -> Result<String, StoreError> {
        query_scalar(QUOTE_LITERAL_SQL)
            .bind(password.expose())
            .fetch_one(&self.pool)
            .await
            .map_err(|error| store_error(error, format_args!("password of role {role}")))
    }

    async fn terminate_database_sessions(&self, database: &str) -> Result<(), StoreError> {
        let terminated: i64 = query_scalar(TERMINATE_DATABASE_SESSIONS_SQL)
            .bind(database)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| store_error(error, format_args!("database {database}")))?;

        debug!(database, terminated, "terminated database sessions");

        Ok(())
    }

    async fn schemas(connection: &mut PgConnection) -> Result<Vec<String>, StoreError> {
        query_scalar(USER_SCHEMAS_SQL)
            .fetch_all(connection)
            .await
            .map_err(|error| store_error(error, "schemas"))
    }
}

struct LoginRoleRow {
    name: String,
    secret_hash: String,
}

impl<'r> FromRow<'r, PgRow> for LoginRoleRow {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            name: row.try_get("rolname")?,
            secret_hash: row.try_get("rolpassword")?,
        })
    }
}

impl LoginRoleRow {
    /// Roles whose name or hash the engine cannot represent are left out of the cache.
    fn into_login_role(self) -> Option<LoginRole> {
        let name = match RoleName::parse(&self.name) {
            Ok(name) => name,
            Err(error) => {
                debug!(role = %self.name, %error, "skipping role with unsupported name");

                return None;
            }
        };

        match SecretHash::parse(&self.secret_hash) {
            Ok(secret_hash) => Some(LoginRole { name, secret_hash }),
            Err(error) => {
                warn!(role = %name, %error, "skipping role with unsupported secret hash");

                None
            }
        }
    }
}

struct SharedDependencyRow {
    deptype: String,
    object_type: String,
    object_schema: Option<String>,
    object_name: Option<String>,
    parent: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for SharedDependencyRow {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self {
            deptype: row.try_get("deptype")?,
            object_type: row.try_get("object_type")?,
            object_schema: row.try_get("object_schema")?,
            object_name: row.try_get("object_name")?,
            parent: row.try_get("parent")?,
        })
    }
}

/// Object kind of a `pg_identify_object` type name.
fn object_kind(object_type: &str) -> Option<ObjectKind> {
    Some(match object_type {
        "database" => ObjectKind::Database,
        "schema" => ObjectKind::Schema,
        "table" | "foreign table" | "index" => ObjectKind::Table,
        "view" | "materialized view" => ObjectKind::View,
        "sequence" => ObjectKind::Sequence,
        "function" | "procedure" | "aggregate" => ObjectKind::Function,
        "type" | "domain" | "composite type" => ObjectKind::Type,
        "table constraint" => ObjectKind::Constraint,
        "policy" => ObjectKind::Policy,
        "default acl" => ObjectKind::DefaultAcl,
        _ => return None,
    })
}

/// Dependency kind of a `pg_shdepend.deptype`.
fn dependency_kind(deptype: &str, kind: ObjectKind) -> Option<DependencyKind> {
    if kind == ObjectKind::DefaultAcl {
        return Some(DependencyKind::DefaultPrivilege);
    }

    match deptype {
        "o" => Some(DependencyKind::Owner),
        "a" => Some(DependencyKind::AclEntry),
        "r" => Some(DependencyKind::Policy),
        _ => None,
    }
}

impl SharedDependencyRow {
    fn into_dependency(self, database: &str, role: &RoleName) -> Option<Dependency> {
        let Some(kind) = object_kind(&self.object_type) else {
            warn!(object_type = %self.object_type, %role, "ignoring unsupported dependency");

            return None;
        };

        let dependency_kind = dependency_kind(&self.deptype, kind)?;

        Some(Dependency {
            role: role.clone(),
            kind: dependency_kind,
            object: ObjectRef {
                kind,
                database: database.to_string(),
                schema: self.object_schema,
                name: self.object_name.unwrap_or_default(),
                parent: self.parent,
            },
            requires: Vec::new(),
        })
    }
}

/// Constraints and policies on a table must go before the table changes hands.
fn link_requirements(dependencies: &mut [Dependency]) {
    let attached: Vec<ObjectRef> = dependencies
        .iter()
        .filter(|dependency| {
            matches!(
                dependency.object.kind,
                ObjectKind::Constraint | ObjectKind::Policy
            )
        })
        .map(|dependency| dependency.object.clone())
        .collect();

    for dependency in dependencies.iter_mut() {
        if !matches!(dependency.object.kind, ObjectKind::Table | ObjectKind::View) {
            continue;
        }

        dependency.requires = attached
            .iter()
            .filter(|object| {
                object.schema == dependency.object.schema
                    && object.parent.as_deref() == Some(dependency.object.name.as_str())
            })
            .cloned()
            .collect();
    }
}

/// Schema-qualified, quoted name of `object`.
fn qualified(object: &ObjectRef) -> String {
    let name = match object.kind {
        // Functions carry their argument list: `name(args)`.
        ObjectKind::Function => match object.name.split_once('(') {
            Some((name, arguments)) => format!("{}({arguments}", quote_ident(name)),
            None => quote_ident(&object.name),
        },
        _ => quote_ident(&object.name),
    };

    match &object.schema {
        Some(schema) => format!("{}.{name}", quote_ident(schema)),
        None => name,
    }
}

/// Qualified, quoted table a constraint or policy is attached to.
fn parent_table(object: &ObjectRef) -> Result<String, StoreError> {
    let parent = object.parent.as_deref().ok_or_else(|| StoreError::Irrecoverable {
        object: object.to_string(),
        detail: "parent table unknown".to_string(),
    })?;

    Ok(match &object.schema {
        Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(parent)),
        None => quote_ident(parent),
    })
}

/// `REVOKE` keyword for the object kind of an ACL entry.
fn acl_target(kind: ObjectKind) -> Option<&'static str> {
    match kind {
        ObjectKind::Database => Some("DATABASE"),
        ObjectKind::Schema => Some("SCHEMA"),
        ObjectKind::Table | ObjectKind::View => Some("TABLE"),
        ObjectKind::Sequence => Some("SEQUENCE"),
        ObjectKind::Function => Some("FUNCTION"),
        ObjectKind::Type => Some("TYPE"),
        _ => None,
    }
}

/// Statement removing the single reference `dependency` describes.
fn clear_statement(dependency: &Dependency) -> Result<String, StoreError> {
    let object = &dependency.object;
    let role = quote_ident(dependency.role.as_str());
    let irrecoverable = |detail: &str| StoreError::Irrecoverable {
        object: object.to_string(),
        detail: detail.to_string(),
    };

    let statement = match (dependency.kind, object.kind) {
        (DependencyKind::Owner, ObjectKind::Database) => {
            return Err(irrecoverable("database ownership must be reassigned"));
        }
        (DependencyKind::Membership, _) => {
            let member = object
                .parent
                .as_deref()
                .ok_or_else(|| irrecoverable("membership without member"))?;

            format!(
                "REVOKE {} FROM {}",
                quote_ident(&object.name),
                quote_ident(member)
            )
        }
        (DependencyKind::DefaultPrivilege, _) => {
            let owner = object
                .parent
                .as_deref()
                .ok_or_else(|| irrecoverable("default privilege without owner"))?;
            let scope = object
                .schema
                .as_deref()
                .map(|schema| format!(" IN SCHEMA {}", quote_ident(schema)))
                .unwrap_or_default();

            format!(
                "ALTER DEFAULT PRIVILEGES FOR ROLE {}{scope} REVOKE ALL ON {} FROM {role}",
                quote_ident(owner),
                object.name
            )
        }
        (DependencyKind::AclEntry, kind) => {
            let target = acl_target(kind).ok_or_else(|| irrecoverable("unsupported grant"))?;

            format!("REVOKE ALL ON {target} {} FROM {role}", qualified(object))
        }
        (DependencyKind::Policy, _) | (_, ObjectKind::Policy) => format!(
            "DROP POLICY IF EXISTS {} ON {}",
            quote_ident(&object.name),
            parent_table(object)?
        ),
        (DependencyKind::ForeignKey, _) | (_, ObjectKind::Constraint) => format!(
            "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
            parent_table(object)?,
            quote_ident(&object.name)
        ),
        (DependencyKind::Owner, kind) => {
            let keyword = match kind {
                ObjectKind::Schema => "SCHEMA",
                ObjectKind::Table => "TABLE",
                ObjectKind::View => "VIEW",
                ObjectKind::Sequence => "SEQUENCE",
                ObjectKind::Function => "ROUTINE",
                ObjectKind::Type => "TYPE",
                _ => return Err(irrecoverable("unsupported owned object")),
            };

            format!("DROP {keyword} IF EXISTS {} CASCADE", qualified(object))
        }
    };

    Ok(statement)
}

/// Statement renaming `object` to `new_name` in place.
fn rename_statement(object: &ObjectRef, new_name: &str) -> Result<String, StoreError> {
    let keyword = match object.kind {
        ObjectKind::Schema => "SCHEMA",
        ObjectKind::Table | ObjectKind::View => "TABLE",
        ObjectKind::Sequence => "SEQUENCE",
        ObjectKind::Function => "ROUTINE",
        ObjectKind::Type => "TYPE",
        _ => {
            return Err(StoreError::Rejected(format!(
                "{object} cannot be renamed"
            )));
        }
    };

    Ok(format!(
        "ALTER {keyword} {} RENAME TO {}",
        qualified(object),
        quote_ident(new_name)
    ))
}

/// Statements applying `scope` inside the tenant database, run as the administrative role.
fn scope_statements(
    scope: RoleScope,
    role: &RoleName,
    owner: &RoleName,
    schema: &str,
) -> Vec<String> {
    // Owners already hold every privilege on what they own.
    if scope.grants(Privilege::OwnDatabase) {
        return Vec::new();
    }

    let role = quote_ident(role.as_str());
    let owner = quote_ident(owner.as_str());
    let schema = quote_ident(schema);
    let defaults = format!("ALTER DEFAULT PRIVILEGES FOR ROLE {owner} IN SCHEMA {schema} GRANT");

    let mut statements = Vec::new();

    for privilege in scope.privileges() {
        match privilege {
            Privilege::UseSchema => {
                statements.push(format!("GRANT USAGE ON SCHEMA {schema} TO {role}"));
            }
            Privilege::Read => {
                statements.extend([
                    format!("GRANT SELECT ON ALL TABLES IN SCHEMA {schema} TO {role}"),
                    format!("GRANT SELECT ON ALL SEQUENCES IN SCHEMA {schema} TO {role}"),
                    format!("{defaults} SELECT ON TABLES TO {role}"),
                    format!("{defaults} SELECT ON SEQUENCES TO {role}"),
                ]);
            }
            Privilege::Write => {
                statements.extend([
                    format!(
                        "GRANT INSERT, UPDATE, DELETE, TRUNCATE ON ALL TABLES IN SCHEMA {schema} \
                         TO {role}"
                    ),
                    format!("GRANT USAGE, UPDATE ON ALL SEQUENCES IN SCHEMA {schema} TO {role}"),
                    format!("{defaults} INSERT, UPDATE, DELETE, TRUNCATE ON TABLES TO {role}"),
                    format!("{defaults} USAGE, UPDATE ON SEQUENCES TO {role}"),
                ]);
            }
            Privilege::Execute => {
                statements.extend([
                    format!("GRANT EXECUTE ON ALL FUNCTIONS IN SCHEMA {schema} TO {role}"),
                    format!("{defaults} EXECUTE ON FUNCTIONS TO {role}"),
                ]);
            }
            Privilege::BypassIsolation
            | Privilege::OwnDatabase
            | Privilege::Connect
            | Privilege::Temporary
            | Privilege::CreateSchema => {}
        }
    }

    statements
}

/// Database-level privileges of `scope`.
fn database_privileges(scope: RoleScope) -> Vec<&'static str> {
    scope
        .privileges()
        .iter()
        .filter_map(|privilege| match privilege {
            Privilege::Connect => Some("CONNECT"),
            Privilege::Temporary => Some("TEMPORARY"),
            Privilege::CreateSchema => Some("CREATE"),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl PrimaryStore for PgPrimaryStore {
    async fn list_login_roles(&self) -> Result<Vec<LoginRole>, StoreError> {
        let rows = query_as::<_, LoginRoleRow>(LIST_LOGIN_ROLES_SQL)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| store_error(error, "login roles"))?;

        Ok(rows
            .into_iter()
            .filter_map(LoginRoleRow::into_login_role)
            .collect())
    }

    async fn login_role(&self, name: &RoleName) -> Result<Option<LoginRole>, StoreError> {
        let row = query_as::<_, LoginRoleRow>(LOGIN_ROLE_SQL)
            .bind(name.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| store_error(error, format_args!("role {name}")))?;

        Ok(row.and_then(LoginRoleRow::into_login_role))
    }

    async fn role_exists(&self, name: &RoleName) -> Result<bool, StoreError> {
        query_scalar(ROLE_EXISTS_SQL)
            .bind(name.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|error| store_error(error, format_args!("role {name}")))
    }

    async fn database_exists(&self, name: &str) -> Result<bool, StoreError> {
        query_scalar(DATABASE_EXISTS_SQL)
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| store_error(error, format_args!("database {name}")))
    }

    async fn create_role(&self, role: &NewRole) -> Result<(), StoreError> {
        let password = self.password_literal(&role.name, &role.password).await?;
        let subject = format!("role {}", role.name);
        let flags = if role.scope.bypasses_isolation() {
            "SUPERUSER"
        } else {
            RESTRICTED_ROLE_FLAGS
        };

        self.execute(
            &format!(
                "CREATE ROLE {} LOGIN PASSWORD {password} {flags}",
                quote_ident(role.name.as_str())
            ),
            &subject,
        )
        .await?;

        self.execute(
            &format!(
                "COMMENT ON ROLE {} IS {}",
                quote_ident(role.name.as_str()),
                literal(&format!("tenantgate: {} of {}", role.scope, role.tenant))
            ),
            &subject,
        )
        .await
    }

    async fn create_database(&self, tenant: &TenantId, owner: &RoleName) -> Result<(), StoreError> {
        let database = quote_ident(tenant.as_str());
        let subject = format!("database {tenant}");

        self.execute(
            &format!(
                "CREATE DATABASE {database} OWNER {}",
                quote_ident(owner.as_str())
            ),
            &subject,
        )
        .await?;

        // Tenants are reachable only by their own roles.
        self.execute(
            &format!("REVOKE ALL ON DATABASE {database} FROM PUBLIC"),
            &subject,
        )
        .await?;

        let mut connection = self.connect_to(tenant.as_str()).await?;

        Self::execute_in(
            &mut connection,
            "REVOKE ALL ON SCHEMA public FROM PUBLIC",
            &subject,
        )
        .await?;
        Self::execute_in(
            &mut connection,
            &format!(
                "ALTER SCHEMA public OWNER TO {}",
                quote_ident(owner.as_str())
            ),
            &subject,
        )
        .await?;

        connection
            .close()
            .await
            .map_err(|error| store_error(error, &subject))
    }

    async fn grant_scope(
        &self,
        tenant: &TenantId,
        role: &RoleName,
        scope: RoleScope,
    ) -> Result<(), StoreError> {
        if scope.bypasses_isolation() {
            return Ok(());
        }

        let subject = format!("grants of role {role} on {tenant}");
        let privileges = database_privileges(scope);

        if !privileges.is_empty() {
            self.execute(
                &format!(
                    "GRANT {} ON DATABASE {} TO {}",
                    privileges.join(", "),
                    quote_ident(tenant.as_str()),
                    quote_ident(role.as_str())
                ),
                &subject,
            )
            .await?;
        }

        let mut connection = self.connect_to(tenant.as_str()).await?;
        let owner = tenant.owner_role();

        for schema in Self::schemas(&mut connection).await? {
            for statement in scope_statements(scope, role, &owner, &schema) {
                Self::execute_in(&mut connection, &statement, &subject).await?;
            }
        }

        connection
            .close()
            .await
            .map_err(|error| store_error(error, &subject))
    }

    async fn set_password(&self, role: &RoleName, password: &Password) -> Result<(), StoreError> {
        let password = self.password_literal(role, password).await?;

        self.execute(
            &format!(
                "ALTER ROLE {} PASSWORD {password}",
                quote_ident(role.as_str())
            ),
            &format!("role {role}"),
        )
        .await
    }

    async fn disable_login(&self, role: &RoleName) -> Result<(), StoreError> {
        self.execute(
            &format!("ALTER ROLE {} NOLOGIN", quote_ident(role.as_str())),
            &format!("role {role}"),
        )
        .await?;

        let terminated: i64 = query_scalar(TERMINATE_ROLE_SESSIONS_SQL)
            .bind(role.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|error| store_error(error, format_args!("sessions of role {role}")))?;

        debug!(%role, terminated, "login disabled");

        Ok(())
    }

    async fn drop_role(&self, role: &RoleName) -> Result<(), StoreError> {
        query(&format!("DROP ROLE IF EXISTS {}", quote_ident(role.as_str())))
            .execute(&self.pool)
            .await
            .map_err(|error| drop_role_error(error, role))?;

        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<(), StoreError> {
        self.terminate_database_sessions(name).await?;

        self.execute(
            &format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", quote_ident(name)),
            &format!("database {name}"),
        )
        .await
    }

    async fn reassign_owned(
        &self,
        database: &str,
        role: &RoleName,
        to: &RoleName,
    ) -> Result<(), StoreError> {
        let mut connection = self.connect_to(database).await?;
        let subject = format!("objects of role {role} in {database}");

        Self::execute_in(
            &mut connection,
            &format!(
                "REASSIGN OWNED BY {} TO {}",
                quote_ident(role.as_str()),
                quote_ident(to.as_str())
            ),
            &subject,
        )
        .await?;

        connection
            .close()
            .await
            .map_err(|error| store_error(error, &subject))
    }

    async fn revoke_grants(&self, database: &str, role: &RoleName) -> Result<(), StoreError> {
        let subject = format!("grants of role {role} in {database}");
        let quoted = quote_ident(role.as_str());

        self.execute(
            &format!(
                "REVOKE ALL ON DATABASE {} FROM {quoted}",
                quote_ident(database)
            ),
            &subject,
        )
        .await?;

        let memberships: Vec<(String, String)> = query_as(MEMBERSHIPS_SQL)
            .bind(role.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|error| store_error(error, &subject))?;

        for (granted, member) in memberships {
            self.execute(
                &format!(
                    "REVOKE {} FROM {}",
                    quote_ident(&granted),
                    quote_ident(&member)
                ),
                &subject,
            )
            .await?;
        }

        let mut connection = self.connect_to(database).await?;

        for schema in Self::schemas(&mut connection).await? {
            let schema = quote_ident(&schema);

            for statement in [
                format!("REVOKE ALL ON SCHEMA {schema} FROM {quoted}"),
                format!("REVOKE ALL ON ALL TABLES IN SCHEMA {schema} FROM {quoted}"),
                format!("REVOKE ALL ON ALL SEQUENCES IN SCHEMA {schema} FROM {quoted}"),
                format!("REVOKE ALL ON ALL FUNCTIONS IN SCHEMA {schema} FROM {quoted}"),
            ] {
                Self::execute_in(&mut connection, &statement, &subject).await?;
            }
        }

        connection
            .close()
            .await
            .map_err(|error| store_error(error, &subject))
    }

    async fn drop_owned_cascade(&self, database: &str, role: &RoleName) -> Result<(), StoreError> {
        let mut connection = self.connect_to(database).await?;
        let subject = format!("objects of role {role} in {database}");

        Self::execute_in(
            &mut connection,
            &format!("DROP OWNED BY {} CASCADE", quote_ident(role.as_str())),
            &subject,
        )
        .await?;

        connection
            .close()
            .await
            .map_err(|error| store_error(error, &subject))
    }

    async fn dependencies(
        &self,
        database: &str,
        role: &RoleName,
    ) -> Result<Vec<Dependency>, StoreError> {
        let mut connection = self.connect_to(database).await?;
        let subject = format!("dependencies of role {role} in {database}");

        let shared = query_as::<_, SharedDependencyRow>(SHARED_DEPENDENCIES_SQL)
            .bind(role.as_str())
            .fetch_all(&mut connection)
            .await
            .map_err(|error| store_error(error, &subject))?;

        let foreign_keys: Vec<(String, String, String)> =
            query_as(FOREIGN_KEY_DEPENDENCIES_SQL)
                .bind(role.as_str())
                .fetch_all(&mut connection)
                .await
                .map_err(|error| store_error(error, &subject))?;

        let memberships: Vec<(String, String)> = query_as(MEMBERSHIPS_SQL)
            .bind(role.as_str())
            .fetch_all(&mut connection)
            .await
            .map_err(|error| store_error(error, &subject))?;

        connection
            .close()
            .await
            .map_err(|error| store_error(error, &subject))?;

        let mut dependencies: Vec<Dependency> = shared
            .into_iter()
            .filter_map(|row| row.into_dependency(database, role))
            .collect();

        dependencies.extend(foreign_keys.into_iter().map(|(name, schema, parent)| {
            Dependency {
                role: role.clone(),
                kind: DependencyKind::ForeignKey,
                object: ObjectRef {
                    kind: ObjectKind::Constraint,
                    database: database.to_string(),
                    schema: Some(schema),
                    name,
                    parent: Some(parent),
                },
                requires: Vec::new(),
            }
        }));

        dependencies.extend(memberships.into_iter().map(|(granted, member)| Dependency {
            role: role.clone(),
            kind: DependencyKind::Membership,
            object: ObjectRef {
                kind: ObjectKind::Role,
                database: database.to_string(),
                schema: None,
                name: granted,
                parent: Some(member),
            },
            requires: Vec::new(),
        }));

        link_requirements(&mut dependencies);

        Ok(dependencies)
    }

    async fn clear_dependency(&self, dependency: &Dependency) -> Result<(), StoreError> {
        let statement = clear_statement(dependency)?;
        let object = &dependency.object;
        let subject = object.to_string();

        // Database-level and role-level statements run against the shared catalog.
        if matches!(object.kind, ObjectKind::Database | ObjectKind::Role) {
            return self.execute(&statement, &subject).await;
        }

        let mut connection = self.connect_to(&object.database).await?;

        Self::execute_in(&mut connection, &statement, &subject).await?;

        connection
            .close()
            .await
            .map_err(|error| store_error(error, &subject))
    }

    async fn rename_object(&self, object: &ObjectRef, new_name: &str) -> Result<(), StoreError> {
        let statement = rename_statement(object, new_name)?;
        let subject = object.to_string();
        let mut connection = self.connect_to(&object.database).await?;

        Self::execute_in(&mut connection, &statement, &subject).await?;

        connection
            .close()
            .await
            .map_err(|error| store_error(error, &subject))
    }

    async fn rename_database(&self, from: &str, to: &str) -> Result<(), StoreError> {
        self.terminate_database_sessions(from).await?;

        self.execute(
            &format!(
                "ALTER DATABASE {} RENAME TO {}",
                quote_ident(from),
                quote_ident(to)
            ),
            &format!("database {from}"),
        )
        .await
    }
}

/// SQL string literal for non-secret text.
fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    fn object(kind: ObjectKind, name: &str, parent: Option<&str>) -> ObjectRef {
        ObjectRef {
            kind,
            database: "alpha".to_string(),
            schema: Some("public".to_string()),
            name: name.to_string(),
            parent: parent.map(str::to_string),
        }
    }

    fn dependency(kind: DependencyKind, object: ObjectRef) -> TestResult<Dependency> {
        Ok(Dependency {
            role: RoleName::parse("alpha_owner")?,
            kind,
            object,
            requires: Vec::new(),
        })
    }

    #[test]
    fn acl_entries_are_revoked() -> TestResult {
        let dependency = dependency(
            DependencyKind::AclEntry,
            object(ObjectKind::Table, "orders", None),
        )?;

        assert_eq!(
            clear_statement(&dependency)?,
            r#"REVOKE ALL ON TABLE "public"."orders" FROM "alpha_owner""#
        );

        Ok(())
    }

    #[test]
    fn foreign_keys_are_dropped_from_their_table() -> TestResult {
        let dependency = dependency(
            DependencyKind::ForeignKey,
            object(ObjectKind::Constraint, "orders_customer_fk", Some("orders")),
        )?;

        assert_eq!(
            clear_statement(&dependency)?,
            r#"ALTER TABLE "public"."orders" DROP CONSTRAINT IF EXISTS "orders_customer_fk""#
        );

        Ok(())
    }

    #[test]
    fn default_privileges_are_revoked_for_their_owner() -> TestResult {
        let dependency = dependency(
            DependencyKind::DefaultPrivilege,
            object(ObjectKind::DefaultAcl, "TABLES", Some("platform_admin")),
        )?;

        assert_eq!(
            clear_statement(&dependency)?,
            concat!(
                r#"ALTER DEFAULT PRIVILEGES FOR ROLE "platform_admin" IN SCHEMA "public" "#,
                r#"REVOKE ALL ON TABLES FROM "alpha_owner""#
            )
        );

        Ok(())
    }

    #[test]
    fn database_ownership_is_irrecoverable() -> TestResult {
        let dependency = dependency(
            DependencyKind::Owner,
            ObjectRef {
                kind: ObjectKind::Database,
                database: "alpha".to_string(),
                schema: None,
                name: "alpha".to_string(),
                parent: None,
            },
        )?;

        assert!(matches!(
            clear_statement(&dependency),
            Err(StoreError::Irrecoverable { .. })
        ));

        Ok(())
    }

    #[test]
    fn functions_keep_their_argument_list() -> TestResult {
        let function = object(ObjectKind::Function, "total(integer, text)", None);

        assert_eq!(
            rename_statement(&function, "q20260101000000_total")?,
            r#"ALTER ROUTINE "public"."total"(integer, text) RENAME TO "q20260101000000_total""#
        );
        assert!(rename_statement(&object(ObjectKind::Policy, "p", Some("t")), "q").is_err());

        Ok(())
    }

    #[test]
    fn tables_require_their_constraints_first() -> TestResult {
        let constraint = object(ObjectKind::Constraint, "orders_fk", Some("orders"));

        let mut dependencies = vec![
            dependency(
                DependencyKind::Owner,
                object(ObjectKind::Table, "orders", None),
            )?,
            dependency(DependencyKind::ForeignKey, constraint.clone())?,
            dependency(
                DependencyKind::Policy,
                object(ObjectKind::Policy, "own_rows", Some("customers")),
            )?,
        ];

        link_requirements(&mut dependencies);

        assert_eq!(
            dependencies.first().map(|dependency| dependency.requires.clone()),
            Some(vec![constraint])
        );

        Ok(())
    }

    #[test]
    fn readonly_members_only_read() -> TestResult {
        let role = RoleName::parse("alpha_reporting")?;
        let owner = RoleName::parse("alpha_owner")?;

        let statements =
            scope_statements(RoleScope::TenantMemberReadonly, &role, &owner, "public");

        assert!(statements.iter().all(|statement| !statement.contains("INSERT")));
        assert!(statements.iter().any(|statement| statement.contains("GRANT SELECT")));
        assert_eq!(database_privileges(RoleScope::TenantMemberReadonly), vec!["CONNECT"]);
        assert!(scope_statements(RoleScope::TenantOwner, &owner, &owner, "public").is_empty());

        Ok(())
    }
}
