//! In-memory primary store
//!
//! Models just enough of a catalog for teardown to behave like the real thing: roles own
//! databases and objects, objects carry grants and other mentions of roles, and objects may
//! depend on each other so drops cascade. Pinned objects can be renamed but never dropped or
//! handed to another owner.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};

use crate::{
    identity::{RoleName, TenantId},
    registry::RoleScope,
    secrets::{Password, SecretHash, SecretHashError},
    store::{
        Dependency, DependencyKind, LoginRole, NewRole, ObjectKind, ObjectRef, PrimaryStore,
        StoreError,
    },
};

const SCRAM_ITERATIONS: u32 = 4096;

/// Deterministic SCRAM-shaped hash of `password` for `role`.
///
/// The same inputs always give the same hash, so a full resync and a series of incremental
/// syncs can be compared byte for byte. This is not a real SCRAM derivation.
///
/// # Errors
///
/// Never fails in practice; the result is validated like any other hash.
pub fn fake_scram_hash(role: &RoleName, password: &str) -> Result<SecretHash, SecretHashError> {
    let digest = |label: &str| {
        BASE64.encode(
            Sha256::new()
                .chain_update(label)
                .chain_update([0_u8])
                .chain_update(role.as_str())
                .chain_update([0_u8])
                .chain_update(password)
                .finalize(),
        )
    };

    SecretHash::parse(&format!(
        "SCRAM-SHA-256${SCRAM_ITERATIONS}:{}${}:{}",
        digest("salt"),
        digest("stored"),
        digest("server"),
    ))
}

/// Catalog object held by [`MemoryPrimaryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Identity of the object.
    pub object: ObjectRef,

    /// Owning role.
    pub owner: RoleName,

    /// Roles holding privileges on the object.
    pub grants: BTreeSet<RoleName>,

    /// Roles named by the object without owning it or holding a grant, e.g. in a policy.
    pub mentions: BTreeSet<RoleName>,

    /// Objects this one depends on; dropping any of them drops this one too.
    pub depends_on: Vec<ObjectRef>,

    /// Cannot be dropped or reassigned.
    pub pinned: bool,
}

impl StoredObject {
    /// Unpinned object owned by `owner`.
    #[must_use]
    pub fn new(object: ObjectRef, owner: RoleName) -> Self {
        Self {
            object,
            owner,
            grants: BTreeSet::new(),
            mentions: BTreeSet::new(),
            depends_on: Vec::new(),
            pinned: false,
        }
    }

    fn references(&self, role: &RoleName) -> bool {
        self.owner == *role || self.grants.contains(role) || self.mentions.contains(role)
    }
}

#[derive(Debug, Clone)]
struct StoredRole {
    secret_hash: SecretHash,
    login: bool,
}

#[derive(Debug, Clone)]
struct StoredDatabase {
    owner: RoleName,
    grants: BTreeSet<RoleName>,
    objects: Vec<StoredObject>,
}

impl StoredDatabase {
    /// `roots` plus everything depending on them, transitively.
    fn cascade(&self, roots: BTreeSet<ObjectRef>) -> Result<BTreeSet<ObjectRef>, StoreError> {
        let mut dropped = roots;

        loop {
            let dependents: Vec<&StoredObject> = self
                .objects
                .iter()
                .filter(|stored| {
                    !dropped.contains(&stored.object)
                        && stored.depends_on.iter().any(|object| dropped.contains(object))
                })
                .collect();

            if dependents.is_empty() {
                break;
            }

            for stored in dependents {
                dropped.insert(stored.object.clone());
            }
        }

        if let Some(pinned) = self
            .objects
            .iter()
            .find(|stored| stored.pinned && dropped.contains(&stored.object))
        {
            return Err(pinned_error(&pinned.object));
        }

        Ok(dropped)
    }

    fn drop_objects(&mut self, roots: BTreeSet<ObjectRef>) -> Result<(), StoreError> {
        let dropped = self.cascade(roots)?;

        self.objects.retain(|stored| !dropped.contains(&stored.object));

        Ok(())
    }

    fn object_mut(&mut self, object: &ObjectRef) -> Result<&mut StoredObject, StoreError> {
        self.objects
            .iter_mut()
            .find(|stored| stored.object == *object)
            .ok_or_else(|| StoreError::Missing(object.to_string()))
    }
}

#[derive(Debug, Default)]
struct Catalog {
    roles: BTreeMap<RoleName, StoredRole>,
    databases: BTreeMap<String, StoredDatabase>,
}

impl Catalog {
    fn role_mut(&mut self, name: &RoleName) -> Result<&mut StoredRole, StoreError> {
        self.roles
            .get_mut(name)
            .ok_or_else(|| StoreError::Missing(format!("role {name}")))
    }

    fn database_mut(&mut self, name: &str) -> Result<&mut StoredDatabase, StoreError> {
        self.databases
            .get_mut(name)
            .ok_or_else(|| StoreError::Missing(format!("database {name}")))
    }

    fn references(&self, role: &RoleName) -> usize {
        self.databases
            .values()
            .map(|database| {
                usize::from(database.owner == *role)
                    + usize::from(database.grants.contains(role))
                    + database
                        .objects
                        .iter()
                        .filter(|stored| stored.references(role))
                        .count()
            })
            .sum()
    }
}

fn pinned_error(object: &ObjectRef) -> StoreError {
    StoreError::Irrecoverable {
        object: object.to_string(),
        detail: "object is pinned".to_string(),
    }
}

fn database_ref(name: &str) -> ObjectRef {
    ObjectRef {
        kind: ObjectKind::Database,
        database: name.to_string(),
        schema: None,
        name: name.to_string(),
        parent: None,
    }
}

fn mention_kind(kind: ObjectKind) -> DependencyKind {
    match kind {
        ObjectKind::Policy => DependencyKind::Policy,
        ObjectKind::DefaultAcl => DependencyKind::DefaultPrivilege,
        ObjectKind::Constraint => DependencyKind::ForeignKey,
        ObjectKind::Role => DependencyKind::Membership,
        _ => DependencyKind::AclEntry,
    }
}

/// [`PrimaryStore`] kept entirely in memory, with fault injection and a call log.
#[derive(Debug, Default)]
pub struct MemoryPrimaryStore {
    catalog: Mutex<Catalog>,
    faults: Mutex<FxHashMap<&'static str, VecDeque<StoreError>>>,
    calls: Mutex<Vec<String>>,
}

impl MemoryPrimaryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a role with an explicit hash, replacing any role of the same name.
    pub fn add_role(&self, name: RoleName, secret_hash: SecretHash, login: bool) {
        self.catalog()
            .roles
            .insert(name, StoredRole { secret_hash, login });
    }

    /// Change a role's hash behind the engine's back.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Missing`] for an unknown role.
    pub fn set_secret_hash(
        &self,
        name: &RoleName,
        secret_hash: SecretHash,
    ) -> Result<(), StoreError> {
        self.catalog().role_mut(name)?.secret_hash = secret_hash;

        Ok(())
    }

    /// Add an empty database.
    pub fn add_database(&self, name: impl Into<String>, owner: RoleName) {
        self.catalog().databases.insert(
            name.into(),
            StoredDatabase {
                owner,
                grants: BTreeSet::new(),
                objects: Vec::new(),
            },
        );
    }

    /// Add an object to the database named in its reference.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Missing`] when the database does not exist, or
    /// [`StoreError::AlreadyExists`] for a duplicate object.
    pub fn add_object(&self, object: StoredObject) -> Result<(), StoreError> {
        let mut catalog = self.catalog();
        let database = catalog.database_mut(&object.object.database)?;

        if database
            .objects
            .iter()
            .any(|stored| stored.object == object.object)
        {
            return Err(StoreError::AlreadyExists(object.object.to_string()));
        }

        database.objects.push(object);

        Ok(())
    }

    /// Fail the next call of `operation` (the trait method name) with `error`.
    pub fn fail_next(&self, operation: &'static str, error: StoreError) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Every call made so far, as `operation detail` strings.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Names of all roles.
    pub fn role_names(&self) -> Vec<RoleName> {
        self.catalog().roles.keys().cloned().collect()
    }

    /// Whether the role may log in; `None` when it does not exist.
    pub fn login_enabled(&self, name: &RoleName) -> Option<bool> {
        self.catalog().roles.get(name).map(|role| role.login)
    }

    /// Whether the database exists.
    pub fn has_database(&self, name: &str) -> bool {
        self.catalog().databases.contains_key(name)
    }

    /// Names of all databases.
    pub fn database_names(&self) -> Vec<String> {
        self.catalog().databases.keys().cloned().collect()
    }

    /// Owner of the database.
    pub fn database_owner(&self, name: &str) -> Option<RoleName> {
        self.catalog()
            .databases
            .get(name)
            .map(|database| database.owner.clone())
    }

    /// Objects in the database, in insertion order.
    pub fn objects(&self, database: &str) -> Vec<StoredObject> {
        self.catalog()
            .databases
            .get(database)
            .map(|database| database.objects.clone())
            .unwrap_or_default()
    }

    fn catalog(&self) -> MutexGuard<'_, Catalog> {
        self.catalog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Log the call and return an injected fault, if any.
    fn enter(&self, operation: &'static str, detail: impl fmt::Display) -> Result<(), StoreError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{operation} {detail}"));

        match self
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn hash_password(role: &RoleName, password: &Password) -> Result<SecretHash, StoreError> {
    fake_scram_hash(role, password.expose())
        .map_err(|error| StoreError::Rejected(error.to_string()))
}

#[async_trait]
impl PrimaryStore for MemoryPrimaryStore {
    async fn list_login_roles(&self) -> Result<Vec<LoginRole>, StoreError> {
        self.enter("list_login_roles", "")?;

        Ok(self
            .catalog()
            .roles
            .iter()
            .filter(|(_, role)| role.login)
            .map(|(name, role)| LoginRole {
                name: name.clone(),
                secret_hash: role.secret_hash.clone(),
            })
            .collect())
    }

    async fn login_role(&self, name: &RoleName) -> Result<Option<LoginRole>, StoreError> {
        self.enter("login_role", name)?;

        Ok(self
            .catalog()
            .roles
            .get(name)
            .filter(|role| role.login)
            .map(|role| LoginRole {
                name: name.clone(),
                secret_hash: role.secret_hash.clone(),
            }))
    }

    async fn role_exists(&self, name: &RoleName) -> Result<bool, StoreError> {
        self.enter("role_exists", name)?;

        Ok(self.catalog().roles.contains_key(name))
    }

    async fn database_exists(&self, name: &str) -> Result<bool, StoreError> {
        self.enter("database_exists", name)?;

        Ok(self.has_database(name))
    }

    async fn create_role(&self, role: &NewRole) -> Result<(), StoreError> {
        self.enter("create_role", &role.name)?;

        let mut catalog = self.catalog();

        if catalog.roles.contains_key(&role.name) {
            return Err(StoreError::AlreadyExists(format!("role {}", role.name)));
        }

        catalog.roles.insert(
            role.name.clone(),
            StoredRole {
                secret_hash: hash_password(&role.name, &role.password)?,
                login: true,
            },
        );

        Ok(())
    }

    async fn create_database(&self, tenant: &TenantId, owner: &RoleName) -> Result<(), StoreError> {
        self.enter("create_database", tenant)?;

        let mut catalog = self.catalog();

        if catalog.databases.contains_key(tenant.as_str()) {
            return Err(StoreError::AlreadyExists(format!("database {tenant}")));
        }

        catalog.role_mut(owner)?;
        catalog.databases.insert(
            tenant.to_string(),
            StoredDatabase {
                owner: owner.clone(),
                grants: BTreeSet::new(),
                objects: Vec::new(),
            },
        );

        Ok(())
    }

    async fn grant_scope(
        &self,
        tenant: &TenantId,
        role: &RoleName,
        scope: RoleScope,
    ) -> Result<(), StoreError> {
        self.enter("grant_scope", format_args!("{tenant} {role} {scope}"))?;

        let mut catalog = self.catalog();

        catalog.role_mut(role)?;
        catalog
            .database_mut(tenant.as_str())?
            .grants
            .insert(role.clone());

        Ok(())
    }

    async fn set_password(&self, role: &RoleName, password: &Password) -> Result<(), StoreError> {
        self.enter("set_password", role)?;

        self.catalog().role_mut(role)?.secret_hash = hash_password(role, password)?;

        Ok(())
    }

    async fn disable_login(&self, role: &RoleName) -> Result<(), StoreError> {
        self.enter("disable_login", role)?;

        self.catalog().role_mut(role)?.login = false;

        Ok(())
    }

    async fn drop_role(&self, role: &RoleName) -> Result<(), StoreError> {
        self.enter("drop_role", role)?;

        let mut catalog = self.catalog();

        if !catalog.roles.contains_key(role) {
            return Ok(());
        }

        match catalog.references(role) {
            0 => {
                catalog.roles.remove(role);

                Ok(())
            }
            count => Err(StoreError::DependentObjects {
                role: role.clone(),
                detail: format!("{count} objects depend on it"),
            }),
        }
    }

    async fn drop_database(&self, name: &str) -> Result<(), StoreError> {
        self.enter("drop_database", name)?;

        self.catalog().databases.remove(name);

        Ok(())
    }

    async fn reassign_owned(
        &self,
        database: &str,
        role: &RoleName,
        to: &RoleName,
    ) -> Result<(), StoreError> {
        self.enter("reassign_owned", format_args!("{database} {role} -> {to}"))?;

        let mut catalog = self.catalog();
        let database = catalog.database_mut(database)?;

        if let Some(pinned) = database
            .objects
            .iter()
            .find(|stored| stored.pinned && stored.owner == *role)
        {
            return Err(pinned_error(&pinned.object));
        }

        if database.owner == *role {
            database.owner = to.clone();
        }

        for stored in &mut database.objects {
            if stored.owner == *role {
                stored.owner = to.clone();
            }
        }

        Ok(())
    }

    async fn revoke_grants(&self, database: &str, role: &RoleName) -> Result<(), StoreError> {
        self.enter("revoke_grants", format_args!("{database} {role}"))?;

        let mut catalog = self.catalog();
        let database = catalog.database_mut(database)?;

        database.grants.remove(role);

        for stored in &mut database.objects {
            stored.grants.remove(role);
        }

        Ok(())
    }

    async fn drop_owned_cascade(&self, database: &str, role: &RoleName) -> Result<(), StoreError> {
        self.enter("drop_owned_cascade", format_args!("{database} {role}"))?;

        let mut catalog = self.catalog();
        let database = catalog.database_mut(database)?;

        let owned: BTreeSet<ObjectRef> = database
            .objects
            .iter()
            .filter(|stored| stored.owner == *role)
            .map(|stored| stored.object.clone())
            .collect();

        database.drop_objects(owned)?;
        database.grants.remove(role);

        for stored in &mut database.objects {
            stored.grants.remove(role);
        }

        Ok(())
    }

    async fn dependencies(
        &self,
        database: &str,
        role: &RoleName,
    ) -> Result<Vec<Dependency>, StoreError> {
        self.enter("dependencies", format_args!("{database} {role}"))?;

        let catalog = self.catalog();
        let stored_database = catalog
            .databases
            .get(database)
            .ok_or_else(|| StoreError::Missing(format!("database {database}")))?;

        let dependency = |kind, object: &ObjectRef| Dependency {
            role: role.clone(),
            kind,
            object: object.clone(),
            requires: stored_database
                .objects
                .iter()
                .filter(|stored| stored.references(role) && stored.depends_on.contains(object))
                .map(|stored| stored.object.clone())
                .collect(),
        };

        let mut dependencies = Vec::new();
        let database_object = database_ref(database);

        if stored_database.owner == *role {
            dependencies.push(dependency(DependencyKind::Owner, &database_object));
        }

        if stored_database.grants.contains(role) {
            dependencies.push(dependency(DependencyKind::AclEntry, &database_object));
        }

        for stored in &stored_database.objects {
            if stored.owner == *role {
                dependencies.push(dependency(DependencyKind::Owner, &stored.object));
            }

            if stored.grants.contains(role) {
                dependencies.push(dependency(DependencyKind::AclEntry, &stored.object));
            }

            if stored.mentions.contains(role) {
                dependencies.push(dependency(mention_kind(stored.object.kind), &stored.object));
            }
        }

        Ok(dependencies)
    }

    async fn clear_dependency(&self, dependency: &Dependency) -> Result<(), StoreError> {
        self.enter("clear_dependency", &dependency.object)?;

        let mut catalog = self.catalog();
        let database = catalog.database_mut(&dependency.object.database)?;

        if dependency.object.kind == ObjectKind::Database {
            return match dependency.kind {
                DependencyKind::AclEntry | DependencyKind::Membership => {
                    database.grants.remove(&dependency.role);

                    Ok(())
                }
                _ => Err(StoreError::Irrecoverable {
                    object: dependency.object.to_string(),
                    detail: "database ownership must be reassigned".to_string(),
                }),
            };
        }

        let stored = database.object_mut(&dependency.object)?;

        if stored.pinned {
            return Err(pinned_error(&stored.object));
        }

        match dependency.kind {
            DependencyKind::AclEntry | DependencyKind::Membership => {
                stored.grants.remove(&dependency.role);
                stored.mentions.remove(&dependency.role);

                Ok(())
            }
            DependencyKind::Owner
            | DependencyKind::ForeignKey
            | DependencyKind::Policy
            | DependencyKind::DefaultPrivilege => {
                database.drop_objects(BTreeSet::from([dependency.object.clone()]))
            }
        }
    }

    async fn rename_object(&self, object: &ObjectRef, new_name: &str) -> Result<(), StoreError> {
        self.enter("rename_object", format_args!("{object} -> {new_name}"))?;

        let mut catalog = self.catalog();
        let database = catalog.database_mut(&object.database)?;

        let renamed = ObjectRef {
            name: new_name.to_string(),
            ..object.clone()
        };

        if database
            .objects
            .iter()
            .any(|stored| stored.object == renamed)
        {
            return Err(StoreError::AlreadyExists(renamed.to_string()));
        }

        database.object_mut(object)?.object = renamed.clone();

        for stored in &mut database.objects {
            for dependency in &mut stored.depends_on {
                if dependency == object {
                    *dependency = renamed.clone();
                }
            }
        }

        Ok(())
    }

    async fn rename_database(&self, from: &str, to: &str) -> Result<(), StoreError> {
        self.enter("rename_database", format_args!("{from} -> {to}"))?;

        let mut catalog = self.catalog();

        if catalog.databases.contains_key(to) {
            return Err(StoreError::AlreadyExists(format!("database {to}")));
        }

        let mut database = catalog
            .databases
            .remove(from)
            .ok_or_else(|| StoreError::Missing(format!("database {from}")))?;

        for stored in &mut database.objects {
            stored.object.database = to.to_string();

            for dependency in &mut stored.depends_on {
                dependency.database = to.to_string();
            }
        }

        catalog.databases.insert(to.to_string(), database);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    fn table(name: &str) -> ObjectRef {
        ObjectRef {
            kind: ObjectKind::Table,
            database: "alpha".to_string(),
            schema: Some("public".to_string()),
            name: name.to_string(),
            parent: None,
        }
    }

    fn store_with_owner() -> TestResult<(MemoryPrimaryStore, RoleName)> {
        let store = MemoryPrimaryStore::new();
        let owner = RoleName::parse("alpha_owner")?;

        store.add_role(owner.clone(), fake_scram_hash(&owner, "secret")?, true);
        store.add_database("alpha", owner.clone());

        Ok((store, owner))
    }

    #[test]
    fn fake_hashes_are_deterministic_scram() -> TestResult {
        let role = RoleName::parse("alpha_owner")?;

        let first = fake_scram_hash(&role, "secret")?;

        assert_eq!(first, fake_scram_hash(&role, "secret")?);
        assert_ne!(first, fake_scram_hash(&role, "other")?);
        assert_eq!(first.scheme(), crate::secrets::HashScheme::ScramSha256);

        Ok(())
    }

    #[tokio::test]
    async fn dropping_owned_objects_cascades_to_dependents() -> TestResult {
        let (store, owner) = store_with_owner()?;
        let other = RoleName::parse("postgres")?;

        store.add_object(StoredObject::new(table("orders"), owner.clone()))?;
        store.add_object(StoredObject {
            depends_on: vec![table("orders")],
            ..StoredObject::new(table("order_lines"), other)
        })?;

        store.drop_owned_cascade("alpha", &owner).await?;

        assert!(store.objects("alpha").is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn pinned_objects_block_reassignment_atomically() -> TestResult {
        let (store, owner) = store_with_owner()?;
        let admin = RoleName::parse("postgres")?;

        store.add_object(StoredObject {
            pinned: true,
            ..StoredObject::new(table("ledger"), owner.clone())
        })?;

        let result = store.reassign_owned("alpha", &owner, &admin).await;

        assert!(matches!(result, Err(StoreError::Irrecoverable { .. })));
        assert_eq!(store.database_owner("alpha"), Some(owner));

        Ok(())
    }

    #[tokio::test]
    async fn roles_with_references_cannot_be_dropped() -> TestResult {
        let (store, owner) = store_with_owner()?;

        let result = store.drop_role(&owner).await;

        assert!(matches!(result, Err(StoreError::DependentObjects { .. })));

        Ok(())
    }

    #[tokio::test]
    async fn injected_faults_fire_once() -> TestResult {
        let store = MemoryPrimaryStore::new();

        store.fail_next(
            "list_login_roles",
            StoreError::Unavailable("connection reset".into()),
        );

        assert!(store.list_login_roles().await.is_err());
        assert!(store.list_login_roles().await?.is_empty());
        assert_eq!(store.calls().len(), 2);

        Ok(())
    }

    #[tokio::test]
    async fn renaming_a_database_moves_its_objects() -> TestResult {
        let (store, owner) = store_with_owner()?;

        store.add_object(StoredObject::new(table("orders"), owner))?;
        store.rename_database("alpha", "q20260101000000_alpha").await?;

        let objects = store.objects("q20260101000000_alpha");

        assert!(!store.has_database("alpha"));
        assert_eq!(
            objects.first().map(|stored| stored.object.database.as_str()),
            Some("q20260101000000_alpha")
        );

        Ok(())
    }
}
