//! Primary store fixtures

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::{
    fixtures::{FixtureError, MemoryPrimaryStore, StoredObject, store::fake_scram_hash},
    identity::RoleName,
    secrets::SecretHash,
    store::{ObjectKind, ObjectRef},
};

/// Wrapper for a store in YAML
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreFixture {
    /// Map of role name -> role fixture
    #[serde(default)]
    pub roles: FxHashMap<String, RoleFixture>,

    /// Map of database name -> database fixture
    #[serde(default)]
    pub databases: FxHashMap<String, DatabaseFixture>,
}

/// Role fixture from YAML
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RoleFixture {
    /// Plaintext password, hashed with [`fake_scram_hash`]
    pub password: Option<String>,

    /// Literal secret hash; wins over `password`
    pub secret_hash: Option<String>,

    /// Whether the role can log in
    #[serde(default = "default_login")]
    pub login: bool,
}

fn default_login() -> bool {
    true
}

/// Database fixture from YAML
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseFixture {
    /// Owning role
    pub owner: String,

    /// Objects inside the database
    #[serde(default)]
    pub objects: Vec<ObjectFixture>,
}

/// Object reference within the same database
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectRefFixture {
    /// Object kind
    pub kind: ObjectKind,

    /// Schema; defaults to `public`
    pub schema: Option<String>,

    /// Object name
    pub name: String,

    /// Parent object, e.g. the table of a constraint
    pub parent: Option<String>,
}

impl ObjectRefFixture {
    fn into_ref(self, database: &str) -> ObjectRef {
        ObjectRef {
            kind: self.kind,
            database: database.to_string(),
            schema: Some(self.schema.unwrap_or_else(|| "public".to_string())),
            name: self.name,
            parent: self.parent,
        }
    }
}

/// Object fixture from YAML
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectFixture {
    /// Identity
    #[serde(flatten)]
    pub object: ObjectRefFixture,

    /// Owning role
    pub owner: String,

    /// Roles holding privileges
    #[serde(default)]
    pub grants: Vec<String>,

    /// Roles mentioned without ownership or a grant
    #[serde(default)]
    pub mentions: Vec<String>,

    /// Objects this one depends on
    #[serde(default)]
    pub depends_on: Vec<ObjectRefFixture>,

    /// Cannot be dropped or reassigned
    #[serde(default)]
    pub pinned: bool,
}

fn role_set(names: &[String]) -> Result<BTreeSet<RoleName>, FixtureError> {
    names
        .iter()
        .map(|name| RoleName::parse(name).map_err(FixtureError::from))
        .collect()
}

impl StoreFixture {
    /// Load into `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if a name or hash is invalid, a role has neither a password nor a
    /// hash, or an object is declared twice.
    pub fn apply(self, store: &MemoryPrimaryStore) -> Result<(), FixtureError> {
        for (name, role) in self.roles {
            let role_name = RoleName::parse(&name)?;

            let secret_hash = match (role.secret_hash, role.password) {
                (Some(hash), _) => SecretHash::parse(&hash)?,
                (None, Some(password)) => fake_scram_hash(&role_name, &password)?,
                (None, None) => return Err(FixtureError::MissingSecret(name)),
            };

            store.add_role(role_name, secret_hash, role.login);
        }

        for (name, database) in self.databases {
            store.add_database(name.clone(), RoleName::parse(&database.owner)?);

            for object in database.objects {
                store.add_object(StoredObject {
                    object: object.object.into_ref(&name),
                    owner: RoleName::parse(&object.owner)?,
                    grants: role_set(&object.grants)?,
                    mentions: role_set(&object.mentions)?,
                    depends_on: object
                        .depends_on
                        .into_iter()
                        .map(|dependency| dependency.into_ref(&name))
                        .collect(),
                    pinned: object.pinned,
                })?;
            }
        }

        Ok(())
    }
}
