//! Fixtures
//!
//! In-memory collaborators for tests and local experiments, plus YAML fixture sets describing
//! primary store contents and credential cache files.

use std::{fs, path::PathBuf, sync::Arc};

use thiserror::Error;

use crate::{identity::NameError, secrets::SecretHashError, store::StoreError};

pub mod controller;
pub mod store;
pub mod stores;

pub use controller::RecordingController;
pub use store::{MemoryPrimaryStore, StoredObject, fake_scram_hash};
pub use stores::StoreFixture;

/// Fixture Parsing Errors
#[derive(Debug, Error)]
pub enum FixtureError {
    /// IO error reading fixture files
    #[error("Failed to read fixture file: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_norway::Error),

    /// Invalid role or tenant name
    #[error("Invalid name: {0}")]
    InvalidName(#[from] NameError),

    /// Invalid literal secret hash
    #[error("Invalid secret hash: {0}")]
    InvalidHash(#[from] SecretHashError),

    /// Role without password or hash
    #[error("Role {0} has neither a password nor a secret hash")]
    MissingSecret(String),

    /// Store rejected the fixture contents
    #[error("Failed to populate store: {0}")]
    Store(#[from] StoreError),

    /// No cache loaded
    #[error("No credential cache loaded")]
    NoCache,
}

/// Fixture
#[derive(Debug)]
pub struct Fixture {
    /// Base path for fixture files
    base_path: PathBuf,

    /// Store populated by [`Fixture::load_store`]
    store: Arc<MemoryPrimaryStore>,

    /// Raw credential cache contents
    cache: Option<String>,
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

impl Fixture {
    /// Create a new empty fixture with default base path
    pub fn new() -> Self {
        Self::with_base_path("./fixtures")
    }

    /// Create a new empty fixture with custom base path
    pub fn with_base_path(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            store: Arc::new(MemoryPrimaryStore::new()),
            cache: None,
        }
    }

    /// Load roles, databases and objects from `stores/{name}.yml`
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or its contents are invalid.
    pub fn load_store(&mut self, name: &str) -> Result<&mut Self, FixtureError> {
        let file_path = self.base_path.join("stores").join(format!("{name}.yml"));
        let contents = fs::read_to_string(&file_path)?;
        let fixture: StoreFixture = serde_norway::from_str(&contents)?;

        fixture.apply(&self.store)?;

        Ok(self)
    }

    /// Load raw credential cache contents from `caches/{name}.txt`
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn load_cache(&mut self, name: &str) -> Result<&mut Self, FixtureError> {
        let file_path = self.base_path.join("caches").join(format!("{name}.txt"));

        self.cache = Some(fs::read_to_string(&file_path)?);

        Ok(self)
    }

    /// Load a store fixture by name
    ///
    /// # Errors
    ///
    /// Returns an error if the store fixture cannot be loaded.
    pub fn from_set(name: &str) -> Result<Self, FixtureError> {
        let mut fixture = Self::new();

        fixture.load_store(name)?;

        Ok(fixture)
    }

    /// Shared handle to the store
    pub fn store(&self) -> Arc<MemoryPrimaryStore> {
        Arc::clone(&self.store)
    }

    /// Loaded cache contents
    ///
    /// # Errors
    ///
    /// Returns [`FixtureError::NoCache`] if no cache was loaded.
    pub fn cache(&self) -> Result<&str, FixtureError> {
        self.cache.as_deref().ok_or(FixtureError::NoCache)
    }
}
