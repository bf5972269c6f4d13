//! Engine wiring
//!
//! [`Engine`] builds the four components from one [`EngineConfig`] and the two external
//! collaborators, sharing a single registry handle between the gate and the lifecycle manager.

use std::sync::Arc;

use tracing::debug;

use crate::{
    config::{ConfigError, EngineConfig},
    credentials::CredentialSynchronizer,
    gate::AccessGate,
    lifecycle::LifecycleManager,
    process::ProcessController,
    registry::TenantRegistry,
    store::PrimaryStore,
};

/// The assembled engine.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    registry: Arc<TenantRegistry>,
    gate: AccessGate,
    sync: Arc<CredentialSynchronizer>,
    lifecycle: LifecycleManager,
}

impl Engine {
    /// Validate `config` and wire every component to `store` and `controller`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the configuration is invalid.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn PrimaryStore>,
        controller: Arc<dyn ProcessController>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let registry = Arc::new(TenantRegistry::from_config(&config));
        let gate = AccessGate::new(Arc::clone(&registry), &config);
        let sync = Arc::new(CredentialSynchronizer::new(
            &config,
            Arc::clone(&store),
            controller,
        ));
        let lifecycle =
            LifecycleManager::new(&config, Arc::clone(&registry), store, Arc::clone(&sync))?;

        debug!(
            registry = %config.registry_path.display(),
            cache = %config.cache_path.display(),
            root_identity = %config.root_identity,
            "engine ready"
        );

        Ok(Self {
            config,
            registry,
            gate,
            sync,
            lifecycle,
        })
    }

    /// Configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Tenant registry.
    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    /// Access gate.
    pub fn gate(&self) -> &AccessGate {
        &self.gate
    }

    /// Credential synchronizer.
    pub fn sync(&self) -> &CredentialSynchronizer {
        &self.sync
    }

    /// Tenant lifecycle manager.
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;
    use crate::{process::MockProcessController, store::MockPrimaryStore};

    #[test]
    fn invalid_configuration_is_rejected() {
        let mut config = EngineConfig::new("hosts", "userlist.txt", "db.example.com");
        config.admin_role = "bad role".to_string();

        let result = Engine::new(
            config,
            Arc::new(MockPrimaryStore::new()),
            Arc::new(MockProcessController::new()),
        );

        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn components_share_the_registry_file() -> TestResult {
        let dir = tempfile::tempdir()?;
        let config = EngineConfig::new(
            dir.path().join("hosts"),
            dir.path().join("userlist.txt"),
            "db.example.com",
        );

        let engine = Engine::new(
            config,
            Arc::new(MockPrimaryStore::new()),
            Arc::new(MockProcessController::new()),
        )?;

        assert_eq!(engine.registry().path(), dir.path().join("hosts"));
        assert_eq!(engine.sync().cache().path(), dir.path().join("userlist.txt"));

        Ok(())
    }
}
