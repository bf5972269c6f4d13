//! Tenant teardown.

use std::{collections::BTreeSet, future::Future};

use jiff::Timestamp;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    credentials::SyncAction,
    identity::{RoleName, TenantId},
    lifecycle::{
        AbortHandle, LifecycleError, LifecycleManager,
        tiers::{self, TierOutcome},
    },
    registry::{TeardownMode, TeardownStage, Tenant, TenantStatus},
    retry::RetryError,
    store::{Dependency, ObjectRef, StoreError},
};

/// How a teardown ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum DestroyOutcome {
    /// Every trace of the tenant was removed.
    Clean {
        /// Tier that resolved the role dependencies; `None` when resuming at finalization.
        resolved_by: Option<TeardownStage>,
    },

    /// Data that could not be removed safely was renamed and kept.
    Quarantined {
        /// New names of the quarantined objects or database.
        quarantined: Vec<String>,
    },
}

/// Result of [`LifecycleManager::destroy_tenant`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestroyReport {
    /// Tenant id.
    pub tenant: TenantId,

    /// Teardown mode in effect.
    pub mode: TeardownMode,

    /// Stage an earlier, interrupted teardown had reached.
    pub resumed_from: Option<TeardownStage>,

    /// Final outcome.
    pub outcome: DestroyOutcome,
}

impl LifecycleManager {
    /// Destroy a tenant.
    ///
    /// Marks the tenant tearing down (which removes its hostname mapping), escalates through
    /// the teardown tiers until its roles are unreferenced, then removes cache entries, the
    /// database (in [`TeardownMode::DropData`]), the roles and finally the registry record.
    /// When no tier resolves the dependencies, the blocking objects or the whole database are
    /// renamed instead and the tenant ends destroyed-quarantined.
    ///
    /// Calling this again on a tenant that is still tearing down resumes from its recorded
    /// stage, keeping the mode it was started with.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Aborted`] when `abort` fires between steps; the tenant stays
    /// tearing down. Store, registry and sync failures leave it tearing down as well.
    pub async fn destroy_tenant(
        &self,
        id: &TenantId,
        mode: TeardownMode,
        abort: &AbortHandle,
    ) -> Result<DestroyReport, LifecycleError> {
        let guard = self.locks.acquire(id).await?;

        let mut tenant = self
            .registry_call("read tenant", || self.registry.get(id))
            .await?;

        let (mode, mut stage, resumed_from) = match tenant.status {
            TenantStatus::Live => (mode, TeardownStage::OwnershipTransfer, None),
            TenantStatus::TearingDown {
                mode: recorded,
                stage,
            } => {
                if recorded != mode {
                    warn!(
                        tenant = %id,
                        %recorded,
                        requested = %mode,
                        "resuming with the recorded teardown mode"
                    );
                }

                info!(tenant = %id, %stage, "resuming teardown");

                (recorded, stage, Some(stage))
            }
            TenantStatus::DestroyedQuarantined { .. } => {
                return Err(LifecycleError::AlreadyQuarantined(id.clone()));
            }
        };

        if resumed_from.is_none() {
            info!(tenant = %id, %mode, "starting teardown");

            self.record_stage(&mut tenant, mode, stage).await?;
        }

        let mut resolved_by = None;

        while tiers::is_resolving_tier(stage) {
            check_abort(abort, id, stage)?;

            let outcome = self.run_tier(&tenant, stage, abort).await?;
            let next = tiers::next_stage(stage, outcome);

            info!(tenant = %id, tier = %stage, ?outcome, %next, "teardown tier finished");

            if outcome == TierOutcome::Resolved {
                resolved_by = Some(stage);
            }

            stage = next;

            self.record_stage(&mut tenant, mode, stage).await?;
        }

        let outcome = if stage == TeardownStage::Quarantine {
            DestroyOutcome::Quarantined {
                quarantined: self.quarantine(&mut tenant).await?,
            }
        } else {
            self.finalize(&tenant, mode).await?;
            self.locks.release_file(id, &guard);

            DestroyOutcome::Clean { resolved_by }
        };

        Ok(DestroyReport {
            tenant: id.clone(),
            mode,
            resumed_from,
            outcome,
        })
    }

    async fn record_stage(
        &self,
        tenant: &mut Tenant,
        mode: TeardownMode,
        stage: TeardownStage,
    ) -> Result<(), LifecycleError> {
        tenant.status = TenantStatus::TearingDown { mode, stage };

        self.registry_call("record teardown stage", || {
            self.registry.put(tenant.clone())
        })
        .await
    }

    async fn run_tier(
        &self,
        tenant: &Tenant,
        stage: TeardownStage,
        abort: &AbortHandle,
    ) -> Result<TierOutcome, LifecycleError> {
        let database = tenant.id.as_str();

        for role in tenant.roles() {
            let blocked = match stage {
                TeardownStage::OwnershipTransfer => match self
                    .tier_step("reassign owned objects", || {
                        self.store
                            .reassign_owned(database, &role, &self.admin_role)
                    })
                    .await?
                {
                    Some(outcome) => Some(outcome),
                    None => {
                        self.tier_step("revoke grants", || {
                            self.store.revoke_grants(database, &role)
                        })
                        .await?
                    }
                },
                TeardownStage::CascadingDropOwned => {
                    self.tier_step("drop owned objects", || {
                        self.store.drop_owned_cascade(database, &role)
                    })
                    .await?
                }
                TeardownStage::DependencyWalk => {
                    self.walk_dependencies(tenant, &role, abort).await?
                }
                TeardownStage::Quarantine | TeardownStage::Finalize => None,
            };

            if let Some(outcome) = blocked {
                return Ok(outcome);
            }
        }

        if self.remaining_dependencies(tenant).await?.is_empty() {
            Ok(TierOutcome::Resolved)
        } else {
            Ok(TierOutcome::StillReferenced)
        }
    }

    /// Clear one role's dependencies one at a time, then retry the cascading drop.
    async fn walk_dependencies(
        &self,
        tenant: &Tenant,
        role: &RoleName,
        abort: &AbortHandle,
    ) -> Result<Option<TierOutcome>, LifecycleError> {
        let database = tenant.id.as_str();

        let dependencies = self
            .store_call("enumerate dependencies", || {
                self.store.dependencies(database, role)
            })
            .await?;

        let order = match tiers::clearing_order(&dependencies) {
            Ok(order) => order,
            Err(cycle) => {
                warn!(tenant = %tenant.id, %role, %cycle, "dependencies form a cycle");

                return Ok(Some(TierOutcome::Irrecoverable));
            }
        };

        for dependency in order {
            check_abort(abort, &tenant.id, TeardownStage::DependencyWalk)?;

            if let Some(outcome) = self
                .tier_step("clear dependency", || {
                    self.store.clear_dependency(dependency)
                })
                .await?
            {
                warn!(
                    tenant = %tenant.id,
                    object = %dependency.object,
                    ?outcome,
                    "dependency not cleared"
                );

                return Ok(Some(outcome));
            }

            debug!(
                tenant = %tenant.id,
                object = %dependency.object,
                kind = ?dependency.kind,
                "cleared dependency"
            );
        }

        check_abort(abort, &tenant.id, TeardownStage::DependencyWalk)?;

        self.tier_step("drop owned objects", || {
            self.store.drop_owned_cascade(database, role)
        })
        .await
    }

    /// Run one store call of a tier; `Some` when it was blocked by a dependency.
    async fn tier_step<F, Fut>(
        &self,
        operation: &'static str,
        call: F,
    ) -> Result<Option<TierOutcome>, LifecycleError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), StoreError>>,
    {
        match self.retry.run(operation, call).await.map_err(RetryError::into_inner) {
            Ok(()) | Err(StoreError::Missing(_)) => Ok(None),
            Err(StoreError::DependentObjects { role, detail }) => {
                debug!(operation, %role, %detail, "still referenced");

                Ok(Some(TierOutcome::StillReferenced))
            }
            Err(StoreError::Irrecoverable { object, detail }) => {
                warn!(operation, %object, %detail, "irrecoverable dependency");

                Ok(Some(TierOutcome::Irrecoverable))
            }
            Err(source) => Err(LifecycleError::Store { operation, source }),
        }
    }

    async fn remaining_dependencies(
        &self,
        tenant: &Tenant,
    ) -> Result<Vec<Dependency>, LifecycleError> {
        let database = tenant.id.as_str();
        let mut remaining = Vec::new();

        for role in tenant.roles() {
            match self
                .retry
                .run("enumerate dependencies", || {
                    self.store.dependencies(database, &role)
                })
                .await
                .map_err(RetryError::into_inner)
            {
                Ok(dependencies) => remaining.extend(dependencies),
                Err(StoreError::Missing(_)) => {}
                Err(source) => {
                    return Err(LifecycleError::Store {
                        operation: "enumerate dependencies",
                        source,
                    });
                }
            }
        }

        Ok(remaining)
    }

    /// Rename what could not be removed, lock the roles out and mark the tenant quarantined.
    async fn quarantine(&self, tenant: &mut Tenant) -> Result<Vec<String>, LifecycleError> {
        let stamp = Timestamp::now().strftime("%Y%m%d%H%M%S").to_string();

        let blockers: BTreeSet<ObjectRef> = self
            .remaining_dependencies(tenant)
            .await?
            .into_iter()
            .map(|dependency| dependency.object)
            .collect();

        let mut quarantined = Vec::new();
        let mut whole_database =
            blockers.is_empty() || blockers.iter().any(|object| !object.kind.is_renamable());

        if !whole_database {
            for object in &blockers {
                let name = tiers::quarantine_name(&stamp, &object.name);

                match self
                    .retry
                    .run("rename object", || self.store.rename_object(object, &name))
                    .await
                {
                    Ok(()) => {
                        warn!(tenant = %tenant.id, %object, %name, "quarantined object");

                        quarantined.push(name);
                    }
                    Err(error) => {
                        warn!(
                            tenant = %tenant.id,
                            %object,
                            error = %error.inner(),
                            "failed to rename object, quarantining the database"
                        );

                        whole_database = true;

                        break;
                    }
                }
            }
        }

        if whole_database {
            let name = tiers::quarantine_name(&stamp, tenant.id.as_str());

            self.retry
                .run("rename database", || {
                    self.store.rename_database(tenant.id.as_str(), &name)
                })
                .await
                .map_err(|error| LifecycleError::QuarantineFailed {
                    tenant: tenant.id.clone(),
                    source: error.into_inner(),
                })?;

            warn!(tenant = %tenant.id, %name, "quarantined database");

            quarantined.push(name);
        }

        for role in tenant.roles() {
            match self
                .retry
                .run("disable login", || self.store.disable_login(&role))
                .await
                .map_err(RetryError::into_inner)
            {
                Ok(()) | Err(StoreError::Missing(_)) => {}
                Err(source) => {
                    return Err(LifecycleError::Store {
                        operation: "disable login",
                        source,
                    });
                }
            }

            self.sync_role(&role, SyncAction::Delete).await?;
        }

        tenant.status = TenantStatus::DestroyedQuarantined {
            quarantined: quarantined.clone(),
        };

        self.registry_call("record quarantine", || self.registry.put(tenant.clone()))
            .await?;

        warn!(
            tenant = %tenant.id,
            ?quarantined,
            "tenant destroyed-quarantined, data kept under quarantine names"
        );

        Ok(quarantined)
    }

    /// Remove cache entries, data, roles and finally the registry record.
    async fn finalize(&self, tenant: &Tenant, mode: TeardownMode) -> Result<(), LifecycleError> {
        let roles = tenant.roles();

        for role in &roles {
            self.sync_role(role, SyncAction::Delete).await?;
        }

        if mode == TeardownMode::DropData {
            self.store_call("drop database", || {
                self.store.drop_database(tenant.id.as_str())
            })
            .await?;
        }

        for role in &roles {
            self.store_call("drop role", || self.store.drop_role(role))
                .await?;
        }

        self.registry_call("delete tenant record", || self.registry.delete(&tenant.id))
            .await?;

        info!(tenant = %tenant.id, %mode, "tenant destroyed");

        Ok(())
    }
}

fn check_abort(
    abort: &AbortHandle,
    tenant: &TenantId,
    stage: TeardownStage,
) -> Result<(), LifecycleError> {
    if abort.is_aborted() {
        warn!(%tenant, %stage, "teardown aborted");

        return Err(LifecycleError::Aborted {
            tenant: tenant.clone(),
            stage,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use testresult::TestResult;

    use super::*;
    use crate::{
        config::EngineConfig,
        credentials::CredentialSynchronizer,
        identity::{RoleName, Subdomain},
        process::MockProcessController,
        registry::TenantRegistry,
        store::{DependencyKind, MockPrimaryStore, ObjectKind},
    };

    fn setup(
        dir: &std::path::Path,
        store: MockPrimaryStore,
    ) -> TestResult<(LifecycleManager, Arc<TenantRegistry>)> {
        let mut config =
            EngineConfig::new(dir.join("hosts"), dir.join("userlist.txt"), "db.example.com");
        config.retry_backoff_ms = 0;

        let registry = Arc::new(TenantRegistry::from_config(&config));
        let store: Arc<dyn crate::store::PrimaryStore> = Arc::new(store);
        let mut controller = MockProcessController::new();
        controller.expect_reload().returning(|| Ok(()));

        let sync = Arc::new(CredentialSynchronizer::new(
            &config,
            Arc::clone(&store),
            Arc::new(controller),
        ));

        registry.put(Tenant::new(TenantId::parse("alpha")?, Subdomain::parse("alpha")?))?;

        Ok((
            LifecycleManager::new(&config, Arc::clone(&registry), store, sync)?,
            registry,
        ))
    }

    fn blocking_dependency() -> TestResult<Dependency> {
        Ok(Dependency {
            role: RoleName::parse("alpha_owner")?,
            kind: DependencyKind::AclEntry,
            object: ObjectRef {
                kind: ObjectKind::Table,
                database: "alpha".to_string(),
                schema: Some("public".to_string()),
                name: "orders".to_string(),
                parent: None,
            },
            requires: Vec::new(),
        })
    }

    #[tokio::test]
    async fn first_successful_tier_stops_escalation() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut store = MockPrimaryStore::new();

        store.expect_reassign_owned().times(1).returning(|_, _, _| Ok(()));
        store.expect_revoke_grants().times(1).returning(|_, _| Ok(()));
        store.expect_dependencies().returning(|_, _| Ok(Vec::new()));
        store.expect_drop_owned_cascade().never();
        store.expect_drop_database().never();
        store.expect_drop_role().times(1).returning(|_| Ok(()));

        let (manager, registry) = setup(dir.path(), store)?;
        let id = TenantId::parse("alpha")?;

        let report = manager
            .destroy_tenant(&id, TeardownMode::ReassignOwnership, &AbortHandle::new())
            .await?;

        assert_eq!(
            report.outcome,
            DestroyOutcome::Clean {
                resolved_by: Some(TeardownStage::OwnershipTransfer)
            }
        );
        assert!(registry.get(&id).is_err());

        Ok(())
    }

    #[tokio::test]
    async fn abort_leaves_tenant_tearing_down_and_resume_continues() -> TestResult {
        let dir = tempfile::tempdir()?;
        let dependency = blocking_dependency()?;
        let abort = AbortHandle::new();
        let trigger = abort.clone();

        let mut store = MockPrimaryStore::new();

        store.expect_reassign_owned().times(1).returning(|_, _, _| Ok(()));
        store.expect_revoke_grants().times(1).returning(|_, _| Ok(()));
        store.expect_drop_owned_cascade().returning(|_, _| Ok(()));
        store
            .expect_dependencies()
            .times(3)
            .returning(move |_, _| Ok(vec![dependency.clone()]));
        store.expect_clear_dependency().returning(move |_| {
            trigger.abort();
            Ok(())
        });

        let (manager, registry) = setup(dir.path(), store)?;
        let id = TenantId::parse("alpha")?;

        let result = manager
            .destroy_tenant(&id, TeardownMode::DropData, &abort)
            .await;

        assert!(matches!(
            result,
            Err(LifecycleError::Aborted {
                stage: TeardownStage::DependencyWalk,
                ..
            })
        ));
        assert_eq!(
            registry.get(&id)?.status,
            TenantStatus::TearingDown {
                mode: TeardownMode::DropData,
                stage: TeardownStage::DependencyWalk,
            }
        );
        assert!(registry.snapshot()?.get(&id).and_then(Tenant::mapping).is_none());

        Ok(())
    }
}
