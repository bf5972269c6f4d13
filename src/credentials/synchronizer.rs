//! Credential synchronizer
//!
//! Keeps the pooling layer's credential cache consistent with the primary store. Every
//! mutating path is `lock → backup → atomic write → unlock → reload`; a failure before the
//! rename leaves the previous cache live.

use std::{fmt, path::PathBuf, str::FromStr, sync::Arc};

use rustc_hash::FxHashSet;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::EngineConfig,
    credentials::{
        cache::{CacheDocument, CacheEntry, EntryChange},
        errors::SyncError,
        file::CacheFile,
        repair::{self, Finding},
    },
    identity::RoleName,
    process::{ProcessController, ProcessStatus},
    registry::UnknownVariant,
    retry::RetryPolicy,
    store::PrimaryStore,
};

/// Incremental change requested for one username.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncAction {
    /// Role was created.
    Add,

    /// Role's secret changed.
    Update,

    /// Role was dropped or lost its login capability.
    Delete,
}

impl SyncAction {
    /// Canonical name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for SyncAction {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "add" => Ok(Self::Add),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(UnknownVariant::new("sync action", other)),
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the pooling layer picked up the new cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReloadOutcome {
    /// Graceful reload.
    Reloaded,

    /// Reload failed; the pooling layer was restarted.
    Restarted,
}

/// Result of a full resync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Entries present in the primary store but not in the cache.
    pub added: usize,

    /// Entries whose hash changed.
    pub updated: usize,

    /// Entries for roles that are gone or cannot log in.
    pub removed: usize,

    /// Entries already up to date.
    pub unchanged: usize,

    /// Malformed lines discarded by the rewrite.
    pub discarded_corrupt: usize,

    /// Whether the cache file was rewritten.
    pub written: bool,

    /// Backup taken before the rewrite.
    pub backup: Option<PathBuf>,

    /// How the pooling layer was signalled.
    pub reload: Option<ReloadOutcome>,
}

impl SyncReport {
    /// Whether the resync changed any entry.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.added + self.updated + self.removed > 0
    }
}

/// Result of an incremental sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOneReport {
    /// Username synced.
    pub username: RoleName,

    /// Requested action.
    pub action: SyncAction,

    /// Net effect on the cache.
    pub change: EntryChange,

    /// Backup taken before the rewrite.
    pub backup: Option<PathBuf>,

    /// How the pooling layer was signalled.
    pub reload: Option<ReloadOutcome>,
}

/// Result of a verification, with or without repair.
///
/// Findings name lines and usernames only; secret hashes never appear here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// Lines checked.
    pub lines: usize,

    /// Per-line findings.
    pub findings: Vec<Finding>,

    /// Lines corrected in place.
    pub repaired: usize,

    /// Lines moved to quarantine.
    pub quarantined: usize,

    /// Exact duplicates dropped.
    pub duplicates_dropped: usize,

    /// Whether the cache file was rewritten.
    pub written: bool,

    /// Backup taken before the rewrite.
    pub backup: Option<PathBuf>,

    /// File holding the quarantined lines.
    pub quarantine: Option<PathBuf>,

    /// How the pooling layer was signalled.
    pub reload: Option<ReloadOutcome>,
}

impl RepairReport {
    /// Number of lines that did not match the grammar.
    #[must_use]
    pub fn corrupt(&self) -> usize {
        self.findings.len()
    }
}

/// Synchronizes the credential cache with the primary store.
pub struct CredentialSynchronizer {
    cache: CacheFile,
    store: Arc<dyn PrimaryStore>,
    controller: Arc<dyn ProcessController>,
    retry: RetryPolicy,
    writer: Mutex<()>,
}

impl fmt::Debug for CredentialSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSynchronizer")
            .field("cache", &self.cache)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl CredentialSynchronizer {
    /// Synchronizer for the cache described by `config`.
    #[must_use]
    pub fn new(
        config: &EngineConfig,
        store: Arc<dyn PrimaryStore>,
        controller: Arc<dyn ProcessController>,
    ) -> Self {
        Self {
            cache: CacheFile::from_config(config),
            store,
            controller,
            retry: config.retry_policy(),
            writer: Mutex::new(()),
        }
    }

    /// Cache file this synchronizer writes.
    #[must_use]
    pub const fn cache(&self) -> &CacheFile {
        &self.cache
    }

    /// Rebuild the whole cache from the primary store.
    ///
    /// The write and the reload are skipped when the cache already holds exactly the desired
    /// content, so a second resync without store changes touches nothing.
    ///
    /// # Errors
    ///
    /// Returns a [`SyncError`] when the store cannot be read, the cache cannot be written or
    /// the pooling layer does not pick up the new cache.
    pub async fn full_resync(&self) -> Result<SyncReport, SyncError> {
        let _writer = self.writer.lock().await;

        let roles = self
            .retry
            .run("list login roles", || self.store.list_login_roles())
            .await
            .map_err(SyncError::Store)?;

        let lock = self.cache.lock(&self.retry).await?;
        let current_contents = self.cache.read()?;
        let current = CacheDocument::parse(current_contents.as_deref().unwrap_or_default());

        let desired = CacheDocument::from_entries(roles.into_iter().map(|role| CacheEntry {
            username: role.name,
            secret_hash: role.secret_hash,
        }));

        let mut report = diff(&current, &desired);
        let rendered = desired.render();

        if current_contents.as_deref() == Some(rendered.as_str()) {
            debug!("credential cache already up to date");

            return Ok(report);
        }

        let backup = self
            .write(current_contents.as_deref().unwrap_or_default(), &rendered)
            .await?;

        drop(lock);

        report.written = true;
        report.backup = Some(backup);
        report.reload = Some(self.signal_reload().await?);

        info!(
            added = report.added,
            updated = report.updated,
            removed = report.removed,
            unchanged = report.unchanged,
            discarded_corrupt = report.discarded_corrupt,
            "credential cache resynced"
        );

        Ok(report)
    }

    /// Converge the single entry for `username` to the primary store.
    ///
    /// `Add` and `Update` look the role up; a role that no longer exists or cannot log in is
    /// removed. Every other line of the cache is left as it is.
    ///
    /// # Errors
    ///
    /// Returns a [`SyncError`] as [`Self::full_resync`] does.
    pub async fn sync_one(
        &self,
        username: &RoleName,
        action: SyncAction,
    ) -> Result<SyncOneReport, SyncError> {
        let _writer = self.writer.lock().await;

        let desired = match action {
            SyncAction::Add | SyncAction::Update => self
                .retry
                .run("look up login role", || self.store.login_role(username))
                .await
                .map_err(SyncError::Store)?,
            SyncAction::Delete => None,
        };

        let lock = self.cache.lock(&self.retry).await?;
        let current_contents = self.cache.read()?.unwrap_or_default();
        let mut document = CacheDocument::parse(&current_contents);

        let change = match desired {
            Some(role) => document.upsert(CacheEntry {
                username: role.name,
                secret_hash: role.secret_hash,
            }),
            None => document.remove(username),
        };

        let mut report = SyncOneReport {
            username: username.clone(),
            action,
            change,
            backup: None,
            reload: None,
        };

        if change == EntryChange::Unchanged {
            debug!(%username, %action, "credential cache entry already up to date");

            return Ok(report);
        }

        report.backup = Some(self.write(&current_contents, &document.render()).await?);

        drop(lock);

        report.reload = Some(self.signal_reload().await?);

        info!(%username, %action, ?change, "credential cache entry synced");

        Ok(report)
    }

    /// Check every cache line against the grammar without writing anything.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Cache`] when the cache cannot be read.
    pub fn verify(&self) -> Result<RepairReport, SyncError> {
        let contents = self.cache.read()?.unwrap_or_default();
        let inspection = repair::inspect(&contents);

        Ok(RepairReport {
            lines: contents.lines().count(),
            repaired: inspection.repaired_count(),
            quarantined: inspection.quarantined_count(),
            duplicates_dropped: inspection.duplicates_dropped(),
            findings: inspection.findings,
            ..RepairReport::default()
        })
    }

    /// Repair unambiguous corruption in place and quarantine the rest.
    ///
    /// Quarantined lines are written next to the backup and dropped from the live cache.
    ///
    /// # Errors
    ///
    /// Returns a [`SyncError`] when the cache cannot be rewritten or reloaded.
    pub async fn verify_and_repair(&self) -> Result<RepairReport, SyncError> {
        let _writer = self.writer.lock().await;

        let lock = self.cache.lock(&self.retry).await?;
        let contents = self.cache.read()?.unwrap_or_default();
        let inspection = repair::inspect(&contents);

        let mut report = RepairReport {
            lines: contents.lines().count(),
            repaired: inspection.repaired_count(),
            quarantined: inspection.quarantined_count(),
            duplicates_dropped: inspection.duplicates_dropped(),
            findings: inspection.findings,
            ..RepairReport::default()
        };

        if report.findings.is_empty() {
            debug!("credential cache is clean");

            return Ok(report);
        }

        for finding in &report.findings {
            warn!(
                line = finding.line,
                username = finding.username.as_deref().unwrap_or("?"),
                action = ?finding.action,
                "corrupt credential cache entry"
            );
        }

        let backup = self.cache.backup(&contents)?;

        if !inspection.quarantined_lines.is_empty() {
            report.quarantine = Some(
                self.cache
                    .write_quarantine(&backup, &inspection.quarantined_lines)?,
            );
        }

        self.cache
            .write_with_retry(&inspection.document.render(), &self.retry)
            .await
            .map_err(SyncError::Write)?;

        drop(lock);

        report.written = true;
        report.backup = Some(backup);
        report.reload = Some(self.signal_reload().await?);

        info!(
            repaired = report.repaired,
            quarantined = report.quarantined,
            duplicates_dropped = report.duplicates_dropped,
            "credential cache repaired"
        );

        Ok(report)
    }

    async fn write(&self, previous: &str, next: &str) -> Result<PathBuf, SyncError> {
        let backup = self.cache.backup(previous)?;

        self.cache
            .write_with_retry(next, &self.retry)
            .await
            .map_err(SyncError::Write)?;

        Ok(backup)
    }

    async fn signal_reload(&self) -> Result<ReloadOutcome, SyncError> {
        match self
            .retry
            .run("reload pooling layer", || self.controller.reload())
            .await
        {
            Ok(()) => {
                debug!("pooling layer reloaded");

                return Ok(ReloadOutcome::Reloaded);
            }
            Err(error) => {
                warn!(error = %error.inner(), "reload failed, restarting pooling layer");
            }
        }

        self.retry
            .run("restart pooling layer", || self.controller.restart())
            .await
            .map_err(|error| SyncError::Reload(error.into_inner()))?;

        let status = self
            .retry
            .run("pooling layer status", || self.controller.status())
            .await
            .map_err(|error| SyncError::Reload(error.into_inner()))?;

        if status != ProcessStatus::Running {
            return Err(SyncError::NotRunning(status));
        }

        info!("pooling layer restarted");

        Ok(ReloadOutcome::Restarted)
    }
}

fn diff(current: &CacheDocument, desired: &CacheDocument) -> SyncReport {
    let mut report = SyncReport {
        discarded_corrupt: current.unparsed_count(),
        ..SyncReport::default()
    };

    for entry in desired.entries() {
        match current.entry(&entry.username) {
            None => report.added += 1,
            Some(existing) if existing.secret_hash != entry.secret_hash => report.updated += 1,
            Some(_) => report.unchanged += 1,
        }
    }

    let mut seen = FxHashSet::default();

    report.removed = current
        .entries()
        .filter(|entry| seen.insert(&entry.username))
        .filter(|entry| desired.entry(&entry.username).is_none())
        .count();

    report
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use mockall::predicate::eq;
    use testresult::TestResult;

    use super::*;
    use crate::{
        credentials::cache::tests::entry,
        process::{ControllerError, MockProcessController},
        secrets::{
            SecretHash,
            tests::{MD5_HASH, scram_hash},
        },
        store::{LoginRole, MockPrimaryStore, StoreError},
    };

    fn config(dir: &Path) -> EngineConfig {
        let mut config =
            EngineConfig::new(dir.join("hosts"), dir.join("userlist.txt"), "example.com");

        config.retry_backoff_ms = 0;
        config.retry_limit = 2;

        config
    }

    fn login(name: &str, hash: &str) -> TestResult<LoginRole> {
        Ok(LoginRole {
            name: RoleName::parse(name)?,
            secret_hash: SecretHash::parse(hash)?,
        })
    }

    fn reloading_controller() -> MockProcessController {
        let mut controller = MockProcessController::new();

        controller.expect_reload().returning(|| Ok(()));

        controller
    }

    #[tokio::test]
    async fn full_resync_is_idempotent() -> TestResult {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        let roles = vec![login("alice", MD5_HASH)?, login("bob", &scram_hash())?];

        let mut store = MockPrimaryStore::new();
        store
            .expect_list_login_roles()
            .times(2)
            .returning(move || Ok(roles.clone()));

        let mut controller = MockProcessController::new();
        controller.expect_reload().times(1).returning(|| Ok(()));

        let sync = CredentialSynchronizer::new(&config, Arc::new(store), Arc::new(controller));

        let first = sync.full_resync().await?;

        assert_eq!((first.added, first.updated, first.removed), (2, 0, 0));
        assert!(first.written);
        assert_eq!(first.reload, Some(ReloadOutcome::Reloaded));

        let second = sync.full_resync().await?;

        assert!(!second.has_changes());
        assert_eq!(second.unchanged, 2);
        assert!(!second.written);

        Ok(())
    }

    #[tokio::test]
    async fn full_resync_counts_each_kind_of_change() -> TestResult {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());

        fs::write(
            &config.cache_path,
            CacheDocument::from_entries([
                entry("alice", MD5_HASH)?,
                entry("carol", MD5_HASH)?,
                entry("dave", MD5_HASH)?,
            ])
            .render()
                + "garbage\n",
        )?;

        let roles = vec![
            login("alice", MD5_HASH)?,
            login("bob", MD5_HASH)?,
            login("carol", &scram_hash())?,
        ];

        let mut store = MockPrimaryStore::new();
        store
            .expect_list_login_roles()
            .returning(move || Ok(roles.clone()));

        let sync = CredentialSynchronizer::new(
            &config,
            Arc::new(store),
            Arc::new(reloading_controller()),
        );

        let report = sync.full_resync().await?;

        assert_eq!(report.added, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.discarded_corrupt, 1);

        let backup = report.backup.ok_or("missing backup")?;

        assert!(fs::read_to_string(backup)?.contains("garbage"));
        assert!(!fs::read_to_string(&config.cache_path)?.contains("dave"));

        Ok(())
    }

    #[tokio::test]
    async fn store_outage_leaves_cache_untouched() -> TestResult {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        let original = CacheDocument::from_entries([entry("alice", MD5_HASH)?]).render();

        fs::write(&config.cache_path, &original)?;

        let mut store = MockPrimaryStore::new();
        store
            .expect_list_login_roles()
            .times(2)
            .returning(|| Err(StoreError::Unavailable("connection refused".into())));

        let sync = CredentialSynchronizer::new(
            &config,
            Arc::new(store),
            Arc::new(MockProcessController::new()),
        );

        let result = sync.full_resync().await;

        assert!(matches!(result, Err(SyncError::Store(_))));
        assert_eq!(fs::read_to_string(&config.cache_path)?, original);

        Ok(())
    }

    #[tokio::test]
    async fn sync_one_touches_only_its_entry() -> TestResult {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());

        fs::write(
            &config.cache_path,
            format!(";; managed\n\"alice\" \"{MD5_HASH}\"\n\"carol\" \"{MD5_HASH}\"\n"),
        )?;

        let bob = login("bob", &scram_hash())?;

        let mut store = MockPrimaryStore::new();
        store
            .expect_login_role()
            .with(eq(RoleName::parse("bob")?))
            .returning(move |_| Ok(Some(bob.clone())));

        let sync = CredentialSynchronizer::new(
            &config,
            Arc::new(store),
            Arc::new(reloading_controller()),
        );

        let report = sync
            .sync_one(&RoleName::parse("bob")?, SyncAction::Add)
            .await?;

        assert_eq!(report.change, EntryChange::Added);
        assert_eq!(
            fs::read_to_string(&config.cache_path)?,
            format!(
                ";; managed\n\"alice\" \"{MD5_HASH}\"\n\"bob\" \"{}\"\n\"carol\" \"{MD5_HASH}\"\n",
                scram_hash()
            )
        );

        let again = sync
            .sync_one(&RoleName::parse("bob")?, SyncAction::Update)
            .await?;

        assert_eq!(again.change, EntryChange::Unchanged);
        assert_eq!(again.backup, None);

        Ok(())
    }

    #[tokio::test]
    async fn update_for_missing_role_removes_entry() -> TestResult {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());

        fs::write(
            &config.cache_path,
            CacheDocument::from_entries([entry("alice", MD5_HASH)?]).render(),
        )?;

        let mut store = MockPrimaryStore::new();
        store.expect_login_role().returning(|_| Ok(None));

        let sync = CredentialSynchronizer::new(
            &config,
            Arc::new(store),
            Arc::new(reloading_controller()),
        );

        let report = sync
            .sync_one(&RoleName::parse("alice")?, SyncAction::Update)
            .await?;

        assert_eq!(report.change, EntryChange::Removed);
        assert_eq!(fs::read_to_string(&config.cache_path)?, "");

        Ok(())
    }

    #[tokio::test]
    async fn failed_reload_falls_back_to_restart() -> TestResult {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());

        let mut controller = MockProcessController::new();
        controller
            .expect_reload()
            .returning(|| Err(ControllerError::Unsupported("reload")));
        controller.expect_restart().times(1).returning(|| Ok(()));
        controller
            .expect_status()
            .returning(|| Ok(ProcessStatus::Running));

        let sync = CredentialSynchronizer::new(
            &config,
            Arc::new(MockPrimaryStore::new()),
            Arc::new(controller),
        );

        let report = sync
            .sync_one(&RoleName::parse("alice")?, SyncAction::Delete)
            .await;

        // Nothing to delete, so nothing to reload either.
        assert_eq!(report?.reload, None);

        fs::write(
            &config.cache_path,
            CacheDocument::from_entries([entry("alice", MD5_HASH)?]).render(),
        )?;

        let report = sync
            .sync_one(&RoleName::parse("alice")?, SyncAction::Delete)
            .await?;

        assert_eq!(report.reload, Some(ReloadOutcome::Restarted));

        Ok(())
    }

    #[tokio::test]
    async fn stopped_pooler_after_restart_is_a_sync_failure() -> TestResult {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());

        fs::write(
            &config.cache_path,
            CacheDocument::from_entries([entry("alice", MD5_HASH)?]).render(),
        )?;

        let mut controller = MockProcessController::new();
        controller.expect_reload().returning(|| {
            Err(ControllerError::Failed {
                action: "reload",
                detail: "exit status 1".to_string(),
            })
        });
        controller.expect_restart().returning(|| Ok(()));
        controller
            .expect_status()
            .returning(|| Ok(ProcessStatus::Stopped));

        let sync = CredentialSynchronizer::new(
            &config,
            Arc::new(MockPrimaryStore::new()),
            Arc::new(controller),
        );

        let result = sync
            .sync_one(&RoleName::parse("alice")?, SyncAction::Delete)
            .await;

        assert!(matches!(
            result,
            Err(SyncError::NotRunning(ProcessStatus::Stopped))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn repair_fixes_whitespace_and_quarantines_truncated_hash() -> TestResult {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        let scram = scram_hash();
        let (head, tail) = scram.split_once('$').ok_or("no separator")?;
        let truncated = MD5_HASH.trim_end_matches("00");

        fs::write(
            &config.cache_path,
            format!(
                "\"alice\" \"{MD5_HASH}\"\n\"bob\" \"{head}$  {tail}\"\n\"carol\" \"{truncated}\"\n"
            ),
        )?;

        let sync = CredentialSynchronizer::new(
            &config,
            Arc::new(MockPrimaryStore::new()),
            Arc::new(reloading_controller()),
        );

        let verified = sync.verify()?;

        assert_eq!(verified.corrupt(), 2);
        assert!(!verified.written);

        let report = sync.verify_and_repair().await?;

        assert_eq!(report.repaired, 1);
        assert_eq!(report.quarantined, 1);
        assert_eq!(
            fs::read_to_string(&config.cache_path)?,
            format!("\"alice\" \"{MD5_HASH}\"\n\"bob\" \"{scram}\"\n")
        );

        let quarantine = report.quarantine.clone().ok_or("missing quarantine file")?;

        assert!(fs::read_to_string(quarantine)?.contains("carol"));
        assert_eq!(sync.verify()?.corrupt(), 0);

        let rendered = serde_norway::to_string(&report)?;

        assert!(!rendered.contains("c0ffee"));

        Ok(())
    }
}
