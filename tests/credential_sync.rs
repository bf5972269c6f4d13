//! Credential cache synchronization against the in-memory primary store and a recording
//! pooler controller.

use std::{fs, sync::Arc};

use tempfile::TempDir;
use testresult::TestResult;

use tenantgate::{
    config::EngineConfig,
    credentials::{CacheDocument, EntryChange, ReloadOutcome, SyncAction},
    engine::Engine,
    errors::ErrorKind,
    fixtures::{Fixture, MemoryPrimaryStore, RecordingController, fake_scram_hash},
    identity::{RoleName, TenantId},
    process::{ProcessController, ProcessStatus},
    registry::MemberAccess,
    store::{PrimaryStore, StoreError},
};

struct Harness {
    _dir: TempDir,
    engine: Engine,
    store: Arc<MemoryPrimaryStore>,
    controller: Arc<RecordingController>,
}

impl Harness {
    fn new(controller: RecordingController) -> TestResult<Self> {
        let mut fixture = Fixture::new();
        fixture.load_store("platform")?;

        Self::from_fixture(&fixture, controller)
    }

    fn from_fixture(fixture: &Fixture, controller: RecordingController) -> TestResult<Self> {
        let dir = tempfile::tempdir()?;

        let mut config = EngineConfig::new(
            dir.path().join("hosts"),
            dir.path().join("userlist.txt"),
            "db.example.com",
        );
        config.retry_backoff_ms = 0;

        let store = fixture.store();
        let controller = Arc::new(controller);
        let engine = Engine::new(
            config,
            Arc::clone(&store) as Arc<dyn PrimaryStore>,
            Arc::clone(&controller) as Arc<dyn ProcessController>,
        )?;

        Ok(Self {
            _dir: dir,
            engine,
            store,
            controller,
        })
    }

    fn cache_contents(&self) -> TestResult<String> {
        Ok(self.engine.sync().cache().read()?.unwrap_or_default())
    }

    fn write_cache(&self, contents: &str) -> TestResult {
        fs::write(self.engine.sync().cache().path(), contents)?;

        Ok(())
    }
}

#[tokio::test]
async fn full_resync_is_idempotent() -> TestResult {
    let harness = Harness::new(RecordingController::new())?;

    let first = harness.engine.sync().full_resync().await?;

    assert_eq!(first.added, 2, "only login-capable roles are cached");
    assert!(first.written);
    assert_eq!(first.reload, Some(ReloadOutcome::Reloaded));

    let second = harness.engine.sync().full_resync().await?;

    assert!(!second.has_changes());
    assert!(!second.written);
    assert_eq!(second.unchanged, 2);
    assert_eq!(second.reload, None);
    assert_eq!(harness.controller.actions(), ["reload"]);

    let cache = CacheDocument::parse(&harness.cache_contents()?);

    assert!(cache.entry(&RoleName::parse("replicator")?).is_none());

    Ok(())
}

#[tokio::test]
async fn incremental_syncs_match_a_full_resync() -> TestResult {
    let harness = Harness::new(RecordingController::new())?;
    let lifecycle = harness.engine.lifecycle();
    let sync = harness.engine.sync();

    sync.full_resync().await?;

    let alpha = TenantId::parse("alpha")?;
    lifecycle.create_tenant(alpha.clone(), None, None).await?;
    lifecycle
        .create_tenant(TenantId::parse("beta")?, None, None)
        .await?;

    let reader = RoleName::parse("alpha_reader")?;
    lifecycle
        .add_member(&alpha, reader.clone(), MemberAccess::Readonly, None)
        .await?;
    lifecycle.rotate_password(&alpha, &reader, None).await?;
    lifecycle
        .add_member(
            &alpha,
            RoleName::parse("alpha_writer")?,
            MemberAccess::Full,
            None,
        )
        .await?;
    lifecycle.remove_member(&alpha, &reader).await?;

    assert_eq!(sync.verify()?.corrupt(), 0);

    let resync = sync.full_resync().await?;

    assert!(!resync.has_changes(), "{resync:?}");
    assert!(!resync.written, "incremental results are already canonical");

    Ok(())
}

#[tokio::test]
async fn out_of_band_password_changes_are_picked_up() -> TestResult {
    let harness = Harness::new(RecordingController::new())?;
    let reporting = RoleName::parse("reporting")?;

    harness.engine.sync().full_resync().await?;
    harness
        .store
        .set_secret_hash(&reporting, fake_scram_hash(&reporting, "rotated")?)?;

    let report = harness.engine.sync().full_resync().await?;

    assert_eq!(report.updated, 1);
    assert_eq!(report.unchanged, 1);

    let backup = report.backup.map(fs::read_to_string).transpose()?;

    assert!(backup.is_some_and(|contents| contents.contains("\"reporting\"")));

    Ok(())
}

#[tokio::test]
async fn sync_one_leaves_other_lines_alone() -> TestResult {
    let harness = Harness::new(RecordingController::new())?;
    let reporting = RoleName::parse("reporting")?;

    harness.write_cache(
        "# managed by hand\n\"legacy\" \"md5fedcba9876543210fedcba9876543210\"\n",
    )?;

    let report = harness
        .engine
        .sync()
        .sync_one(&reporting, SyncAction::Add)
        .await?;

    assert_eq!(report.change, EntryChange::Added);

    let contents = harness.cache_contents()?;

    assert!(contents.starts_with("# managed by hand\n"));
    assert!(contents.contains("\"legacy\""));
    assert!(contents.contains("\"reporting\""));

    let again = harness
        .engine
        .sync()
        .sync_one(&reporting, SyncAction::Update)
        .await?;

    assert_eq!(again.change, EntryChange::Unchanged);
    assert_eq!(again.reload, None);

    let deleted = harness
        .engine
        .sync()
        .sync_one(&RoleName::parse("replicator")?, SyncAction::Add)
        .await?;

    assert_eq!(
        deleted.change,
        EntryChange::Unchanged,
        "roles that cannot log in are never added"
    );

    Ok(())
}

#[tokio::test]
async fn sync_one_retires_malformed_lines_for_the_same_user() -> TestResult {
    let harness = Harness::new(RecordingController::new())?;
    let reporting = RoleName::parse("reporting")?;
    let stale = "md5aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    harness.write_cache(&format!(
        "\"legacy\" \"md5fedcba9876543210fedcba9876543210\"\n\"reporting\"  \"{stale}\"\n"
    ))?;

    let report = harness
        .engine
        .sync()
        .sync_one(&reporting, SyncAction::Update)
        .await?;

    assert_eq!(report.change, EntryChange::Updated);

    let current = harness
        .store
        .login_role(&reporting)
        .await?
        .ok_or("reporting cannot log in")?;
    let contents = harness.cache_contents()?;

    assert!(!contents.contains(stale), "stale hash for reporting still live");
    assert_eq!(
        contents.lines().filter(|line| line.contains("reporting")).count(),
        1
    );
    assert!(contents.contains(&format!(
        "\"reporting\" \"{}\"",
        current.secret_hash.as_str()
    )));

    harness.write_cache(&format!("{contents}reporting {stale}\n"))?;

    let deleted = harness
        .engine
        .sync()
        .sync_one(&reporting, SyncAction::Delete)
        .await?;

    assert_eq!(deleted.change, EntryChange::Removed);
    assert!(!harness.cache_contents()?.contains("reporting"));
    assert_eq!(harness.engine.sync().verify()?.corrupt(), 0);

    Ok(())
}

#[tokio::test]
async fn unambiguous_corruption_is_repaired_in_place() -> TestResult {
    let mut fixture = Fixture::from_set("platform")?;
    fixture.load_cache("corrupt")?;

    let harness = Harness::from_fixture(&fixture, RecordingController::new())?;
    let original = fixture.cache()?;

    harness.write_cache(original)?;

    let verified = harness.engine.sync().verify()?;

    assert_eq!(verified.corrupt(), 1);
    assert!(!verified.written);
    assert_eq!(harness.cache_contents()?, original, "verify never writes");

    let report = harness.engine.sync().verify_and_repair().await?;

    assert_eq!(report.repaired, 1);
    assert_eq!(report.quarantined, 0);
    assert!(report.written);

    let contents = harness.cache_contents()?;

    for untouched in original.lines().filter(|line| !line.contains("alpha_owner")) {
        assert!(contents.lines().any(|line| line == untouched), "{untouched}");
    }
    assert!(contents.contains("\"alpha_owner\" \"md50123456789abcdef0123456789abcdef\""));

    let backup = report.backup.map(fs::read_to_string).transpose()?;

    assert_eq!(backup.as_deref(), Some(original));
    assert_eq!(harness.engine.sync().verify()?.corrupt(), 0);

    Ok(())
}

#[tokio::test]
async fn ambiguous_corruption_is_quarantined() -> TestResult {
    let harness = Harness::new(RecordingController::new())?;
    let truncated = "\"alpha_owner\" \"md50123456789abc\"";

    harness.write_cache(&format!(
        "\"reporting\" \"md5fedcba9876543210fedcba9876543210\"\n{truncated}\n"
    ))?;

    let report = harness.engine.sync().verify_and_repair().await?;

    assert_eq!(report.quarantined, 1);
    assert!(!harness.cache_contents()?.contains("alpha_owner"));

    let quarantine = report.quarantine.map(fs::read_to_string).transpose()?;

    assert_eq!(quarantine, Some(format!("{truncated}\n")));

    let finding = report.findings.first().map(|finding| finding.line);

    assert_eq!(finding, Some(2));

    Ok(())
}

#[tokio::test]
async fn failed_reload_falls_back_to_restart() -> TestResult {
    let harness = Harness::new(RecordingController::without_reload())?;

    let report = harness.engine.sync().full_resync().await?;

    assert_eq!(report.reload, Some(ReloadOutcome::Restarted));
    assert_eq!(harness.controller.actions(), ["reload", "restart", "status"]);

    Ok(())
}

#[tokio::test]
async fn pooler_that_stays_down_fails_the_sync() -> TestResult {
    let harness = Harness::new(RecordingController::without_reload())?;

    harness.controller.set_status(ProcessStatus::Stopped);

    let result = harness.engine.sync().full_resync().await;

    assert_eq!(
        result.err().map(|error| error.kind()),
        Some(ErrorKind::SyncFailure)
    );
    assert!(
        !harness.cache_contents()?.is_empty(),
        "the written cache stays for the next start"
    );

    Ok(())
}

#[tokio::test]
async fn transient_store_failures_are_retried() -> TestResult {
    let harness = Harness::new(RecordingController::new())?;

    harness.store.fail_next(
        "list_login_roles",
        StoreError::Unavailable("connection reset".into()),
    );

    let report = harness.engine.sync().full_resync().await?;

    assert_eq!(report.added, 2);
    assert_eq!(
        harness
            .store
            .calls()
            .iter()
            .filter(|call| call.starts_with("list_login_roles"))
            .count(),
        2
    );

    Ok(())
}

#[tokio::test]
async fn permanent_store_failures_are_not_retried() -> TestResult {
    let harness = Harness::new(RecordingController::new())?;

    harness.store.fail_next(
        "list_login_roles",
        StoreError::Rejected("permission denied".into()),
    );

    let result = harness.engine.sync().full_resync().await;

    assert_eq!(
        result.err().map(|error| error.kind()),
        Some(ErrorKind::SyncFailure)
    );
    assert_eq!(harness.store.calls().len(), 1);
    assert!(harness.controller.actions().is_empty());

    Ok(())
}
