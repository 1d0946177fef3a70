/// Integration tests for orchestrator components
///
/// These tests verify end-to-end functionality of:
/// - Monitor creation, start, pause and delete against a real database
/// - Ownership checks on lifecycle operations
/// - Bootstrap reconciliation and shutdown
/// - Push monitors fed through `record_push`
use crate::database::models::{MonitorConfig, MonitorTag};
use crate::database::test_support::create_test_database;
use crate::database::{Database, DatabaseImpl};
use crate::error::EngineError;
use crate::incident::{IncidentCoordinator, IncidentSettings, SERVICE_TYPE_TAG};
use crate::incident::api::fake::RecordingIncidentApi;
use crate::monitoring::MonitoringExecutor;
use crate::monitoring::checker::{PushLedger, PushReport};
use crate::monitoring::scheduler::EngineContext;
use crate::monitoring::scheduler::test_support::{ScriptedProbe, Step, harness};
use crate::monitoring::types::{MonitorStatus, MonitorType};
use crate::notifier::fake::RecordingNotifier;
use crate::orchestrator::Orchestrator;
use crate::publisher::{BroadcastPublisher, MonitorEvent};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const OWNER: i64 = 1;
const STRANGER: i64 = 2;

struct TestEngine {
    _dir: TempDir,
    db: Arc<DatabaseImpl>,
    orchestrator: Arc<Orchestrator>,
    publisher: Arc<BroadcastPublisher>,
    probe: Arc<ScriptedProbe>,
}

/// Helper to create an orchestrator over a scripted probe
async fn create_test_engine(probe: ScriptedProbe) -> Result<TestEngine> {
    let (dir, db) = create_test_database().await?;
    let h = harness(db.clone(), probe);
    let orchestrator = Arc::new(Orchestrator::new(h.ctx.clone(), Arc::new(PushLedger::new())));

    Ok(TestEngine { _dir: dir, db, orchestrator, publisher: h.publisher, probe: h.probe })
}

fn http_config(name: &str) -> MonitorConfig {
    MonitorConfig::new(name, MonitorType::Http, "https://example.com")
}

async fn wait_for<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_create_monitor_starts_scheduler() -> Result<()> {
    let engine = create_test_engine(ScriptedProbe::default()).await?;
    let mut events = engine.publisher.subscribe();

    let created = engine.orchestrator.create_monitor(http_config("api"), OWNER).await?;
    assert!(created.id > 0);
    assert_eq!(created.push_token, None);
    assert!(engine.orchestrator.registry().is_running(created.id).await);

    let first = events.recv().await?;
    assert_eq!(first, MonitorEvent::MonitorUpdated { owner_id: OWNER, monitor_id: created.id });

    let db = engine.db.clone();
    assert!(wait_for(|| {
        let db = db.clone();
        async move { db.latest_heartbeat(created.id).await.ok().flatten().is_some() }
    })
    .await);

    engine.orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_create_monitor_applies_engine_default_timeout() -> Result<()> {
    let (_dir, db) = create_test_database().await?;
    let h = harness(db.clone(), ScriptedProbe::default());
    let orchestrator = Orchestrator::new(h.ctx.clone(), Arc::new(PushLedger::new())).with_default_timeout(7);

    let mut inherits = http_config("inherits");
    inherits.active = false;
    let inherits = orchestrator.create_monitor(inherits, OWNER).await?;
    assert_eq!(db.get_monitor(inherits.id).await?.map(|m| m.timeout_seconds), Some(7));

    let mut explicit = http_config("explicit");
    explicit.active = false;
    explicit.timeout_seconds = Some(12);
    let explicit = orchestrator.create_monitor(explicit, OWNER).await?;
    assert_eq!(db.get_monitor(explicit.id).await?.map(|m| m.timeout_seconds), Some(12));

    let config: MonitorConfig = serde_json::from_str(r#"{"name":"api","type":"http","target":"https://example.com"}"#)?;
    assert_eq!(config.timeout_seconds, None);
    Ok(())
}

#[tokio::test]
async fn test_create_monitor_rejects_invalid_config() -> Result<()> {
    let engine = create_test_engine(ScriptedProbe::default()).await?;

    let mut bad = http_config("api");
    bad.target = "not a url".to_string();
    let result = engine.orchestrator.create_monitor(bad, OWNER).await;
    assert!(matches!(result, Err(EngineError::Validation(_))));

    let mut too_fast = http_config("api");
    too_fast.interval_seconds = 1;
    assert!(matches!(
        engine.orchestrator.create_monitor(too_fast, OWNER).await,
        Err(EngineError::Validation(_))
    ));

    assert!(engine.db.get_active_monitors().await?.is_empty());
    assert!(engine.orchestrator.registry().is_empty().await);
    Ok(())
}

#[tokio::test]
async fn test_create_push_monitor_with_tags() -> Result<()> {
    let engine = create_test_engine(ScriptedProbe::default()).await?;

    let mut config = MonitorConfig::new("nightly job", MonitorType::Push, "");
    config.active = false;
    config.tags.push(MonitorTag { name: SERVICE_TYPE_TAG.to_string(), value: "Batch".to_string() });

    let created = engine.orchestrator.create_monitor(config, OWNER).await?;
    let token = created.push_token.expect("push token issued");
    assert_eq!(token.len(), 32);
    assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));

    // Inactive monitors are stored but not scheduled
    assert!(!engine.orchestrator.registry().is_running(created.id).await);
    assert_eq!(engine.db.get_monitor_tag(created.id, SERVICE_TYPE_TAG).await?.as_deref(), Some("Batch"));
    assert_eq!(engine.db.get_monitor_by_push_token(&token).await?.map(|m| m.id), Some(created.id));
    Ok(())
}

#[tokio::test]
async fn test_child_monitor_needs_owned_group_parent() -> Result<()> {
    let engine = create_test_engine(ScriptedProbe::default()).await?;

    let plain = engine.orchestrator.create_monitor(http_config("plain"), OWNER).await?;
    let mut child = http_config("child");
    child.parent_id = Some(plain.id);
    assert!(matches!(engine.orchestrator.create_monitor(child.clone(), OWNER).await, Err(EngineError::Validation(_))));

    let group = engine.orchestrator.create_monitor(MonitorConfig::new("all", MonitorType::Group, ""), OWNER).await?;
    child.parent_id = Some(group.id);
    assert!(matches!(
        engine.orchestrator.create_monitor(child.clone(), STRANGER).await,
        Err(EngineError::Ownership { .. })
    ));
    assert!(engine.orchestrator.create_monitor(child, OWNER).await.is_ok());

    engine.orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_lifecycle_operations_check_ownership() -> Result<()> {
    let engine = create_test_engine(ScriptedProbe::default()).await?;
    let created = engine.orchestrator.create_monitor(http_config("api"), OWNER).await?;

    assert!(matches!(
        engine.orchestrator.pause_monitor(STRANGER, created.id).await,
        Err(EngineError::Ownership { .. })
    ));
    assert!(matches!(
        engine.orchestrator.start_monitor(STRANGER, created.id).await,
        Err(EngineError::Ownership { .. })
    ));
    assert!(matches!(
        engine.orchestrator.delete_monitor(STRANGER, created.id).await,
        Err(EngineError::Ownership { .. })
    ));
    assert!(matches!(engine.orchestrator.start_monitor(OWNER, 9999).await, Err(EngineError::NotFound(9999))));

    // Nothing changed for the rightful owner
    assert!(engine.orchestrator.registry().is_running(created.id).await);
    assert!(engine.db.get_monitor(created.id).await?.is_some_and(|m| m.active));

    engine.orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_pause_and_resume_keep_flag_and_registry_in_step() -> Result<()> {
    let engine = create_test_engine(ScriptedProbe::default()).await?;
    let created = engine.orchestrator.create_monitor(http_config("api"), OWNER).await?;

    engine.orchestrator.pause_monitor(OWNER, created.id).await?;
    assert!(!engine.orchestrator.registry().is_running(created.id).await);
    assert!(engine.db.get_monitor(created.id).await?.is_some_and(|m| !m.active));

    // Pausing twice is harmless
    engine.orchestrator.pause_monitor(OWNER, created.id).await?;

    engine.orchestrator.start_monitor(OWNER, created.id).await?;
    engine.orchestrator.start_monitor(OWNER, created.id).await?;
    assert_eq!(engine.orchestrator.registry().running_ids().await, vec![created.id]);
    assert!(engine.db.get_monitor(created.id).await?.is_some_and(|m| m.active));

    engine.orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_start_and_pause_end_consistent() -> Result<()> {
    let engine = create_test_engine(ScriptedProbe::default()).await?;
    let created = engine.orchestrator.create_monitor(http_config("api"), OWNER).await?;

    let mut handles = Vec::new();
    for i in 0..10 {
        let orchestrator = engine.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                orchestrator.pause_monitor(OWNER, created.id).await
            } else {
                orchestrator.start_monitor(OWNER, created.id).await
            }
        }));
    }
    for handle in handles {
        handle.await??;
    }

    let active = engine.db.get_monitor(created.id).await?.is_some_and(|m| m.active);
    assert_eq!(engine.orchestrator.registry().is_running(created.id).await, active);
    assert!(engine.orchestrator.registry().len().await <= 1);

    engine.orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_delete_monitor_stops_and_removes() -> Result<()> {
    let engine = create_test_engine(ScriptedProbe::default()).await?;
    let created = engine.orchestrator.create_monitor(http_config("api"), OWNER).await?;

    engine.orchestrator.delete_monitor(OWNER, created.id).await?;
    assert!(!engine.orchestrator.registry().is_running(created.id).await);
    assert!(engine.db.get_monitor(created.id).await?.is_none());
    assert!(matches!(
        engine.orchestrator.delete_monitor(OWNER, created.id).await,
        Err(EngineError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_bootstrap_starts_only_active_monitors_once() -> Result<()> {
    let engine = create_test_engine(ScriptedProbe::default()).await?;

    // Rows written by a previous process
    let mut first = crate::database::models::Monitor::new(http_config("a"), OWNER);
    first.id = engine.db.insert_monitor(&first).await?;
    let mut second = crate::database::models::Monitor::new(http_config("b"), OWNER);
    second.id = engine.db.insert_monitor(&second).await?;
    let mut paused = crate::database::models::Monitor::new(http_config("c"), OWNER);
    paused.active = false;
    paused.id = engine.db.insert_monitor(&paused).await?;

    assert_eq!(engine.orchestrator.bootstrap().await?, 2);
    assert_eq!(engine.orchestrator.bootstrap().await?, 0);

    let mut expected = vec![first.id, second.id];
    expected.sort_unstable();
    assert_eq!(engine.orchestrator.registry().running_ids().await, expected);

    engine.orchestrator.shutdown().await;
    assert!(engine.orchestrator.registry().is_empty().await);
    Ok(())
}

#[tokio::test]
async fn test_shutdown_stops_publishing() -> Result<()> {
    let engine = create_test_engine(ScriptedProbe::default()).await?;
    let created = engine.orchestrator.create_monitor(http_config("api"), OWNER).await?;

    let probe = engine.probe.clone();
    assert!(wait_for(|| {
        let probe = probe.clone();
        async move { probe.calls() >= 1 }
    })
    .await);

    engine.orchestrator.shutdown().await;
    let mut events = engine.publisher.subscribe();
    let calls = engine.probe.calls();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(engine.probe.calls(), calls);
    assert!(!engine.orchestrator.registry().is_running(created.id).await);
    Ok(())
}

#[tokio::test]
async fn test_maintenance_survives_restart() -> Result<()> {
    let engine = create_test_engine(ScriptedProbe::new([Step::Down])).await?;
    let mut config = http_config("api");
    config.active = false;
    let created = engine.orchestrator.create_monitor(config, OWNER).await?;

    engine.orchestrator.set_maintenance(created.id, true).await?;
    engine.orchestrator.start_monitor(OWNER, created.id).await?;

    let db = engine.db.clone();
    assert!(wait_for(|| {
        let db = db.clone();
        async move { db.latest_heartbeat(created.id).await.ok().flatten().is_some() }
    })
    .await);

    let beat = engine.db.latest_heartbeat(created.id).await?.expect("beat");
    assert_eq!(beat.status, MonitorStatus::Maintenance);
    assert_eq!(engine.probe.calls(), 0);
    assert!(matches!(engine.orchestrator.set_maintenance(9999, true).await, Err(EngineError::NotFound(_))));

    engine.orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_manual_status_only_for_manual_monitors() -> Result<()> {
    let engine = create_test_engine(ScriptedProbe::default()).await?;
    let http = engine.orchestrator.create_monitor(http_config("api"), OWNER).await?;
    let mut manual_config = MonitorConfig::new("status board", MonitorType::Manual, "");
    manual_config.active = false;
    let manual = engine.orchestrator.create_monitor(manual_config, OWNER).await?;

    assert!(matches!(
        engine.orchestrator.set_manual_status(OWNER, http.id, Some(MonitorStatus::Down)).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine.orchestrator.set_manual_status(OWNER, manual.id, Some(MonitorStatus::Maintenance)).await,
        Err(EngineError::Validation(_))
    ));

    engine.orchestrator.set_manual_status(OWNER, manual.id, Some(MonitorStatus::Down)).await?;
    assert_eq!(engine.db.get_monitor(manual.id).await?.and_then(|m| m.manual_status), Some(MonitorStatus::Down));

    engine.orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_push_monitor_comes_up_after_push() -> Result<()> {
    let (_dir, db) = create_test_database().await?;
    let ledger = Arc::new(PushLedger::new());
    let publisher = Arc::new(BroadcastPublisher::new(64));
    let database: Arc<dyn Database> = db.clone();
    let ctx = Arc::new(EngineContext {
        database: database.clone(),
        probe: Arc::new(MonitoringExecutor::new(database.clone(), ledger.clone())?),
        incidents: Arc::new(IncidentCoordinator::new(
            database,
            Arc::new(RecordingIncidentApi::default()),
            IncidentSettings::default(),
        )),
        publisher: publisher.clone(),
        notifier: Arc::new(RecordingNotifier::default()),
        jitter: Duration::ZERO,
    });
    let orchestrator = Orchestrator::new(ctx, ledger);

    let mut config = MonitorConfig::new("cron", MonitorType::Push, "");
    config.active = false;
    let created = orchestrator.create_monitor(config, OWNER).await?;
    let token = created.push_token.clone().expect("token");

    assert!(matches!(
        orchestrator.record_push("wrong-token", PushReport::up()).await,
        Err(EngineError::UnknownPushToken)
    ));
    assert!(matches!(
        orchestrator.record_push(&token, PushReport::up()).await,
        Err(EngineError::InactiveMonitor(_))
    ));

    orchestrator.start_monitor(OWNER, created.id).await?;
    assert_eq!(orchestrator.record_push(&token, PushReport::up()).await?, created.id);

    // The first tick may have run before the push; restart to probe again
    orchestrator.start_monitor(OWNER, created.id).await?;
    let found_up = wait_for(|| {
        let db = db.clone();
        async move {
            db.latest_heartbeat(created.id).await.ok().flatten().is_some_and(|b| b.status == MonitorStatus::Up)
        }
    })
    .await;
    assert!(found_up);

    orchestrator.shutdown().await;
    Ok(())
}
