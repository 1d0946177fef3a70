use futures::FutureExt;
use rand::Rng;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::checker::Probe;
use super::policy::{BeatState, Outcome, RetryPolicy};
use super::types::{Heartbeat, MonitorId, MonitorStatus, ProbeFailure};
use crate::database::Database;
use crate::database::models::Monitor;
use crate::error::{EngineError, EngineResult};
use crate::incident::IncidentCoordinator;
use crate::notifier::Notifier;
use crate::orchestrator::registry::MonitorRegistry;
use crate::publisher::Publisher;

/// Collaborators shared by every scheduler
pub struct EngineContext {
    pub database: Arc<dyn Database>,
    pub probe: Arc<dyn Probe>,
    pub incidents: Arc<IncidentCoordinator>,
    pub publisher: Arc<dyn Publisher>,
    pub notifier: Arc<dyn Notifier>,
    /// Upper bound of the random delay added to every sleep
    pub jitter: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Stopped,
    Running,
}

/// Probe-evaluate-sleep loop of a single monitor
pub struct MonitorScheduler {
    monitor: Monitor,
    policy: RetryPolicy,
    ctx: Arc<EngineContext>,
    registry: Arc<MonitorRegistry>,
    /// Held for a whole tick so beats of one monitor never interleave
    state: Mutex<BeatState>,
    stopped: AtomicBool,
    maintenance: AtomicBool,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorScheduler {
    fn new(monitor: Monitor, ctx: Arc<EngineContext>, registry: Arc<MonitorRegistry>, state: BeatState) -> Arc<Self> {
        let (stop_tx, _stop_rx) = watch::channel(false);
        Arc::new(Self {
            policy: RetryPolicy::from_monitor(&monitor),
            monitor,
            ctx,
            registry,
            state: Mutex::new(state),
            stopped: AtomicBool::new(false),
            maintenance: AtomicBool::new(false),
            stop_tx,
            task: Mutex::new(None),
        })
    }

    /// Register a scheduler for `monitor` and spawn its loop. The first probe
    /// runs immediately.
    pub async fn start(
        monitor: Monitor,
        ctx: Arc<EngineContext>,
        registry: Arc<MonitorRegistry>,
    ) -> EngineResult<Arc<Self>> {
        Self::start_with_maintenance(monitor, ctx, registry, false).await
    }

    /// Like [`start`](Self::start), with the maintenance flag set before the
    /// first tick
    pub async fn start_with_maintenance(
        monitor: Monitor,
        ctx: Arc<EngineContext>,
        registry: Arc<MonitorRegistry>,
        maintenance: bool,
    ) -> EngineResult<Arc<Self>> {
        if !monitor.active {
            return Err(EngineError::InactiveMonitor(monitor.id));
        }

        // Resume where the last run left off so a restart does not re-open
        // or re-notify a recorded outage
        let state = match ctx.database.latest_heartbeat(monitor.id).await? {
            Some(beat) => BeatState::resume(beat.status, beat.retries),
            None => BeatState::initial(),
        };

        let scheduler = Self::new(monitor, ctx, registry.clone(), state);
        scheduler.maintenance.store(maintenance, Ordering::SeqCst);
        registry.register(scheduler.clone()).await?;

        let handle = tokio::spawn(scheduler.clone().run());
        *scheduler.task.lock().await = Some(handle);

        info!(
            target: "uppe::audit",
            monitor_id = scheduler.monitor.id,
            monitor_type = %scheduler.monitor.monitor_type,
            interval_seconds = scheduler.monitor.interval_seconds,
            "Monitor scheduler started"
        );
        Ok(scheduler)
    }

    pub fn monitor_id(&self) -> MonitorId {
        self.monitor.id
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.is_stopped() { Lifecycle::Stopped } else { Lifecycle::Running }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Record MAINTENANCE beats instead of probing, from the next tick on
    pub fn set_maintenance(&self, enabled: bool) {
        let previous = self.maintenance.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!(target: "uppe::audit", monitor_id = self.monitor.id, enabled, "Maintenance toggled");
        }
    }

    pub fn in_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.ctx.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    async fn run(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();

        while !self.is_stopped() {
            let Some(delay) = self.tick().await else {
                break;
            };

            let sleep_for = delay + self.jitter();
            debug!(monitor_id = self.monitor.id, delay_ms = sleep_for.as_millis() as u64, "Next check scheduled");

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = stop_rx.changed() => {}
            }
        }

        debug!(monitor_id = self.monitor.id, "Monitor loop exited");
    }

    /// One probe-evaluate-record cycle. Returns the delay before the next
    /// cycle, or `None` once the scheduler has been stopped.
    pub async fn tick(&self) -> Option<Duration> {
        if self.is_stopped() {
            return None;
        }

        let mut state = self.state.lock().await;

        let (outcome, duration_ms, message) = if self.in_maintenance() {
            (Outcome::Maintenance, None, "Under maintenance".to_string())
        } else {
            let result = AssertUnwindSafe(self.ctx.probe.probe(&self.monitor))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!(monitor_id = self.monitor.id, "Probe panicked");
                    Err(ProbeFailure::new("Probe panicked"))
                });

            match result {
                Ok(report) => (Outcome::Success, report.latency_ms, report.message),
                Err(failure) => (Outcome::Failure, failure.latency_ms, failure.message),
            }
        };

        // Stopped while the probe was in flight
        if self.is_stopped() {
            debug!(monitor_id = self.monitor.id, "Discarding result of stopped monitor");
            return None;
        }

        let decision = self.policy.evaluate(&state, outcome);
        *state = decision.state();

        let mut heartbeat =
            Heartbeat::new(self.monitor.id, decision.status).with_message(message).with_duration(duration_ms);
        heartbeat.important = decision.important;
        heartbeat.retries = decision.retries;

        match self.ctx.database.save_heartbeat(&heartbeat).await {
            Ok(id) => heartbeat.id = Some(id),
            Err(e) => error!(monitor_id = self.monitor.id, error = %e, "Failed to persist heartbeat"),
        }

        self.ctx.publisher.publish_heartbeat(self.monitor.owner_id, &heartbeat);

        if decision.important {
            info!(
                monitor_id = self.monitor.id,
                status = %heartbeat.status,
                message = %heartbeat.message,
                "Monitor status changed"
            );
            match decision.status {
                MonitorStatus::Down => {
                    self.ctx.incidents.handle_down_transition(&self.monitor, &heartbeat).await;
                }
                MonitorStatus::Up => {
                    self.ctx.incidents.handle_up_transition(&self.monitor).await;
                }
                MonitorStatus::Pending | MonitorStatus::Maintenance => {}
            }
            self.ctx.notifier.notify_important(&self.monitor, &heartbeat);
        } else if decision.resend {
            self.ctx.notifier.notify_resend(&self.monitor, &heartbeat);
            self.ctx.incidents.refresh_incident(&self.monitor, &heartbeat).await;
        }

        Some(decision.next_delay)
    }

    /// Stop the loop and leave the registry. Safe to call more than once.
    pub async fn stop(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.stop_tx.send_replace(true);
        self.registry.deregister(self).await;

        info!(target: "uppe::audit", monitor_id = self.monitor.id, "Monitor scheduler stopped");
    }

    /// Wait for the loop task to finish, up to `timeout`
    pub async fn join(&self, timeout: Duration) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                debug!(monitor_id = self.monitor.id, "Monitor loop still busy after stop");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{Step, ScriptedProbe, harness};
    use super::*;
    use crate::database::models::MonitorConfig;
    use crate::database::test_support::create_test_database;
    use crate::monitoring::types::MonitorType;
    use crate::publisher::MonitorEvent;
    use anyhow::Result;

    async fn stored_monitor(db: &Arc<crate::database::DatabaseImpl>, configure: impl FnOnce(&mut MonitorConfig)) -> Result<Monitor> {
        let mut config = MonitorConfig::new("api", MonitorType::Http, "https://example.com");
        configure(&mut config);
        let mut monitor = Monitor::new(config, 1);
        monitor.id = db.insert_monitor(&monitor).await?;
        Ok(monitor)
    }

    fn idle(monitor: Monitor, ctx: Arc<EngineContext>) -> Arc<MonitorScheduler> {
        MonitorScheduler::new(monitor, ctx, Arc::new(MonitorRegistry::new()), BeatState::initial())
    }

    #[tokio::test]
    async fn retries_then_opens_one_incident_then_resolves_once() -> Result<()> {
        let (_dir, db) = create_test_database().await?;
        let monitor = stored_monitor(&db, |c| {
            c.interval_seconds = 60;
            c.retry_interval_seconds = 10;
            c.max_retries = 2;
        })
        .await?;
        let h = harness(db.clone(), ScriptedProbe::new([Step::Down, Step::Down, Step::Down, Step::Down, Step::Up, Step::Up]));
        let scheduler = idle(monitor.clone(), h.ctx.clone());

        assert_eq!(scheduler.tick().await, Some(Duration::from_secs(10)));
        assert_eq!(scheduler.tick().await, Some(Duration::from_secs(10)));
        assert_eq!(h.api.create_count(), 0);

        assert_eq!(scheduler.tick().await, Some(Duration::from_secs(60)));
        assert_eq!(h.api.create_count(), 1);

        assert_eq!(scheduler.tick().await, Some(Duration::from_secs(60)));
        assert_eq!(h.api.create_count(), 1);

        assert_eq!(scheduler.tick().await, Some(Duration::from_secs(60)));
        assert_eq!(h.api.update_count(), 1);
        assert_eq!(db.get_monitor(monitor.id).await?.and_then(|m| m.incident_id), None);

        // A second success in a row resolves nothing further
        assert_eq!(scheduler.tick().await, Some(Duration::from_secs(60)));
        assert_eq!(h.api.update_count(), 1);
        assert_eq!(h.api.create_count(), 1);

        let beats = db.recent_heartbeats(monitor.id, 10).await?;
        let statuses: Vec<_> = beats.iter().rev().map(|b| b.status).collect();
        assert_eq!(
            statuses,
            vec![
                MonitorStatus::Pending,
                MonitorStatus::Pending,
                MonitorStatus::Down,
                MonitorStatus::Down,
                MonitorStatus::Up,
                MonitorStatus::Up
            ]
        );
        let important: Vec<_> = beats.iter().rev().map(|b| b.important).collect();
        assert_eq!(important, vec![false, false, true, false, true, false]);
        assert_eq!(h.notifier.important.lock().unwrap().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn start_probes_immediately_and_rejects_double_start() -> Result<()> {
        let (_dir, db) = create_test_database().await?;
        let monitor = stored_monitor(&db, |_| {}).await?;
        let h = harness(db.clone(), ScriptedProbe::default());
        let registry = Arc::new(MonitorRegistry::new());
        let mut events = h.publisher.subscribe();

        let scheduler = MonitorScheduler::start(monitor.clone(), h.ctx.clone(), registry.clone()).await?;
        assert_eq!(scheduler.lifecycle(), Lifecycle::Running);

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv()).await??;
        assert!(matches!(event, MonitorEvent::Heartbeat { .. }));

        let second = MonitorScheduler::start(monitor.clone(), h.ctx.clone(), registry.clone()).await;
        assert!(matches!(second, Err(EngineError::DoubleStart(id)) if id == monitor.id));
        assert_eq!(registry.len().await, 1);

        scheduler.stop().await;
        scheduler.stop().await;
        assert_eq!(scheduler.lifecycle(), Lifecycle::Stopped);
        assert!(!registry.is_running(monitor.id).await);
        assert_eq!(scheduler.tick().await, None);
        Ok(())
    }

    #[tokio::test]
    async fn stale_scheduler_does_not_deregister_its_successor() -> Result<()> {
        let (_dir, db) = create_test_database().await?;
        let monitor = stored_monitor(&db, |_| {}).await?;
        let h = harness(db.clone(), ScriptedProbe::default());
        let registry = Arc::new(MonitorRegistry::new());

        let first = MonitorScheduler::start(monitor.clone(), h.ctx.clone(), registry.clone()).await?;
        first.stop().await;
        let second = MonitorScheduler::start(monitor.clone(), h.ctx.clone(), registry.clone()).await?;

        // A late deregister from the stopped instance must not evict the new one
        assert!(!registry.deregister(&first).await);
        assert!(registry.get(monitor.id).await.is_some_and(|s| Arc::ptr_eq(&s, &second)));

        second.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn inactive_monitor_is_not_started() -> Result<()> {
        let (_dir, db) = create_test_database().await?;
        let monitor = stored_monitor(&db, |c| c.active = false).await?;
        let h = harness(db.clone(), ScriptedProbe::default());
        let registry = Arc::new(MonitorRegistry::new());

        let result = MonitorScheduler::start(monitor.clone(), h.ctx.clone(), registry.clone()).await;
        assert!(matches!(result, Err(EngineError::InactiveMonitor(_))));
        assert!(registry.is_empty().await);
        assert_eq!(h.probe.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn in_flight_result_is_discarded_after_stop() -> Result<()> {
        let (_dir, db) = create_test_database().await?;
        let monitor = stored_monitor(&db, |_| {}).await?;
        let h = harness(db.clone(), ScriptedProbe::new([Step::Slow(Duration::from_millis(200), false)]));
        let registry = Arc::new(MonitorRegistry::new());
        let mut events = h.publisher.subscribe();

        let scheduler = MonitorScheduler::start(monitor.clone(), h.ctx.clone(), registry.clone()).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.probe.calls(), 1);

        scheduler.stop().await;
        scheduler.join(Duration::from_secs(2)).await;

        assert!(events.try_recv().is_err());
        assert!(db.latest_heartbeat(monitor.id).await?.is_none());
        assert_eq!(h.probe.calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn panicking_probe_becomes_a_failure() -> Result<()> {
        let (_dir, db) = create_test_database().await?;
        let monitor = stored_monitor(&db, |_| {}).await?;
        let h = harness(db.clone(), ScriptedProbe::new([Step::Panic]));
        let scheduler = idle(monitor.clone(), h.ctx.clone());

        assert_eq!(scheduler.tick().await, Some(Duration::from_secs(60)));
        let beat = db.latest_heartbeat(monitor.id).await?.expect("beat recorded");
        assert_eq!(beat.status, MonitorStatus::Down);
        assert_eq!(beat.message, "Probe panicked");

        // The next tick runs normally
        scheduler.tick().await;
        assert_eq!(db.latest_heartbeat(monitor.id).await?.map(|b| b.status), Some(MonitorStatus::Up));
        Ok(())
    }

    #[tokio::test]
    async fn maintenance_skips_probe_and_incidents() -> Result<()> {
        let (_dir, db) = create_test_database().await?;
        let monitor = stored_monitor(&db, |_| {}).await?;
        let h = harness(db.clone(), ScriptedProbe::new([Step::Down]));
        let scheduler = idle(monitor.clone(), h.ctx.clone());

        scheduler.set_maintenance(true);
        scheduler.tick().await;
        scheduler.tick().await;
        assert_eq!(h.probe.calls(), 0);

        let beats = db.recent_heartbeats(monitor.id, 10).await?;
        assert!(beats.iter().all(|b| b.status == MonitorStatus::Maintenance));
        assert_eq!(beats.iter().filter(|b| b.important).count(), 1);
        assert_eq!(h.api.create_count(), 0);

        scheduler.set_maintenance(false);
        scheduler.tick().await;
        assert_eq!(h.probe.calls(), 1);
        assert_eq!(db.latest_heartbeat(monitor.id).await?.map(|b| b.status), Some(MonitorStatus::Down));
        Ok(())
    }

    #[tokio::test]
    async fn restart_resumes_from_recorded_outage() -> Result<()> {
        let (_dir, db) = create_test_database().await?;
        let monitor = stored_monitor(&db, |_| {}).await?;
        let mut recorded = Heartbeat::new(monitor.id, MonitorStatus::Down);
        recorded.important = true;
        db.save_heartbeat(&recorded).await?;

        let h = harness(db.clone(), ScriptedProbe::new([Step::Slow(Duration::ZERO, false)]));
        let registry = Arc::new(MonitorRegistry::new());
        let scheduler = MonitorScheduler::start(monitor.clone(), h.ctx.clone(), registry.clone()).await?;

        let mut attempts = 0;
        while db.recent_heartbeats(monitor.id, 10).await?.len() < 2 && attempts < 100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            attempts += 1;
        }
        scheduler.stop().await;

        let latest = db.latest_heartbeat(monitor.id).await?.expect("new beat");
        assert_eq!(latest.status, MonitorStatus::Down);
        assert!(!latest.important);
        assert_eq!(h.api.create_count(), 0);
        assert!(h.notifier.important.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn resend_interval_renotifies_and_refreshes_incident() -> Result<()> {
        let (_dir, db) = create_test_database().await?;
        let monitor = stored_monitor(&db, |c| c.resend_interval = 2).await?;
        let h = harness(db.clone(), ScriptedProbe::new([Step::Down, Step::Down, Step::Down]));
        let scheduler = idle(monitor.clone(), h.ctx.clone());

        for _ in 0..3 {
            scheduler.tick().await;
        }

        assert_eq!(h.api.create_count(), 1);
        assert_eq!(h.notifier.resends.lock().unwrap().len(), 1);
        let update = h.api.last_update().expect("incident refreshed");
        assert_eq!(update.incident_status, crate::incident::api::IncidentStatus::Investigating);
        Ok(())
    }
}
