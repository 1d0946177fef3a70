/// Orchestrator module - coordinates all components
///
/// The orchestrator is the core coordinator that:
/// - Owns the monitor registry and the collaborators every scheduler shares
/// - Exposes the lifecycle operations the HTTP layer calls
/// - Reconciles running schedulers with the persisted `active` flags on boot

pub mod registry;

#[cfg(test)]
mod tests;

pub use registry::MonitorRegistry;

use anyhow::Result;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::database::models::{DEFAULT_TIMEOUT_SECONDS, Monitor, MonitorConfig};
use crate::database::{Database, DatabaseImpl, initialize_database};
use crate::error::{EngineError, EngineResult};
use crate::incident::{HttpIncidentApi, IncidentCoordinator, IncidentSettings};
use crate::monitoring::checker::{PushLedger, PushReport};
use crate::monitoring::scheduler::{EngineContext, MonitorScheduler};
use crate::monitoring::types::{MonitorId, MonitorStatus, MonitorType};
use crate::monitoring::validation::validate_monitor_config;
use crate::monitoring::MonitoringExecutor;
use crate::notifier::LogNotifier;
use crate::pool::LibsqlPool;
use crate::publisher::BroadcastPublisher;

const PUSH_TOKEN_LENGTH: usize = 32;

/// How long shutdown waits for each loop to wind down
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Returned by [`Orchestrator::create_monitor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedMonitor {
    pub id: MonitorId,
    pub push_token: Option<String>,
}

fn generate_push_token() -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(PUSH_TOKEN_LENGTH).map(char::from).collect()
}

/// Main orchestrator for the monitor engine
pub struct Orchestrator {
    database: Arc<dyn Database>,
    ctx: Arc<EngineContext>,
    registry: Arc<MonitorRegistry>,
    push_ledger: Arc<PushLedger>,
    /// Monitors in maintenance; survives scheduler restarts
    maintenance: RwLock<HashSet<MonitorId>>,
    default_timeout_seconds: u64,
}

impl Orchestrator {
    pub fn new(ctx: Arc<EngineContext>, push_ledger: Arc<PushLedger>) -> Self {
        Self {
            database: ctx.database.clone(),
            ctx,
            registry: Arc::new(MonitorRegistry::new()),
            push_ledger,
            maintenance: RwLock::new(HashSet::new()),
            default_timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }

    pub fn with_default_timeout(mut self, seconds: u64) -> Self {
        self.default_timeout_seconds = seconds;
        self
    }

    /// Build the production stack from configuration: migrated database,
    /// HTTP incident client, protocol checkers, broadcast publisher
    pub async fn from_config(config: &Config, pool: LibsqlPool) -> Result<(Self, Arc<BroadcastPublisher>)> {
        let conn = pool.get().await?;
        info!("Initializing database schema...");
        initialize_database(&conn).await?;
        drop(conn);

        let database: Arc<dyn Database> = Arc::new(DatabaseImpl::new_from_pool(pool));

        let api = HttpIncidentApi::new(
            config.incident.endpoint.clone(),
            Duration::from_secs(config.incident.timeout_seconds),
        )?;
        if config.incident.endpoint.is_none() {
            info!("Incident API not configured, incidents will not be raised");
        }
        let incidents = Arc::new(IncidentCoordinator::new(
            database.clone(),
            Arc::new(api),
            IncidentSettings {
                region: config.incident.region.clone(),
                updated_by: config.incident.updated_by.clone(),
                default_service_type: config.incident.default_service_type.clone(),
            },
        ));

        let push_ledger = Arc::new(PushLedger::new());
        let executor = MonitoringExecutor::new(database.clone(), push_ledger.clone())?;
        let publisher = Arc::new(BroadcastPublisher::new(config.publisher.channel_capacity));

        let ctx = Arc::new(EngineContext {
            database,
            probe: Arc::new(executor),
            incidents,
            publisher: publisher.clone(),
            notifier: Arc::new(LogNotifier),
            jitter: Duration::from_millis(config.scheduler.jitter_ms),
        });

        let orchestrator =
            Self::new(ctx, push_ledger).with_default_timeout(config.scheduler.default_timeout_seconds);
        Ok((orchestrator, publisher))
    }

    pub fn registry(&self) -> &Arc<MonitorRegistry> {
        &self.registry
    }

    /// Load a monitor and check that `owner_id` owns it
    async fn owned_monitor(&self, owner_id: i64, monitor_id: MonitorId) -> EngineResult<Monitor> {
        let monitor = self.database.get_monitor(monitor_id).await?.ok_or(EngineError::NotFound(monitor_id))?;

        if monitor.owner_id != owner_id {
            warn!(target: "uppe::audit", monitor_id, owner_id, "Rejected operation on foreign monitor");
            return Err(EngineError::Ownership { monitor_id, owner_id });
        }

        Ok(monitor)
    }

    async fn in_maintenance(&self, monitor_id: MonitorId) -> bool {
        self.maintenance.read().await.contains(&monitor_id)
    }

    /// Stop whatever runs for the monitor and start a scheduler on the
    /// stored row. Caller holds the monitor's lifecycle lock.
    async fn restart_locked(&self, monitor_id: MonitorId) -> EngineResult<Arc<MonitorScheduler>> {
        if let Some(existing) = self.registry.get(monitor_id).await {
            existing.stop().await;
        }

        let monitor = self.database.get_monitor(monitor_id).await?.ok_or(EngineError::NotFound(monitor_id))?;
        let maintenance = self.in_maintenance(monitor_id).await;

        MonitorScheduler::start_with_maintenance(monitor, self.ctx.clone(), self.registry.clone(), maintenance).await
    }

    /// Validate and store a new monitor, starting it when active
    pub async fn create_monitor(&self, mut config: MonitorConfig, owner_id: i64) -> EngineResult<CreatedMonitor> {
        config.timeout_seconds.get_or_insert(self.default_timeout_seconds);

        validate_monitor_config(&config).map_err(|e| EngineError::Validation(e.to_string()))?;

        if let Some(parent_id) = config.parent_id {
            let parent = self
                .owned_monitor(owner_id, parent_id)
                .await
                .map_err(|e| match e {
                    EngineError::NotFound(id) => EngineError::Validation(format!("parent monitor {id} not found")),
                    other => other,
                })?;
            if parent.monitor_type != MonitorType::Group {
                return Err(EngineError::Validation(format!("parent monitor {parent_id} is not a group")));
            }
        }

        let tags = std::mem::take(&mut config.tags);
        let mut monitor = Monitor::new(config, owner_id);
        if monitor.monitor_type == MonitorType::Push {
            monitor.push_token = Some(generate_push_token());
        }

        monitor.id = self.database.insert_monitor(&monitor).await?;

        for tag in &tags {
            self.database.save_monitor_tag(monitor.id, &tag.name, &tag.value).await?;
        }

        info!(
            target: "uppe::audit",
            monitor_id = monitor.id,
            owner_id,
            monitor_type = %monitor.monitor_type,
            "Monitor created"
        );
        self.ctx.publisher.publish_monitor_update(owner_id, monitor.id);

        if monitor.active {
            let _guard = self.registry.lock_monitor(monitor.id).await;
            let maintenance = self.in_maintenance(monitor.id).await;
            MonitorScheduler::start_with_maintenance(monitor.clone(), self.ctx.clone(), self.registry.clone(), maintenance)
                .await?;
        }

        Ok(CreatedMonitor { id: monitor.id, push_token: monitor.push_token })
    }

    /// Activate a monitor and (re)start its scheduler on the stored row
    pub async fn start_monitor(&self, owner_id: i64, monitor_id: MonitorId) -> EngineResult<()> {
        let _guard = self.registry.lock_monitor(monitor_id).await;
        self.owned_monitor(owner_id, monitor_id).await?;

        self.database.set_monitor_active(monitor_id, true).await?;
        self.restart_locked(monitor_id).await?;

        info!(target: "uppe::audit", monitor_id, owner_id, "Monitor resumed");
        self.ctx.publisher.publish_monitor_update(owner_id, monitor_id);
        Ok(())
    }

    /// Deactivate a monitor and stop its scheduler
    pub async fn pause_monitor(&self, owner_id: i64, monitor_id: MonitorId) -> EngineResult<()> {
        let _guard = self.registry.lock_monitor(monitor_id).await;
        self.owned_monitor(owner_id, monitor_id).await?;

        self.database.set_monitor_active(monitor_id, false).await?;
        if let Some(scheduler) = self.registry.get(monitor_id).await {
            scheduler.stop().await;
        }

        info!(target: "uppe::audit", monitor_id, owner_id, "Monitor paused");
        self.ctx.publisher.publish_monitor_update(owner_id, monitor_id);
        Ok(())
    }

    /// Stop and delete a monitor. Its heartbeats stay for history.
    pub async fn delete_monitor(&self, owner_id: i64, monitor_id: MonitorId) -> EngineResult<()> {
        let guard = self.registry.lock_monitor(monitor_id).await;
        self.owned_monitor(owner_id, monitor_id).await?;

        if let Some(scheduler) = self.registry.get(monitor_id).await {
            scheduler.stop().await;
        }
        self.database.delete_monitor(monitor_id).await?;

        self.push_ledger.forget(monitor_id).await;
        self.maintenance.write().await.remove(&monitor_id);
        self.ctx.incidents.forget(monitor_id).await;
        drop(guard);
        self.registry.forget_lock(monitor_id).await;

        info!(target: "uppe::audit", monitor_id, owner_id, "Monitor deleted");
        self.ctx.publisher.publish_monitor_update(owner_id, monitor_id);
        Ok(())
    }

    /// Toggle maintenance mode. Takes effect on the monitor's next tick.
    pub async fn set_maintenance(&self, monitor_id: MonitorId, enabled: bool) -> EngineResult<()> {
        let monitor = self.database.get_monitor(monitor_id).await?.ok_or(EngineError::NotFound(monitor_id))?;

        {
            let mut maintenance = self.maintenance.write().await;
            if enabled {
                maintenance.insert(monitor_id);
            } else {
                maintenance.remove(&monitor_id);
            }
        }

        if let Some(scheduler) = self.registry.get(monitor_id).await {
            scheduler.set_maintenance(enabled);
        }

        self.ctx.publisher.publish_monitor_update(monitor.owner_id, monitor_id);
        Ok(())
    }

    /// Set the status of a manual monitor; `None` clears it
    pub async fn set_manual_status(
        &self,
        owner_id: i64,
        monitor_id: MonitorId,
        status: Option<MonitorStatus>,
    ) -> EngineResult<()> {
        let monitor = self.owned_monitor(owner_id, monitor_id).await?;

        if monitor.monitor_type != MonitorType::Manual {
            return Err(EngineError::Validation(format!("monitor {monitor_id} is not a manual monitor")));
        }
        if status == Some(MonitorStatus::Maintenance) {
            return Err(EngineError::Validation("use maintenance mode instead of a manual status".into()));
        }

        self.database.set_manual_status(monitor_id, status).await?;
        info!(target: "uppe::audit", monitor_id, owner_id, status = ?status, "Manual status set");
        self.ctx.publisher.publish_monitor_update(owner_id, monitor_id);
        Ok(())
    }

    /// Accept a push from a monitored service
    pub async fn record_push(&self, token: &str, report: PushReport) -> EngineResult<MonitorId> {
        let monitor =
            self.database.get_monitor_by_push_token(token).await?.ok_or(EngineError::UnknownPushToken)?;

        if monitor.monitor_type != MonitorType::Push {
            return Err(EngineError::Validation(format!("monitor {} does not accept pushes", monitor.id)));
        }
        if !monitor.active {
            return Err(EngineError::InactiveMonitor(monitor.id));
        }

        debug!(monitor_id = monitor.id, ok = report.ok, "Push received");
        self.push_ledger.record(monitor.id, report).await;
        Ok(monitor.id)
    }

    /// Start a scheduler for every active monitor that is not running yet.
    /// Returns how many were started.
    pub async fn bootstrap(&self) -> EngineResult<usize> {
        let monitors = self.database.get_active_monitors().await?;
        info!("Loading {} active monitors", monitors.len());

        let mut started = 0;
        for monitor in monitors {
            let monitor_id = monitor.id;
            let _guard = self.registry.lock_monitor(monitor_id).await;

            if self.registry.is_running(monitor_id).await {
                continue;
            }

            let maintenance = self.in_maintenance(monitor_id).await;
            match MonitorScheduler::start_with_maintenance(monitor, self.ctx.clone(), self.registry.clone(), maintenance)
                .await
            {
                Ok(_) => started += 1,
                Err(e) => error!(monitor_id, error = %e, "Failed to start monitor"),
            }
        }

        info!(started, running = self.registry.len().await, "Monitor bootstrap complete");
        Ok(started)
    }

    /// Stop every scheduler and wait briefly for the loops to finish
    pub async fn shutdown(&self) {
        let schedulers = self.registry.all().await;
        info!("Stopping {} monitors...", schedulers.len());

        for scheduler in &schedulers {
            scheduler.stop().await;
        }
        for scheduler in &schedulers {
            scheduler.join(SHUTDOWN_GRACE).await;
        }

        info!("All monitors stopped");
    }
}
