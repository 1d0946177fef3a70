/// Incident coordination
///
/// Opens an incident in the external incident system when a monitor goes
/// DOWN and resolves it when the monitor recovers. The monitor's own
/// `incident_id` is the deduplication key: at most one incident is open per
/// monitor, no matter how many DOWN beats arrive.

pub mod api;

pub use api::{HttpIncidentApi, IncidentApi, IncidentApiError, IncidentRequest};

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use self::api::{IncidentImpact, IncidentStatus};
use crate::database::Database;
use crate::database::models::{Incident, Monitor};
use crate::monitoring::types::{Heartbeat, MonitorId};

/// Tag whose value is forwarded as `serviceType`
pub const SERVICE_TYPE_TAG: &str = "ServiceType";

/// Static values sent with every incident request
#[derive(Debug, Clone)]
pub struct IncidentSettings {
    pub region: String,
    pub updated_by: String,
    pub default_service_type: String,
}

impl Default for IncidentSettings {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            updated_by: "uppe@system".to_string(),
            default_service_type: "General".to_string(),
        }
    }
}

/// What a coordinator call ended up doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncidentAction {
    Opened(String),
    AlreadyOpen(String),
    Resolved(String),
    Refreshed(String),
    /// Recovery or refresh with no incident on record
    NothingOpen,
    /// No incident endpoint configured, or the monitor is gone
    Skipped,
    /// The call failed; state was left untouched for a later attempt
    Failed,
}

pub struct IncidentCoordinator {
    database: Arc<dyn Database>,
    api: Arc<dyn IncidentApi>,
    settings: IncidentSettings,
    /// Serializes open/resolve per monitor
    locks: Mutex<HashMap<MonitorId, Arc<Mutex<()>>>>,
    /// Resolutions confirmed by the incident system but not yet recorded
    /// locally, retried before the monitor's next incident action
    unrecorded_resolutions: Mutex<HashMap<MonitorId, String>>,
}

impl IncidentCoordinator {
    pub fn new(database: Arc<dyn Database>, api: Arc<dyn IncidentApi>, settings: IncidentSettings) -> Self {
        Self {
            database,
            api,
            settings,
            locks: Mutex::new(HashMap::new()),
            unrecorded_resolutions: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, monitor_id: MonitorId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(monitor_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Forget the state of a deleted monitor. A lock still held or awaited
    /// elsewhere stays in place.
    pub async fn forget(&self, monitor_id: MonitorId) {
        self.unrecorded_resolutions.lock().await.remove(&monitor_id);

        let mut locks = self.locks.lock().await;
        if locks.get(&monitor_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&monitor_id);
        }
    }

    /// Record a resolution the incident system already confirmed. Kept for a
    /// later attempt while the local write keeps failing.
    async fn record_resolution(&self, monitor_id: MonitorId, incident_id: &str) -> Result<u64> {
        match self.database.resolve_monitor_incident(monitor_id, incident_id).await {
            Ok(rows) => {
                self.unrecorded_resolutions.lock().await.remove(&monitor_id);
                Ok(rows)
            }
            Err(e) => {
                self.unrecorded_resolutions.lock().await.insert(monitor_id, incident_id.to_string());
                Err(e)
            }
        }
    }

    async fn settle_unrecorded_resolution(&self, monitor_id: MonitorId) -> Result<()> {
        let pending = self.unrecorded_resolutions.lock().await.get(&monitor_id).cloned();
        if let Some(incident_id) = pending {
            let rows = self.record_resolution(monitor_id, &incident_id).await?;
            info!(monitor_id, incident_id = %incident_id, rows, "Recorded earlier incident resolution");
        }
        Ok(())
    }

    /// Open an incident for a monitor that just went DOWN, unless one is
    /// already open. Errors are logged, never returned.
    pub async fn handle_down_transition(&self, monitor: &Monitor, heartbeat: &Heartbeat) -> IncidentAction {
        if !self.api.is_enabled() {
            debug!(monitor_id = monitor.id, "Incident endpoint not configured, skipping incident creation");
            return IncidentAction::Skipped;
        }

        let lock = self.lock_for(monitor.id).await;
        let _guard = lock.lock().await;

        match self.open_for_failure(monitor, heartbeat).await {
            Ok(action) => action,
            Err(e) => {
                error!(monitor_id = monitor.id, error = %e, "Failed to create incident");
                IncidentAction::Failed
            }
        }
    }

    /// Resolve the open incident of a monitor that recovered. Local state is
    /// only closed once the incident system confirmed the resolution.
    pub async fn handle_up_transition(&self, monitor: &Monitor) -> IncidentAction {
        if !self.api.is_enabled() {
            return IncidentAction::Skipped;
        }

        let lock = self.lock_for(monitor.id).await;
        let _guard = lock.lock().await;

        match self.resolve_for_recovery(monitor).await {
            Ok(action) => action,
            Err(e) => {
                error!(monitor_id = monitor.id, error = %e, "Failed to resolve incident");
                IncidentAction::Failed
            }
        }
    }

    /// Post an `Investigating` update for a monitor that is still DOWN
    pub async fn refresh_incident(&self, monitor: &Monitor, heartbeat: &Heartbeat) -> IncidentAction {
        if !self.api.is_enabled() {
            return IncidentAction::Skipped;
        }

        let lock = self.lock_for(monitor.id).await;
        let _guard = lock.lock().await;

        match self.refresh(monitor, heartbeat).await {
            Ok(action) => action,
            Err(e) => {
                error!(monitor_id = monitor.id, error = %e, "Failed to update incident");
                IncidentAction::Failed
            }
        }
    }

    /// The monitor's open incident. Falls back to open local rows for the
    /// monitor or its status pages and writes a found id back onto the monitor.
    async fn current_incident(&self, monitor: &Monitor) -> Result<Option<String>> {
        if let Some(id) = &monitor.incident_id {
            return Ok(Some(id.clone()));
        }

        if let Some(id) = self.database.find_open_incident(monitor.id).await? {
            info!(monitor_id = monitor.id, incident_id = %id, "Adopting open incident found in local records");
            self.database.set_monitor_incident(monitor.id, Some(&id)).await?;
            return Ok(Some(id));
        }

        Ok(None)
    }

    async fn service_type(&self, monitor_id: MonitorId) -> Result<String> {
        let tag = self.database.get_monitor_tag(monitor_id, SERVICE_TYPE_TAG).await?;
        Ok(tag.filter(|v| !v.trim().is_empty()).unwrap_or_else(|| self.settings.default_service_type.clone()))
    }

    async fn open_for_failure(&self, monitor: &Monitor, heartbeat: &Heartbeat) -> Result<IncidentAction> {
        self.settle_unrecorded_resolution(monitor.id).await?;

        // The in-memory copy may predate an incident opened by another path
        let Some(fresh) = self.database.get_monitor(monitor.id).await? else {
            return Ok(IncidentAction::Skipped);
        };

        if let Some(existing) = self.current_incident(&fresh).await? {
            debug!(monitor_id = fresh.id, incident_id = %existing, "Incident already open");
            return Ok(IncidentAction::AlreadyOpen(existing));
        }

        let reason = if heartbeat.message.is_empty() { "Unknown error" } else { heartbeat.message.as_str() };
        let title = format!("Monitor Down: {}", fresh.name);
        let description = format!("Monitor {} is down. Error: {}", fresh.name, reason);

        let request = IncidentRequest {
            monitor_id: Some(fresh.id),
            incident_id: None,
            site_url: Some(fresh.site_url().to_string()),
            region: self.settings.region.clone(),
            title: title.clone(),
            description: description.clone(),
            updated_by: self.settings.updated_by.clone(),
            incident_status: IncidentStatus::Identified,
            incident_impact: Some(IncidentImpact::Major),
            service_type: Some(self.service_type(fresh.id).await?),
        };

        let incident_id = match self.api.create_incident(&request).await {
            Ok(id) => id,
            Err(e) => {
                warn!(monitor_id = fresh.id, error = %e, "Incident API did not create an incident");
                return Ok(IncidentAction::Failed);
            }
        };

        self.database.set_monitor_incident(fresh.id, Some(&incident_id)).await?;

        match self.write_local_rows(&fresh, &incident_id, &title, &description).await {
            Ok(rows) => {
                info!(
                    target: "uppe::audit",
                    monitor_id = fresh.id,
                    incident_id = %incident_id,
                    rows,
                    "Incident opened"
                );
            }
            // The external incident and the monitor reference stand on their own
            Err(e) => {
                error!(monitor_id = fresh.id, incident_id = %incident_id, error = %e, "Failed to create local incident");
            }
        }

        Ok(IncidentAction::Opened(incident_id))
    }

    /// One row per status page, or a single page-less row
    async fn write_local_rows(
        &self,
        monitor: &Monitor,
        incident_id: &str,
        title: &str,
        content: &str,
    ) -> Result<usize> {
        let pages = self.database.monitor_status_pages(monitor.id).await?;
        let targets: Vec<Option<i64>> =
            if pages.is_empty() { vec![None] } else { pages.into_iter().map(Some).collect() };

        let now = SystemTime::now();
        for status_page_id in &targets {
            let incident = Incident {
                id: None,
                incident_id: incident_id.to_string(),
                monitor_id: Some(monitor.id),
                status_page_id: *status_page_id,
                title: title.to_string(),
                content: content.to_string(),
                style: "danger".to_string(),
                pin: true,
                active: true,
                created_at: now,
                last_updated_at: None,
            };
            self.database.insert_incident(&incident).await?;
        }

        Ok(targets.len())
    }

    async fn resolve_for_recovery(&self, monitor: &Monitor) -> Result<IncidentAction> {
        self.settle_unrecorded_resolution(monitor.id).await?;

        let Some(fresh) = self.database.get_monitor(monitor.id).await? else {
            return Ok(IncidentAction::Skipped);
        };

        let Some(incident_id) = self.current_incident(&fresh).await? else {
            return Ok(IncidentAction::NothingOpen);
        };

        let request = IncidentRequest {
            monitor_id: Some(fresh.id),
            incident_id: Some(incident_id.clone()),
            site_url: None,
            region: self.settings.region.clone(),
            title: format!("RESOLVED: Monitor Up: {}", fresh.name),
            description: format!("Monitor \"{}\" has recovered. Service is now operational.", fresh.name),
            updated_by: self.settings.updated_by.clone(),
            incident_status: IncidentStatus::Resolved,
            incident_impact: None,
            service_type: None,
        };

        if let Err(e) = self.api.update_incident(&request).await {
            warn!(
                monitor_id = fresh.id,
                incident_id = %incident_id,
                error = %e,
                "Incident resolution not confirmed, keeping it open"
            );
            return Ok(IncidentAction::Failed);
        }

        let rows = self.record_resolution(fresh.id, &incident_id).await?;

        info!(target: "uppe::audit", monitor_id = fresh.id, incident_id = %incident_id, rows, "Incident resolved");
        Ok(IncidentAction::Resolved(incident_id))
    }

    async fn refresh(&self, monitor: &Monitor, heartbeat: &Heartbeat) -> Result<IncidentAction> {
        self.settle_unrecorded_resolution(monitor.id).await?;

        let Some(fresh) = self.database.get_monitor(monitor.id).await? else {
            return Ok(IncidentAction::Skipped);
        };

        let Some(incident_id) = self.current_incident(&fresh).await? else {
            return Ok(IncidentAction::NothingOpen);
        };

        let reason = if heartbeat.message.is_empty() { "Unknown error" } else { heartbeat.message.as_str() };
        let request = IncidentRequest {
            monitor_id: Some(fresh.id),
            incident_id: Some(incident_id.clone()),
            site_url: None,
            region: self.settings.region.clone(),
            title: format!("Monitor Down: {}", fresh.name),
            description: format!("Monitor {} is still down. Error: {}", fresh.name, reason),
            updated_by: self.settings.updated_by.clone(),
            incident_status: IncidentStatus::Investigating,
            incident_impact: None,
            service_type: None,
        };

        if let Err(e) = self.api.update_incident(&request).await {
            warn!(monitor_id = fresh.id, incident_id = %incident_id, error = %e, "Failed to refresh incident");
            return Ok(IncidentAction::Failed);
        }

        self.database.touch_incident(&incident_id).await?;
        Ok(IncidentAction::Refreshed(incident_id))
    }
}
