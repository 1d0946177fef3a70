use tracing::{info, warn};

use crate::database::models::Monitor;
use crate::monitoring::types::{Heartbeat, MonitorStatus};

/// Notification dispatch for important beats. Channel delivery lives
/// outside the engine.
pub trait Notifier: Send + Sync {
    /// A status edge: `heartbeat.important` is set
    fn notify_important(&self, monitor: &Monitor, heartbeat: &Heartbeat);

    /// Still DOWN after `resend_interval` more beats
    fn notify_resend(&self, monitor: &Monitor, heartbeat: &Heartbeat);
}

/// Writes notifications to the log
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_important(&self, monitor: &Monitor, heartbeat: &Heartbeat) {
        match heartbeat.status {
            MonitorStatus::Down => warn!(
                target: "uppe::notify",
                monitor_id = monitor.id,
                owner_id = monitor.owner_id,
                message = %heartbeat.message,
                "[{}] [Down] {}",
                monitor.name,
                heartbeat.message
            ),
            status => info!(
                target: "uppe::notify",
                monitor_id = monitor.id,
                owner_id = monitor.owner_id,
                "[{}] [{}] {}",
                monitor.name,
                status,
                heartbeat.message
            ),
        }
    }

    fn notify_resend(&self, monitor: &Monitor, heartbeat: &Heartbeat) {
        warn!(
            target: "uppe::notify",
            monitor_id = monitor.id,
            owner_id = monitor.owner_id,
            "[{}] [Down] still down: {}",
            monitor.name,
            heartbeat.message
        );
    }
}
