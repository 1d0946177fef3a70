use tokio::sync::broadcast;
use tracing::debug;

use crate::monitoring::types::{Heartbeat, MonitorId};

/// Change pushed to connected real-time clients
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Heartbeat { owner_id: i64, heartbeat: Heartbeat },
    /// The monitor list of `owner_id` changed; clients reload it
    MonitorUpdated { owner_id: i64, monitor_id: MonitorId },
}

/// Fire-and-forget fan-out of state changes
pub trait Publisher: Send + Sync {
    fn publish_heartbeat(&self, owner_id: i64, heartbeat: &Heartbeat);

    fn publish_monitor_update(&self, owner_id: i64, monitor_id: MonitorId);
}

/// Publisher backed by a tokio broadcast channel; slow subscribers lag
/// instead of blocking schedulers
pub struct BroadcastPublisher {
    tx: broadcast::Sender<MonitorEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel::<MonitorEvent>(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: MonitorEvent) {
        // Ignore errors if there are no receivers
        let _ = self.tx.send(event);
    }
}

impl Publisher for BroadcastPublisher {
    fn publish_heartbeat(&self, owner_id: i64, heartbeat: &Heartbeat) {
        debug!(owner_id, monitor_id = heartbeat.monitor_id, status = %heartbeat.status, "Publishing heartbeat");
        self.publish(MonitorEvent::Heartbeat { owner_id, heartbeat: heartbeat.clone() });
    }

    fn publish_monitor_update(&self, owner_id: i64, monitor_id: MonitorId) {
        debug!(owner_id, monitor_id, "Publishing monitor list update");
        self.publish(MonitorEvent::MonitorUpdated { owner_id, monitor_id });
    }
}
