use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::{EngineError, EngineResult};
use crate::monitoring::scheduler::MonitorScheduler;
use crate::monitoring::types::MonitorId;

/// Running schedulers by monitor id. Holds at most one scheduler per id.
#[derive(Default)]
pub struct MonitorRegistry {
    schedulers: RwLock<HashMap<MonitorId, Arc<MonitorScheduler>>>,
    /// Serializes start/pause/delete of the same monitor
    lifecycle_locks: Mutex<HashMap<MonitorId, Arc<Mutex<()>>>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and insert under one write lock
    pub async fn register(&self, scheduler: Arc<MonitorScheduler>) -> EngineResult<()> {
        let monitor_id = scheduler.monitor_id();
        let mut schedulers = self.schedulers.write().await;

        if schedulers.contains_key(&monitor_id) {
            return Err(EngineError::DoubleStart(monitor_id));
        }

        schedulers.insert(monitor_id, scheduler);
        Ok(())
    }

    /// Remove the entry only if it is this exact scheduler
    pub async fn deregister(&self, scheduler: &Arc<MonitorScheduler>) -> bool {
        let monitor_id = scheduler.monitor_id();
        let mut schedulers = self.schedulers.write().await;

        match schedulers.get(&monitor_id) {
            Some(current) if Arc::ptr_eq(current, scheduler) => {
                schedulers.remove(&monitor_id);
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, monitor_id: MonitorId) -> Option<Arc<MonitorScheduler>> {
        self.schedulers.read().await.get(&monitor_id).cloned()
    }

    pub async fn is_running(&self, monitor_id: MonitorId) -> bool {
        self.schedulers.read().await.contains_key(&monitor_id)
    }

    pub async fn running_ids(&self) -> Vec<MonitorId> {
        let mut ids: Vec<_> = self.schedulers.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn len(&self) -> usize {
        self.schedulers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn all(&self) -> Vec<Arc<MonitorScheduler>> {
        self.schedulers.read().await.values().cloned().collect()
    }

    /// Hold while changing a monitor's persisted `active` flag together with
    /// its registry entry
    pub async fn lock_monitor(&self, monitor_id: MonitorId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.lifecycle_locks.lock().await;
            locks.entry(monitor_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drop the lifecycle lock of a deleted monitor, unless another task
    /// still holds or waits on it
    pub async fn forget_lock(&self, monitor_id: MonitorId) {
        let mut locks = self.lifecycle_locks.lock().await;
        if locks.get(&monitor_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&monitor_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn forget_lock_keeps_a_held_lock() {
        let registry = Arc::new(MonitorRegistry::new());
        let guard = registry.lock_monitor(9).await;

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _guard = registry.lock_monitor(9).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        registry.forget_lock(9).await;
        assert!(registry.lifecycle_locks.lock().await.contains_key(&9));

        // A newcomer still queues behind the holder
        let newcomer = tokio::time::timeout(Duration::from_millis(50), registry.lock_monitor(9)).await;
        assert!(newcomer.is_err());

        drop(guard);
        waiter.await.unwrap();

        registry.forget_lock(9).await;
        assert!(registry.lifecycle_locks.lock().await.is_empty());
    }
}
