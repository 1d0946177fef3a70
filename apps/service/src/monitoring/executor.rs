use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use super::checker::{GroupChecker, HttpChecker, ManualChecker, Probe, PushChecker, PushLedger, TcpChecker};
use super::types::{MonitorType, ProbeResult};
use crate::database::Database;
use crate::database::models::Monitor;

/// Monitoring executor - routes each monitor to the checker for its type
pub struct MonitoringExecutor {
    http_checker: HttpChecker,
    tcp_checker: TcpChecker,
    push_checker: PushChecker,
    group_checker: GroupChecker,
    manual_checker: ManualChecker,
}

impl MonitoringExecutor {
    /// Create a new monitoring executor
    pub fn new(database: Arc<dyn Database>, push_ledger: Arc<PushLedger>) -> Result<Self> {
        Ok(Self {
            http_checker: HttpChecker::new()?,
            tcp_checker: TcpChecker,
            push_checker: PushChecker::new(push_ledger),
            group_checker: GroupChecker::new(database.clone()),
            manual_checker: ManualChecker::new(database),
        })
    }

    fn checker(&self, monitor_type: MonitorType) -> &dyn Probe {
        match monitor_type {
            MonitorType::Http => &self.http_checker,
            MonitorType::Tcp => &self.tcp_checker,
            MonitorType::Push => &self.push_checker,
            MonitorType::Group => &self.group_checker,
            MonitorType::Manual => &self.manual_checker,
        }
    }
}

#[async_trait]
impl Probe for MonitoringExecutor {
    async fn probe(&self, monitor: &Monitor) -> ProbeResult {
        self.checker(monitor.monitor_type).probe(monitor).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::MonitorConfig;
    use crate::database::test_support::create_test_database;
    use crate::monitoring::checker::PushReport;

    #[tokio::test]
    async fn dispatches_on_monitor_type() -> Result<()> {
        let (_dir, db) = create_test_database().await?;
        let ledger = Arc::new(PushLedger::new());
        let executor = MonitoringExecutor::new(db.clone(), ledger.clone())?;

        let mut push = Monitor::new(MonitorConfig::new("cron", MonitorType::Push, ""), 1);
        push.id = db.insert_monitor(&push).await?;
        assert!(executor.probe(&push).await.is_err());

        ledger.record(push.id, PushReport::up()).await;
        assert!(executor.probe(&push).await.is_ok());

        let mut group = Monitor::new(MonitorConfig::new("all", MonitorType::Group, ""), 1);
        group.id = db.insert_monitor(&group).await?;
        assert_eq!(executor.probe(&group).await.unwrap().message, "Group empty");
        Ok(())
    }
}
