use thiserror::Error;

use crate::monitoring::types::MonitorId;

/// Errors surfaced to callers of the engine's lifecycle operations.
///
/// Probe failures and incident API failures never show up here; the first
/// feed the retry policy and the second are logged by the coordinator.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid monitor configuration: {0}")]
    Validation(String),

    #[error("monitor {monitor_id} is not owned by user {owner_id}")]
    Ownership { monitor_id: MonitorId, owner_id: i64 },

    #[error("monitor {0} not found")]
    NotFound(MonitorId),

    #[error("unknown push token")]
    UnknownPushToken,

    #[error("monitor {0} already has a running scheduler")]
    DoubleStart(MonitorId),

    #[error("monitor {0} is not active")]
    InactiveMonitor(MonitorId),

    #[error("persistence error: {0}")]
    Persistence(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
