/// Monitoring engine module - runs the per-monitor probe loops
///
/// This module is responsible for:
/// - Executing HTTP/TCP/push/group/manual checks
/// - Debouncing results into UP/PENDING/DOWN with the retry policy
/// - Scheduling each monitor on its own task
/// - Validating monitor definitions
pub mod checker;
pub mod executor;
pub mod policy;
pub mod scheduler;
pub mod types;
pub mod validation;

pub use checker::{Probe, PushLedger, PushReport};
pub use executor::MonitoringExecutor;
pub use policy::RetryPolicy;
pub use scheduler::{EngineContext, MonitorScheduler};
pub use types::{Heartbeat, MonitorId, MonitorStatus, MonitorType};
