//! Monitor execution engine: per-monitor probe loops, retry policy,
//! heartbeat persistence and incident coordination.

pub mod config;
pub mod database;
pub mod error;
pub mod incident;
pub mod monitoring;
pub mod notifier;
pub mod orchestrator;
pub mod pool;
pub mod publisher;

pub use error::{EngineError, EngineResult};
pub use orchestrator::{CreatedMonitor, Orchestrator};
