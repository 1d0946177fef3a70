use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use thiserror::Error;

/// Row id of a persisted monitor
pub type MonitorId = i64;

/// Logical status of a monitor as recorded on each heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Down,
    Up,
    Pending,
    Maintenance,
}

impl MonitorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorStatus::Down => "down",
            MonitorStatus::Up => "up",
            MonitorStatus::Pending => "pending",
            MonitorStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl FromStr for MonitorStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "down" => Ok(MonitorStatus::Down),
            "up" => Ok(MonitorStatus::Up),
            "pending" => Ok(MonitorStatus::Pending),
            "maintenance" => Ok(MonitorStatus::Maintenance),
            other => Err(ParseEnumError { kind: "monitor status", value: other.to_string() }),
        }
    }
}

/// Kind of probe a monitor runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorType {
    /// HTTP(S) request, optionally asserting a keyword in the body
    Http,
    /// TCP connect to `host:port`
    Tcp,
    /// Passive monitor fed by pushes from the monitored service
    Push,
    /// Parent node aggregating its children; never touches the network
    Group,
    /// Status set by hand
    Manual,
}

impl MonitorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorType::Http => "http",
            MonitorType::Tcp => "tcp",
            MonitorType::Push => "push",
            MonitorType::Group => "group",
            MonitorType::Manual => "manual",
        }
    }

    /// Whether the monitor needs a target address to be probed
    pub fn requires_target(&self) -> bool {
        matches!(self, MonitorType::Http | MonitorType::Tcp)
    }
}

impl fmt::Display for MonitorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MonitorType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" | "https" | "keyword" => Ok(MonitorType::Http),
            "tcp" | "port" => Ok(MonitorType::Tcp),
            "push" => Ok(MonitorType::Push),
            "group" => Ok(MonitorType::Group),
            "manual" => Ok(MonitorType::Manual),
            other => Err(ParseEnumError { kind: "monitor type", value: other.to_string() }),
        }
    }
}

/// Successful probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub latency_ms: Option<u64>,
    pub message: String,
}

impl ProbeReport {
    pub fn up(latency_ms: Option<u64>, message: impl Into<String>) -> Self {
        Self { latency_ms, message: message.into() }
    }
}

/// Failed probe. This is an expected outcome that feeds the retry policy,
/// not a system error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ProbeFailure {
    pub message: String,
    pub latency_ms: Option<u64>,
}

impl ProbeFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), latency_ms: None }
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

pub type ProbeResult = Result<ProbeReport, ProbeFailure>;

/// One timestamped probe outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Row id, set once persisted
    pub id: Option<i64>,

    pub monitor_id: MonitorId,

    pub timestamp: SystemTime,

    pub status: MonitorStatus,

    /// Probe duration in milliseconds (if the probe measured one)
    pub duration_ms: Option<u64>,

    pub message: String,

    /// Marks a status edge worth notifying on
    pub important: bool,

    /// Consecutive retry count at the time of this beat
    pub retries: u32,
}

impl Heartbeat {
    pub fn new(monitor_id: MonitorId, status: MonitorStatus) -> Self {
        Self {
            id: None,
            monitor_id,
            timestamp: SystemTime::now(),
            status,
            duration_ms: None,
            message: String::new(),
            important: false,
            retries: 0,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_duration(mut self, duration_ms: Option<u64>) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}
