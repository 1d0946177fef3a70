use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::monitoring::types::{MonitorId, MonitorStatus, MonitorType};

/// Convert SystemTime to Unix milliseconds
pub fn to_unix_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// Convert Unix milliseconds to SystemTime
pub fn from_unix_millis(millis: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64)
}

fn default_interval() -> u64 {
    60
}

/// Probe timeout used when a monitor does not set one
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

fn default_active() -> bool {
    true
}

fn default_status_codes() -> Vec<String> {
    vec!["200-299".to_string()]
}

/// A `name = value` label attached to a monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorTag {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Monitor definition as submitted by the configuration API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub monitor_type: MonitorType,

    /// URL for HTTP monitors, `host:port` for TCP monitors
    #[serde(default)]
    pub target: String,

    #[serde(default = "default_interval")]
    pub interval_seconds: u64,

    #[serde(default = "default_interval")]
    pub retry_interval_seconds: u64,

    #[serde(default)]
    pub max_retries: u32,

    /// Re-notify every N consecutive DOWN beats (0 = never)
    #[serde(default)]
    pub resend_interval: u32,

    /// `None` takes the engine's configured default
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(default)]
    pub parent_id: Option<MonitorId>,

    #[serde(default = "default_status_codes")]
    pub accepted_status_codes: Vec<String>,

    #[serde(default)]
    pub keyword: Option<String>,

    #[serde(default)]
    pub tags: Vec<MonitorTag>,
}

impl MonitorConfig {
    pub fn new(name: impl Into<String>, monitor_type: MonitorType, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            monitor_type,
            target: target.into(),
            interval_seconds: default_interval(),
            retry_interval_seconds: default_interval(),
            max_retries: 0,
            resend_interval: 0,
            timeout_seconds: None,
            active: true,
            parent_id: None,
            accepted_status_codes: default_status_codes(),
            keyword: None,
            tags: Vec::new(),
        }
    }
}

/// Monitor model - a persisted monitoring target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Monitor {
    /// Row id; 0 until the monitor has been inserted
    pub id: MonitorId,
    pub uuid: Uuid,
    pub owner_id: i64,
    pub name: String,
    pub monitor_type: MonitorType,
    pub target: String,
    pub interval_seconds: u64,
    pub retry_interval_seconds: u64,
    pub max_retries: u32,
    pub resend_interval: u32,
    pub timeout_seconds: u64,
    pub active: bool,
    pub parent_id: Option<MonitorId>,
    /// External id of the currently open incident
    pub incident_id: Option<String>,
    pub push_token: Option<String>,
    pub accepted_status_codes: Vec<String>,
    pub keyword: Option<String>,
    pub manual_status: Option<MonitorStatus>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl Monitor {
    /// Build an unsaved monitor owned by `owner_id`
    pub fn new(config: MonitorConfig, owner_id: i64) -> Self {
        let now = SystemTime::now();
        Self {
            id: 0,
            uuid: Uuid::new_v4(),
            owner_id,
            name: config.name,
            monitor_type: config.monitor_type,
            target: config.target,
            interval_seconds: config.interval_seconds,
            retry_interval_seconds: config.retry_interval_seconds,
            max_retries: config.max_retries,
            resend_interval: config.resend_interval,
            timeout_seconds: config.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS),
            active: config.active,
            parent_id: config.parent_id,
            incident_id: None,
            push_token: None,
            accepted_status_codes: config.accepted_status_codes,
            keyword: config.keyword,
            manual_status: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Display URL forwarded to the incident system
    pub fn site_url(&self) -> &str {
        if self.target.is_empty() { &self.name } else { &self.target }
    }
}

/// Incident model - local mirror of an externally tracked outage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Option<i64>,
    /// Id issued by the external incident system
    pub incident_id: String,
    /// Owning monitor; legacy rows only carry a status page
    pub monitor_id: Option<MonitorId>,
    pub status_page_id: Option<i64>,
    pub title: String,
    pub content: String,
    pub style: String,
    pub pin: bool,
    pub active: bool,
    pub created_at: SystemTime,
    pub last_updated_at: Option<SystemTime>,
}

impl Incident {
    pub fn is_open(&self) -> bool {
        self.pin && self.active
    }
}
