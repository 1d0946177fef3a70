use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::timeout;

use super::types::{MonitorId, MonitorStatus, ProbeFailure, ProbeReport, ProbeResult};
use super::validation::parse_status_range;
use crate::database::Database;
use crate::database::models::Monitor;

/// One protocol-specific check
#[async_trait]
pub trait Probe: Send + Sync {
    /// Run the check once. A failure is an expected outcome, not an error.
    async fn probe(&self, monitor: &Monitor) -> ProbeResult;
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// HTTP/HTTPS checker, with optional keyword assertion
pub struct HttpChecker {
    client: reqwest::Client,
}

impl HttpChecker {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder().user_agent(concat!("uppe-engine/", env!("CARGO_PKG_VERSION"))).build()?;
        Ok(Self { client })
    }

    fn status_accepted(accepted: &[String], status: u16) -> bool {
        if accepted.is_empty() {
            return (200..=299).contains(&status);
        }
        accepted.iter().filter_map(|range| parse_status_range(range).ok()).any(|range| range.contains(&status))
    }
}

#[async_trait]
impl Probe for HttpChecker {
    async fn probe(&self, monitor: &Monitor) -> ProbeResult {
        let start = Instant::now();

        let response = self
            .client
            .get(&monitor.target)
            .timeout(Duration::from_secs(monitor.timeout_seconds))
            .send()
            .await
            .map_err(|e| {
                let failure = if e.is_timeout() {
                    ProbeFailure::new(format!("Request timed out after {}s", monitor.timeout_seconds))
                } else {
                    ProbeFailure::new(format!("HTTP request failed: {}", e))
                };
                failure.with_latency(elapsed_ms(start))
            })?;

        let status = response.status().as_u16();

        if !Self::status_accepted(&monitor.accepted_status_codes, status) {
            return Err(ProbeFailure::new(format!("Status code {} not accepted", status))
                .with_latency(elapsed_ms(start)));
        }

        let Some(keyword) = monitor.keyword.as_deref().filter(|k| !k.is_empty()) else {
            return Ok(ProbeReport::up(Some(elapsed_ms(start)), format!("{} - OK", status)));
        };

        let body = response.text().await.map_err(|e| {
            ProbeFailure::new(format!("Failed to read response body: {}", e)).with_latency(elapsed_ms(start))
        })?;
        let latency = elapsed_ms(start);

        if body.contains(keyword) {
            Ok(ProbeReport::up(Some(latency), format!("{}, keyword \"{}\" found", status, keyword)))
        } else {
            Err(ProbeFailure::new(format!("Keyword \"{}\" not found in response", keyword)).with_latency(latency))
        }
    }
}

/// TCP port checker
pub struct TcpChecker;

#[async_trait]
impl Probe for TcpChecker {
    async fn probe(&self, monitor: &Monitor) -> ProbeResult {
        let start = Instant::now();
        let connect = tokio::net::TcpStream::connect(monitor.target.as_str());

        timeout(Duration::from_secs(monitor.timeout_seconds), connect)
            .await
            .map_err(|_| ProbeFailure::new("TCP connection timeout").with_latency(elapsed_ms(start)))?
            .map_err(|e| ProbeFailure::new(format!("TCP connection failed: {}", e)).with_latency(elapsed_ms(start)))?;

        let latency = elapsed_ms(start);
        Ok(ProbeReport::up(Some(latency), format!("Connected in {} ms", latency)))
    }
}

/// What the monitored service reported when it pushed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    pub ok: bool,
    pub message: String,
    pub ping_ms: Option<u64>,
}

impl PushReport {
    pub fn up() -> Self {
        Self { ok: true, message: "OK".to_string(), ping_ms: None }
    }
}

#[derive(Debug, Clone)]
struct PushRecord {
    received_at: Instant,
    report: PushReport,
}

/// Latest push per monitor, shared between the push endpoint and the checker
#[derive(Default)]
pub struct PushLedger {
    pushes: RwLock<HashMap<MonitorId, PushRecord>>,
}

impl PushLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, monitor_id: MonitorId, report: PushReport) {
        self.pushes.write().await.insert(monitor_id, PushRecord { received_at: Instant::now(), report });
    }

    pub async fn forget(&self, monitor_id: MonitorId) {
        self.pushes.write().await.remove(&monitor_id);
    }

    async fn latest_within(&self, monitor_id: MonitorId, window: Duration) -> Option<PushReport> {
        let pushes = self.pushes.read().await;
        pushes.get(&monitor_id).filter(|record| record.received_at.elapsed() <= window).map(|record| record.report.clone())
    }
}

/// Passive checker: UP when the service pushed within the last interval
pub struct PushChecker {
    ledger: Arc<PushLedger>,
}

impl PushChecker {
    pub fn new(ledger: Arc<PushLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl Probe for PushChecker {
    async fn probe(&self, monitor: &Monitor) -> ProbeResult {
        let window = Duration::from_secs(monitor.interval_seconds);

        match self.ledger.latest_within(monitor.id, window).await {
            Some(report) if report.ok => Ok(ProbeReport::up(report.ping_ms, report.message)),
            Some(report) => {
                let failure = ProbeFailure::new(report.message);
                Err(match report.ping_ms {
                    Some(ping) => failure.with_latency(ping),
                    None => failure,
                })
            }
            None => Err(ProbeFailure::new("No heartbeat in the time window")),
        }
    }
}

/// Aggregates the latest beats of the group's active children; never
/// touches the network
pub struct GroupChecker {
    database: Arc<dyn Database>,
}

impl GroupChecker {
    pub fn new(database: Arc<dyn Database>) -> Self {
        Self { database }
    }
}

#[async_trait]
impl Probe for GroupChecker {
    async fn probe(&self, monitor: &Monitor) -> ProbeResult {
        let children = self
            .database
            .get_children(monitor.id)
            .await
            .map_err(|e| ProbeFailure::new(format!("Failed to load children: {}", e)))?;

        let active: Vec<_> = children.into_iter().filter(|child| child.active).collect();
        if active.is_empty() {
            return Ok(ProbeReport::up(None, "Group empty"));
        }

        for child in &active {
            let latest = self
                .database
                .latest_heartbeat(child.id)
                .await
                .map_err(|e| ProbeFailure::new(format!("Failed to load child status: {}", e)))?;

            if let Some(beat) = latest {
                if matches!(beat.status, MonitorStatus::Down | MonitorStatus::Pending) {
                    return Err(ProbeFailure::new(format!("Child inaccessible: {}", child.name)));
                }
            }
        }

        Ok(ProbeReport::up(None, "All children up and running"))
    }
}

/// Status set by hand; re-read on every tick so changes apply without a restart
pub struct ManualChecker {
    database: Arc<dyn Database>,
}

impl ManualChecker {
    pub fn new(database: Arc<dyn Database>) -> Self {
        Self { database }
    }
}

#[async_trait]
impl Probe for ManualChecker {
    async fn probe(&self, monitor: &Monitor) -> ProbeResult {
        let current = self
            .database
            .get_monitor(monitor.id)
            .await
            .map_err(|e| ProbeFailure::new(format!("Failed to load manual status: {}", e)))?
            .and_then(|m| m.manual_status);

        match current {
            Some(MonitorStatus::Down) => Err(ProbeFailure::new("Manually marked down")),
            Some(MonitorStatus::Pending) => Err(ProbeFailure::new("Manually marked pending")),
            _ => Ok(ProbeReport::up(None, "Manually marked up")),
        }
    }
}
