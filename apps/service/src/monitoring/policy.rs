use std::time::Duration;

use super::types::MonitorStatus;
use crate::database::models::Monitor;

/// Result of a probe as seen by the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// Monitor is under maintenance; nothing was probed
    Maintenance,
}

/// Status memory carried from one beat to the next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeatState {
    /// Status of the previous beat; `None` before the first beat
    pub status: Option<MonitorStatus>,
    pub retries: u32,
    /// Consecutive DOWN beats since the last (re)notification
    pub down_count: u32,
}

impl BeatState {
    pub fn initial() -> Self {
        Self { status: None, retries: 0, down_count: 0 }
    }

    /// Resume from the last persisted beat
    pub fn resume(status: MonitorStatus, retries: u32) -> Self {
        Self { status: Some(status), retries, down_count: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub status: MonitorStatus,
    pub retries: u32,
    pub down_count: u32,
    pub next_delay: Duration,
    /// Status edge worth notifying on
    pub important: bool,
    /// Still DOWN and the resend cadence came due
    pub resend: bool,
}

impl Decision {
    pub fn state(&self) -> BeatState {
        BeatState { status: Some(self.status), retries: self.retries, down_count: self.down_count }
    }
}

/// Up/down debouncing and retry cadence for one monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub retry_interval: Duration,
    pub max_retries: u32,
    pub resend_interval: u32,
}

impl RetryPolicy {
    pub fn from_monitor(monitor: &Monitor) -> Self {
        Self {
            interval: Duration::from_secs(monitor.interval_seconds),
            retry_interval: Duration::from_secs(monitor.retry_interval_seconds),
            max_retries: monitor.max_retries,
            resend_interval: monitor.resend_interval,
        }
    }

    fn retry_delay(&self) -> Duration {
        if self.retry_interval.is_zero() { self.interval } else { self.retry_interval }
    }

    pub fn evaluate(&self, state: &BeatState, outcome: Outcome) -> Decision {
        match outcome {
            Outcome::Maintenance => Decision {
                status: MonitorStatus::Maintenance,
                retries: 0,
                down_count: 0,
                next_delay: self.interval,
                important: state.status != Some(MonitorStatus::Maintenance),
                resend: false,
            },
            Outcome::Success => Decision {
                status: MonitorStatus::Up,
                retries: 0,
                down_count: 0,
                next_delay: self.interval,
                important: matches!(
                    state.status,
                    Some(MonitorStatus::Down) | Some(MonitorStatus::Maintenance)
                ),
                resend: false,
            },
            Outcome::Failure => self.on_failure(state),
        }
    }

    fn on_failure(&self, state: &BeatState) -> Decision {
        match state.status {
            Some(MonitorStatus::Down) => {
                let mut down_count = state.down_count.saturating_add(1);
                let resend = self.resend_interval > 0 && down_count >= self.resend_interval;
                if resend {
                    down_count = 0;
                }
                Decision {
                    status: MonitorStatus::Down,
                    retries: state.retries,
                    down_count,
                    next_delay: self.interval,
                    important: false,
                    resend,
                }
            }
            Some(MonitorStatus::Pending) if state.retries < self.max_retries => Decision {
                status: MonitorStatus::Pending,
                retries: state.retries + 1,
                down_count: 0,
                next_delay: self.retry_delay(),
                important: false,
                resend: false,
            },
            Some(MonitorStatus::Pending) => self.went_down(state.retries),
            // UP, MAINTENANCE or first beat
            _ if self.max_retries == 0 => self.went_down(0),
            _ => Decision {
                status: MonitorStatus::Pending,
                retries: 1,
                down_count: 0,
                next_delay: self.retry_delay(),
                important: false,
                resend: false,
            },
        }
    }

    fn went_down(&self, retries: u32) -> Decision {
        Decision {
            status: MonitorStatus::Down,
            retries,
            down_count: 0,
            next_delay: self.interval,
            important: true,
            resend: false,
        }
    }
}
