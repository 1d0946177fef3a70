//! Monitor configuration validation.
//!
//! Runs before a monitor is stored so that schedulers never see a target
//! they cannot probe.

use anyhow::{Result, anyhow};
use std::ops::RangeInclusive;
use url::Url;

use super::types::MonitorType;
use crate::database::models::MonitorConfig;

const MIN_INTERVAL: u64 = 10; // 10 seconds
const MAX_INTERVAL: u64 = 86400; // 24 hours

/// Validate a full monitor definition
pub fn validate_monitor_config(config: &MonitorConfig) -> Result<()> {
    if config.name.trim().is_empty() {
        return Err(anyhow!("Monitor name must not be empty"));
    }

    validate_monitor_target(&config.target, config.monitor_type)?;
    validate_check_interval(config.interval_seconds)?;

    // 0 means "same as the interval"
    if config.retry_interval_seconds != 0 {
        validate_check_interval(config.retry_interval_seconds)?;
    }

    if let Some(timeout_seconds) = config.timeout_seconds {
        validate_timeout(timeout_seconds)?;
    }

    for range in &config.accepted_status_codes {
        parse_status_range(range)?;
    }

    if config.keyword.is_some() && config.monitor_type != MonitorType::Http {
        return Err(anyhow!("Keyword is only supported for HTTP monitors"));
    }

    Ok(())
}

/// Validates a monitor target based on its type
pub fn validate_monitor_target(target: &str, monitor_type: MonitorType) -> Result<()> {
    match monitor_type {
        MonitorType::Http => validate_http_target(target),
        MonitorType::Tcp => validate_tcp_target(target),
        MonitorType::Push | MonitorType::Group | MonitorType::Manual => Ok(()),
    }
}

/// Validate HTTP/HTTPS target
fn validate_http_target(target: &str) -> Result<()> {
    let url = Url::parse(target).map_err(|e| anyhow!("Invalid URL: {}", e))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(anyhow!("Invalid scheme for HTTP monitor: {}", other)),
    }

    if url.host_str().is_none() {
        return Err(anyhow!("URL has no host: {}", target));
    }

    if let Some(port) = url.port() {
        validate_port(port)?;
    }

    Ok(())
}

/// Validate TCP target
fn validate_tcp_target(target: &str) -> Result<()> {
    // Expected format: host:port
    let (host, port) =
        target.rsplit_once(':').ok_or_else(|| anyhow!("TCP target must be in format host:port"))?;

    if host.is_empty() {
        return Err(anyhow!("TCP target must be in format host:port"));
    }

    let port: u16 = port.parse().map_err(|_| anyhow!("Invalid port number"))?;
    validate_port(port)
}

/// Validate port is in valid range
fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(anyhow!("Port 0 is not valid"));
    }
    Ok(())
}

/// Validate check interval
pub fn validate_check_interval(interval_seconds: u64) -> Result<()> {
    if interval_seconds < MIN_INTERVAL {
        return Err(anyhow!(
            "Check interval too short: {} seconds (minimum: {})",
            interval_seconds,
            MIN_INTERVAL
        ));
    }

    if interval_seconds > MAX_INTERVAL {
        return Err(anyhow!(
            "Check interval too long: {} seconds (maximum: {})",
            interval_seconds,
            MAX_INTERVAL
        ));
    }

    Ok(())
}

/// Validate timeout is reasonable
pub fn validate_timeout(timeout_seconds: u64) -> Result<()> {
    const MIN_TIMEOUT: u64 = 1;
    const MAX_TIMEOUT: u64 = 300; // 5 minutes

    if timeout_seconds < MIN_TIMEOUT {
        return Err(anyhow!(
            "Timeout too short: {} seconds (minimum: {})",
            timeout_seconds,
            MIN_TIMEOUT
        ));
    }

    if timeout_seconds > MAX_TIMEOUT {
        return Err(anyhow!(
            "Timeout too long: {} seconds (maximum: {})",
            timeout_seconds,
            MAX_TIMEOUT
        ));
    }

    Ok(())
}

/// Parse an accepted status code entry: `"200-299"` or a single `"404"`
pub fn parse_status_range(range: &str) -> Result<RangeInclusive<u16>> {
    let parse = |s: &str| -> Result<u16> {
        let code: u16 = s.trim().parse().map_err(|_| anyhow!("Invalid status code: {}", s))?;
        if !(100..=599).contains(&code) {
            return Err(anyhow!("Status code out of range: {}", code));
        }
        Ok(code)
    };

    match range.split_once('-') {
        Some((low, high)) => {
            let (low, high) = (parse(low)?, parse(high)?);
            if low > high {
                return Err(anyhow!("Invalid status code range: {}", range));
            }
            Ok(low..=high)
        }
        None => {
            let code = parse(range)?;
            Ok(code..=code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_http_target() {
        assert!(validate_http_target("https://example.com").is_ok());
        assert!(validate_http_target("http://example.com:8080").is_ok());
        assert!(validate_http_target("http://127.0.0.1:3000/health").is_ok());

        assert!(validate_http_target("ftp://example.com").is_err());
        assert!(validate_http_target("example.com").is_err());
        assert!(validate_http_target("").is_err());
    }

    #[test]
    fn test_validate_tcp_target() {
        assert!(validate_tcp_target("example.com:80").is_ok());
        assert!(validate_tcp_target("10.0.0.5:5432").is_ok());

        assert!(validate_tcp_target("example.com").is_err());
        assert!(validate_tcp_target("example.com:").is_err());
        assert!(validate_tcp_target(":80").is_err());
        assert!(validate_tcp_target("example.com:0").is_err());
    }

    #[test]
    fn test_validate_check_interval() {
        assert!(validate_check_interval(10).is_ok()); // Min
        assert!(validate_check_interval(60).is_ok()); // Normal
        assert!(validate_check_interval(86400).is_ok()); // Max

        assert!(validate_check_interval(5).is_err()); // Too short
        assert!(validate_check_interval(100000).is_err()); // Too long
    }

    #[test]
    fn test_parse_status_range() {
        assert_eq!(parse_status_range("200-299").unwrap(), 200..=299);
        assert_eq!(parse_status_range("404").unwrap(), 404..=404);
        assert!(parse_status_range("299-200").is_err());
        assert!(parse_status_range("abc").is_err());
        assert!(parse_status_range("700").is_err());
    }

    #[test]
    fn test_validate_monitor_config() {
        let config = MonitorConfig::new("api", MonitorType::Http, "https://example.com");
        assert!(validate_monitor_config(&config).is_ok());

        let push = MonitorConfig::new("cron", MonitorType::Push, "");
        assert!(validate_monitor_config(&push).is_ok());

        let unnamed = MonitorConfig::new("  ", MonitorType::Push, "");
        assert!(validate_monitor_config(&unnamed).is_err());

        let mut zero_timeout = config.clone();
        zero_timeout.timeout_seconds = Some(0);
        assert!(validate_monitor_config(&zero_timeout).is_err());

        let mut zero_retry = config.clone();
        zero_retry.retry_interval_seconds = 0;
        assert!(validate_monitor_config(&zero_retry).is_ok());

        let mut keyword_on_tcp = MonitorConfig::new("db", MonitorType::Tcp, "db.internal:5432");
        keyword_on_tcp.keyword = Some("ready".to_string());
        assert!(validate_monitor_config(&keyword_on_tcp).is_err());
    }
}
