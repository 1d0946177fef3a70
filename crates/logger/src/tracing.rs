use std::env::var;

use tracing::{level_filters::LevelFilter, warn};
use tracing_subscriber::{Layer, filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Output format of the log layer, read from `RUST_LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Compact,
        }
    }

    fn from_env() -> Self {
        var("RUST_LOG_FORMAT")
            .inspect_err(|error| {
                warn!("Failed to read RUST_LOG_FORMAT, falling back to default: {error}")
            })
            .map(|raw| Self::parse(&raw))
            .unwrap_or_default()
    }
}

pub fn init() {
    init_with_level(LevelFilter::INFO);
}

/// Initialize the global subscriber. `RUST_LOG` directives override `level`.
///
/// Safe to call more than once; later calls are ignored, which lets tests
/// initialize logging without coordinating.
pub fn init_with_level(level: LevelFilter) {
    let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();

    let log_layer = match LogFormat::from_env() {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().with_filter(env_filter).boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    };

    let _ = tracing_subscriber::registry().with(log_layer).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_formats() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::parse("compact"), LogFormat::Compact);
        assert_eq!(LogFormat::parse(""), LogFormat::Compact);
    }

    #[test]
    fn repeated_init_is_harmless() {
        init_with_level(LevelFilter::WARN);
        init_with_level(LevelFilter::DEBUG);
    }
}
