use std::{env, fmt, fs, io, path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    ReadFailed { path: path::PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    WriteFailed { path: path::PathBuf, source: io::Error },

    #[error("failed to parse {path}: {source}")]
    ParseFailed { path: path::PathBuf, source: toml::de::Error },

    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),

    #[error("no config directory available (set XDG_CONFIG_HOME or HOME)")]
    ConfigPathUnavailable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub incident: IncidentConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: path::PathBuf,
    pub pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound of the random delay added to each sleep, spreading
    /// monitors that share an interval
    pub jitter_ms: u64,
    /// Probe timeout used when a monitor does not set one
    pub default_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentConfig {
    /// Incident API URL; incidents are disabled when unset
    pub endpoint: Option<String>,
    pub timeout_seconds: u64,
    pub region: String,
    pub updated_by: String,
    pub default_service_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub channel_capacity: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: path::PathBuf::from("uppe.db"), pool_size: 8 }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { jitter_ms: 1000, default_timeout_seconds: 30 }
    }
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_seconds: 30,
            region: "us-east-1".into(),
            updated_by: "uppe@system".into(),
            default_service_type: "General".into(),
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self { channel_capacity: 256 }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/uppe/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("uppe/config.toml"))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Database")?;
        write_1(f, "Path", &self.database.path.display())?;
        write_1(f, "Pool Size", &self.database.pool_size)?;

        write_title_1(f, "Scheduler")?;
        write_1(f, "Jitter (ms)", &self.scheduler.jitter_ms)?;
        write_1(f, "Default Timeout (s)", &self.scheduler.default_timeout_seconds)?;

        write_title_1(f, "Incident API")?;
        write_1(f, "Endpoint", &self.incident.endpoint.as_deref().unwrap_or("(disabled)"))?;
        write_1(f, "Timeout (s)", &self.incident.timeout_seconds)?;
        write_1(f, "Region", &self.incident.region)?;
        write_1(f, "Updated By", &self.incident.updated_by)?;
        write_1(f, "Default Service Type", &self.incident.default_service_type)?;

        write_title_1(f, "Publisher")?;
        write_1(f, "Channel Capacity", &self.publisher.channel_capacity)?;

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/uppe/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    ///
    /// ```rust,ignore
    /// let cfg = config::Config::from_config(None::<&path::Path>)?;
    /// println!("{}", cfg);
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        let config = if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| ConfigError::ReadFailed { path: config_path.clone(), source })?;
            toml::from_str(raw_string.as_str())
                .map_err(|source| ConfigError::ParseFailed { path: config_path.clone(), source })?
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            config
        };

        Ok(config.with_env_overrides(|name| env::var(name).ok()))
    }

    /// Apply `INCIDENT_API_URL`, `INCIDENT_UPDATED_BY` and
    /// `UPPE_DATABASE_PATH` on top of the file values
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("INCIDENT_API_URL") {
            self.incident.endpoint = Some(url);
        }
        if let Some(updated_by) = non_empty("INCIDENT_UPDATED_BY") {
            self.incident.updated_by = updated_by;
        }
        if let Some(path) = non_empty("UPPE_DATABASE_PATH") {
            self.database.path = path::PathBuf::from(path);
        }

        self
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| ConfigError::WriteFailed { path: parent.to_path_buf(), source })?;
        }

        fs::write(path, config_str).map_err(|source| ConfigError::WriteFailed { path: path.to_path_buf(), source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/uppe");

        let config = Config::from_config(Some(&path)).unwrap();
        assert_eq!(config.publisher.channel_capacity, 256);
        assert!(dir.path().join("nested/uppe.toml").exists());
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[incident]\nendpoint = \"https://incidents.example.com/api\"\n").unwrap();

        let config = Config::from_config(Some(&path)).unwrap();
        assert_eq!(config.incident.endpoint.as_deref(), Some("https://incidents.example.com/api"));
        assert_eq!(config.incident.timeout_seconds, 30);
        assert_eq!(config.database.pool_size, 8);
    }

    #[test]
    fn invalid_file_reports_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[database\npath = 1").unwrap();

        assert!(matches!(Config::from_config(Some(&path)), Err(ConfigError::ParseFailed { .. })));
    }

    #[test]
    fn environment_overrides_file_values() {
        let config = Config::default().with_env_overrides(|name| match name {
            "INCIDENT_API_URL" => Some("https://incidents.example.com".to_string()),
            "INCIDENT_UPDATED_BY" => Some("ops@example.com".to_string()),
            "UPPE_DATABASE_PATH" => Some("  ".to_string()),
            _ => None,
        });

        assert_eq!(config.incident.endpoint.as_deref(), Some("https://incidents.example.com"));
        assert_eq!(config.incident.updated_by, "ops@example.com");
        assert_eq!(config.database.path, path::PathBuf::from("uppe.db"));
    }

    #[test]
    fn display_lists_every_section() {
        let rendered = Config::default().to_string();
        for section in ["Database", "Scheduler", "Incident API", "Publisher", "(disabled)"] {
            assert!(rendered.contains(section), "missing {section}");
        }
    }
}
