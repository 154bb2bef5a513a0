//! Configuration management for judgeworks
//!
//! Settings come from a TOML file, then `JUDGEWORKS_*` environment
//! variables, then command-line flags, each layer overriding the last.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::coordinator::config::{ConfigError, CoordinatorConfig};
use crate::worker::WorkerConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Coordinator (`serve`) settings
    pub coordinator: CoordinatorConfig,

    /// Worker settings
    pub worker: WorkerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

impl Config {
    /// Defaults overridden by environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// File if given, else defaults, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `JUDGEWORKS_*` environment overrides
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        let coordinator = &mut self.coordinator;
        if let Some(addr) = env_parsed("JUDGEWORKS_WORKER_LISTEN")? {
            coordinator.worker_listen = addr;
        }
        if let Some(addr) = env_parsed("JUDGEWORKS_RPC_LISTEN")? {
            coordinator.rpc_listen = addr;
        }
        if let Ok(path) = std::env::var("JUDGEWORKS_DATABASE") {
            coordinator.database_path = path.into();
        }
        if let Ok(name) = std::env::var("JUDGEWORKS_SCHEDULER") {
            coordinator.scheduler = name;
        }
        if let Some(retries) = env_parsed("JUDGEWORKS_MAX_RETRIES")? {
            coordinator.max_retries = retries;
        }
        if let Some(secs) = env_parsed("JUDGEWORKS_HEARTBEAT_INTERVAL")? {
            coordinator.heartbeat_interval_secs = secs;
        }
        if let Some(secs) = env_parsed("JUDGEWORKS_HEARTBEAT_TIMEOUT")? {
            coordinator.heartbeat_timeout_secs = secs;
        }

        if let Ok(host) = std::env::var("JUDGEWORKS_COORDINATOR") {
            self.worker.coordinator = host;
        }
        if let Ok(name) = std::env::var("JUDGEWORKS_WORKER_NAME") {
            self.worker.name = name;
        }
        if let Some(concurrency) = env_parsed("JUDGEWORKS_CONCURRENCY")? {
            self.worker.concurrency = concurrency;
        }

        if let Ok(level) = std::env::var("JUDGEWORKS_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("JUDGEWORKS_LOG_FORMAT") {
            self.logging.format = format;
        }
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.coordinator.validate()?;

        if self.worker.concurrency == 0 {
            return Err(ConfigError::invalid(
                "worker.concurrency",
                "must be greater than 0",
            ));
        }
        if self.worker.name.trim().is_empty() {
            return Err(ConfigError::invalid("worker.name", "must not be empty"));
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(ConfigError::invalid(
                "logging.format",
                format!("expected 'text' or 'json', got '{}'", self.logging.format),
            ));
        }

        Ok(())
    }
}

fn env_parsed<T>(var: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::invalid(var, format!("'{raw}': {e}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_invalid_worker_concurrency() {
        let mut config = Config::default();
        config.worker.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[coordinator]
worker_listen = "127.0.0.1:9000"
scheduler = "least-loaded"
max_retries = 2

[worker]
name = "judge-07"
concurrency = 4
capabilities = ["cpu-exec"]

[logging]
format = "json"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.coordinator.worker_listen.port(), 9000);
        assert_eq!(config.coordinator.rpc_listen.port(), 7889);
        assert_eq!(config.coordinator.scheduler, "least-loaded");
        assert_eq!(config.worker.name, "judge-07");
        assert!(config.worker.capabilities.contains("cpu-exec"));
        assert_eq!(config.logging.format, "json");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file(Path::new("/nonexistent/judgeworks.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Load { .. }));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("JUDGEWORKS_MAX_RETRIES", "7");
        std::env::set_var("JUDGEWORKS_WORKER_NAME", "env-worker");
        let config = Config::from_env();
        std::env::remove_var("JUDGEWORKS_MAX_RETRIES");
        std::env::remove_var("JUDGEWORKS_WORKER_NAME");

        let config = config.unwrap();
        assert_eq!(config.coordinator.max_retries, 7);
        assert_eq!(config.worker.name, "env-worker");
    }

    #[test]
    #[serial]
    fn test_bad_env_value() {
        std::env::set_var("JUDGEWORKS_CONCURRENCY", "many");
        let result = Config::from_env();
        std::env::remove_var("JUDGEWORKS_CONCURRENCY");

        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
