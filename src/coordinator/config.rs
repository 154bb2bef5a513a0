//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::DEFAULT_MAX_FRAME_BYTES;
use crate::scheduler::DEFAULT_POLICY;
use crate::utils::retry::RetryConfig;

pub const DEFAULT_WORKER_PORT: u16 = 7888;
pub const DEFAULT_RPC_PORT: u16 = 7889;

/// Configuration for the coordinator server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Address workers connect to
    pub worker_listen: SocketAddr,

    /// Address of the HTTP front door
    pub rpc_listen: SocketAddr,

    /// SQLite database file
    pub database_path: PathBuf,

    /// Scheduling policy name
    pub scheduler: String,

    /// Requeues allowed per job after worker loss
    pub max_retries: u32,

    /// Backoff before the first requeue; 0 requeues immediately
    pub retry_base_delay_ms: u64,

    pub retry_max_delay_ms: u64,

    /// Heartbeat interval announced to workers
    pub heartbeat_interval_secs: u64,

    /// Silence after which a worker is considered dead
    pub heartbeat_timeout_secs: u64,

    /// Time a new connection has to send its handshake
    pub handshake_timeout_secs: u64,

    /// Largest accepted wire frame
    pub max_frame_bytes: usize,

    /// Resolved batch statuses kept for polling
    pub finished_retention: usize,

    /// Enable request logging
    pub enable_request_logging: bool,

    /// Enable CORS for API
    pub enable_cors: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            worker_listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_WORKER_PORT)),
            rpc_listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_RPC_PORT)),
            database_path: PathBuf::from("judgeworks.db"),
            scheduler: DEFAULT_POLICY.to_string(),
            max_retries: 3,
            retry_base_delay_ms: 0,
            retry_max_delay_ms: 30_000,
            heartbeat_interval_secs: 10,
            heartbeat_timeout_secs: 30,
            handshake_timeout_secs: 10,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            finished_retention: 1024,
            enable_request_logging: true,
            enable_cors: false,
        }
    }
}

impl CoordinatorConfig {
    /// Create a new config builder
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "heartbeat_interval_secs",
                "Must be at least 1 second",
            ));
        }

        if self.heartbeat_timeout_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::invalid(
                "heartbeat_timeout_secs",
                "Timeout must be greater than interval",
            ));
        }

        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "handshake_timeout_secs",
                "Must be at least 1 second",
            ));
        }

        if self.scheduler.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "scheduler".to_string(),
            });
        }

        if self.max_frame_bytes == 0 {
            return Err(ConfigError::invalid("max_frame_bytes", "Must be positive"));
        }

        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(ConfigError::invalid(
                "retry_max_delay_ms",
                "Must not be smaller than retry_base_delay_ms",
            ));
        }

        Ok(())
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig::with_delays(
            self.max_retries,
            self.retry_base_delay_ms,
            self.retry_max_delay_ms,
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Builder for CoordinatorConfig
#[derive(Debug, Default)]
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    pub fn worker_listen(mut self, addr: SocketAddr) -> Self {
        self.config.worker_listen = addr;
        self
    }

    pub fn rpc_listen(mut self, addr: SocketAddr) -> Self {
        self.config.rpc_listen = addr;
        self
    }

    /// Set the worker listen address from a string
    pub fn worker_listen_str(mut self, addr: &str) -> Result<Self, ConfigError> {
        self.config.worker_listen = parse_addr("worker_listen", addr)?;
        Ok(self)
    }

    /// Set the RPC listen address from a string
    pub fn rpc_listen_str(mut self, addr: &str) -> Result<Self, ConfigError> {
        self.config.rpc_listen = parse_addr("rpc_listen", addr)?;
        Ok(self)
    }

    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.database_path = path.into();
        self
    }

    pub fn scheduler(mut self, name: impl Into<String>) -> Self {
        self.config.scheduler = name.into();
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Set retry backoff bounds in milliseconds
    pub fn retry_delays_ms(mut self, base: u64, max: u64) -> Self {
        self.config.retry_base_delay_ms = base;
        self.config.retry_max_delay_ms = max;
        self
    }

    pub fn heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.config.heartbeat_interval_secs = secs;
        self
    }

    pub fn heartbeat_timeout_secs(mut self, secs: u64) -> Self {
        self.config.heartbeat_timeout_secs = secs;
        self
    }

    pub fn handshake_timeout_secs(mut self, secs: u64) -> Self {
        self.config.handshake_timeout_secs = secs;
        self
    }

    pub fn max_frame_bytes(mut self, bytes: usize) -> Self {
        self.config.max_frame_bytes = bytes;
        self
    }

    pub fn finished_retention(mut self, count: usize) -> Self {
        self.config.finished_retention = count;
        self
    }

    /// Enable/disable request logging
    pub fn enable_request_logging(mut self, enable: bool) -> Self {
        self.config.enable_request_logging = enable;
        self
    }

    /// Enable/disable CORS
    pub fn enable_cors(mut self, enable: bool) -> Self {
        self.config.enable_cors = enable;
        self
    }

    /// Build the config
    pub fn build(self) -> Result<CoordinatorConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn parse_addr(field: &str, addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.parse()
        .map_err(|_| ConfigError::invalid(field, format!("Invalid address: {addr}")))
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Failed to read config file '{path}': {reason}")]
    Load { path: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
