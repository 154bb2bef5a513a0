//! Wire records exchanged between the coordinator and its workers

use serde::{Deserialize, Serialize};

use crate::models::{Capabilities, Environ, JobId};

/// Records sent by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Handshake(Handshake),
    Result(JobResult),
    Heartbeat,
}

impl WorkerMessage {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "handshake",
            Self::Result(_) => "result",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Records sent by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    /// Handshake accepted
    Welcome { heartbeat_interval_secs: u64 },
    /// Handshake refused; the connection is closed after this record
    Rejected { reason: String },
    Dispatch(Dispatch),
    Heartbeat,
}

impl CoordinatorMessage {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Rejected { .. } => "rejected",
            Self::Dispatch(_) => "dispatch",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// First record on every worker connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub name: String,
    pub concurrency: u32,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl Handshake {
    pub fn new(name: impl Into<String>, concurrency: u32, capabilities: Capabilities) -> Self {
        Self {
            name: name.into(),
            concurrency,
            capabilities,
        }
    }

    /// Reject handshakes no worker entry can be built from
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("worker name must not be empty".to_string());
        }
        if self.concurrency == 0 {
            return Err("concurrency must be at least 1".to_string());
        }
        Ok(())
    }
}

/// A job handed to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    pub job_id: JobId,
    pub job_kind: String,
    pub parameters: Environ,
}

/// A worker's answer to one dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub success: bool,
    #[serde(default)]
    pub parameters: Environ,
}
