//! judgeworks - distributed judging coordinator
//!
//! A coordinator accepts batches of judging jobs from producers, keeps them
//! in a durable queue and hands them to connected workers according to a
//! pluggable scheduling policy. Workers run the jobs and report results;
//! jobs on workers that disappear are retried up to a limit.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`models`] - Core data structures and types
//! - [`catalog`] - Job kinds and batch validation
//! - [`protocol`] - Coordinator/worker wire protocol
//! - [`scheduler`] - Scheduling policies
//! - [`storage`] - Durable job store (SQLite, in-memory)
//! - [`manager`] - Job lifecycle, batches and retries
//! - [`coordinator`] - Event loop, worker sessions and the RPC front door
//! - [`worker`] - Worker process and job executors
//! - [`config`] - Configuration management and settings
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - Common utilities and helpers
//!
//! # Example
//!
//! ```no_run
//! use judgeworks::config::Config;
//! use judgeworks::coordinator::CoordinatorServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let server = CoordinatorServer::new(config.coordinator)?;
//!     server
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod models;
pub mod protocol;
pub mod scheduler;
pub mod storage;
pub mod utils;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::coordinator::{
        ClientConfig, CoordinatorConfig, CoordinatorHandle, CoordinatorServer, RpcClient,
    };
    pub use crate::error::{CoordinatorErrorTrait, Error, ErrorCategory, Result};
    pub use crate::models::{
        BatchId, BatchReport, BatchStatus, Environ, JobId, JobReport, JobSpec, JobState,
    };
    pub use crate::worker::{Executor, ExecutorRegistry, WorkerClient, WorkerConfig};
}

// Direct re-exports for convenience
pub use error::{Error, Result};
pub use models::{BatchId, BatchReport, Environ, JobId, JobSpec};
