//! Coordinator server for distributed judging
//!
//! The coordinator accepts worker connections on one port and producer
//! requests on another, and runs every state change through a single
//! event loop.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              Coordinator Server              │
//! │                                              │
//! │  worker port ──► session tasks ──┐           │
//! │                                  ▼           │
//! │  ┌────────────────────────────────────────┐  │
//! │  │              Event Loop                │  │
//! │  │  - Worker registry + liveness sweep    │  │
//! │  │  - Task manager (queue, batches,       │  │
//! │  │    retries, durable store)             │  │
//! │  │  - Scheduling policy                   │  │
//! │  └────────────────────────────────────────┘  │
//! │                                  ▲           │
//! │  RPC port ──► REST API ──────────┘           │
//! │    POST   /api/batches                       │
//! │    GET    /api/batches/{id}                  │
//! │    DELETE /api/batches/{id}                  │
//! │    GET    /api/workers, /api/queue           │
//! │    GET    /api/health, /metrics              │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use judgeworks::coordinator::{CoordinatorConfig, CoordinatorServer};
//!
//! let config = CoordinatorConfig::default();
//! let server = CoordinatorServer::new(config)?;
//! server.run_until(shutdown_signal()).await?;
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod event_loop;
pub mod handle;
pub mod registry;
pub mod server;
pub mod session;

// Re-export main types
pub use client::{ClientConfig, ClientError, RpcClient};
pub use config::{ConfigError, CoordinatorConfig};
pub use event_loop::{Coordinator, CoordinatorStats, LoopSettings};
pub use handle::CoordinatorHandle;
pub use registry::{ConnectionId, WorkerInfo, WorkerRegistry, WorkerState};
pub use server::{BoundServer, CoordinatorServer, ServerInfo};
pub use session::SessionSettings;
