//! Coordinator server implementation
//!
//! Wires the durable store, the scheduling policy and the task manager
//! into an event loop, then serves the worker port and the RPC front door.

use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::catalog::JobKindCatalog;
use crate::error::{Error, Result};
use crate::manager::{ManagerSettings, RecoveryReport, TaskManager};
use crate::scheduler::PolicyRegistry;
use crate::storage::{JobStore, SqliteJobStore};

use super::api::{create_router, AppState};
use super::config::CoordinatorConfig;
use super::event_loop::{Coordinator, LoopSettings};
use super::handle::CoordinatorHandle;
use super::session::{accept_loop, SessionSettings};

// ============================================================================
// Coordinator Server
// ============================================================================

/// Main coordinator server
pub struct CoordinatorServer {
    config: CoordinatorConfig,
    coordinator: Coordinator,
    handle: CoordinatorHandle,
    recovery: RecoveryReport,
}

impl CoordinatorServer {
    /// Open the SQLite store named in the config and recover its state
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        let store = SqliteJobStore::open(&config.database_path)?;
        Self::with_store(config, Box::new(store))
    }

    /// Build a server on an already opened store
    pub fn with_store(config: CoordinatorConfig, store: Box<dyn JobStore>) -> Result<Self> {
        config.validate()?;

        let policy = PolicyRegistry::with_defaults().create(&config.scheduler)?;
        let mut manager = TaskManager::new(
            store,
            policy,
            JobKindCatalog::builtin(),
            ManagerSettings {
                retry: config.retry(),
                finished_retention: config.finished_retention,
            },
        );
        let recovery = manager.recover()?;

        let (coordinator, handle) = Coordinator::new(
            manager,
            LoopSettings {
                heartbeat_timeout: config.heartbeat_timeout(),
                ..LoopSettings::default()
            },
        );

        Ok(Self {
            config,
            coordinator,
            handle,
            recovery,
        })
    }

    /// Handle for in-process producers
    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let mut router = create_router(AppState::new(self.handle.clone()));

        // Add CORS layer if enabled
        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        // Add tracing layer if enabled
        if self.config.enable_request_logging {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Bind both listeners
    pub async fn bind(self) -> Result<BoundServer> {
        let worker_listener = TcpListener::bind(self.config.worker_listen)
            .await
            .map_err(|e| {
                Error::with_source(format!("Failed to bind {}", self.config.worker_listen), e)
            })?;
        let rpc_listener = TcpListener::bind(self.config.rpc_listen)
            .await
            .map_err(|e| {
                Error::with_source(format!("Failed to bind {}", self.config.rpc_listen), e)
            })?;

        let router = self.build_router();
        let session = SessionSettings {
            handshake_timeout: self.config.handshake_timeout(),
            heartbeat_interval: self.config.heartbeat_interval(),
            max_frame_bytes: self.config.max_frame_bytes,
        };

        Ok(BoundServer {
            worker_addr: worker_listener.local_addr()?,
            rpc_addr: rpc_listener.local_addr()?,
            worker_listener,
            rpc_listener,
            router,
            session,
            coordinator: self.coordinator,
            handle: self.handle,
        })
    }

    /// Bind and serve until `shutdown` resolves or the event loop fails
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.bind().await?.serve(shutdown).await
    }

    /// Get server info
    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            worker_listen: self.config.worker_listen,
            rpc_listen: self.config.rpc_listen,
            database_path: self.config.database_path.display().to_string(),
            scheduler: self.config.scheduler.clone(),
            max_retries: self.config.max_retries,
            heartbeat_timeout_secs: self.config.heartbeat_timeout_secs,
            recovered_jobs: self.recovery.queued,
        }
    }
}

/// A server whose listeners are bound
pub struct BoundServer {
    worker_addr: SocketAddr,
    rpc_addr: SocketAddr,
    worker_listener: TcpListener,
    rpc_listener: TcpListener,
    router: Router,
    session: SessionSettings,
    coordinator: Coordinator,
    handle: CoordinatorHandle,
}

impl BoundServer {
    pub fn worker_addr(&self) -> SocketAddr {
        self.worker_addr
    }

    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    /// Serve until `shutdown` resolves or the event loop fails
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let BoundServer {
            worker_addr,
            rpc_addr,
            worker_listener,
            rpc_listener,
            router,
            session,
            coordinator,
            handle,
        } = self;
        info!(%worker_addr, %rpc_addr, "Coordinator listening");

        let (loop_stop, loop_stopped) = oneshot::channel::<()>();
        let mut event_loop = coordinator.spawn(loop_stopped);
        let acceptor = tokio::spawn(accept_loop(worker_listener, handle, session));

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let http = tokio::spawn(async move {
            axum::serve(rpc_listener, router)
                .with_graceful_shutdown(async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let (result, loop_finished) = tokio::select! {
            _ = shutdown => {
                info!("Shutdown requested");
                (Ok(()), false)
            }
            joined = &mut event_loop => (loop_exit(joined), true),
        };

        acceptor.abort();
        // Pending waits resolve as shutting down once the loop is gone
        let _ = loop_stop.send(());
        if !loop_finished {
            if let Err(e) = loop_exit(event_loop.await) {
                error!(error = %e, "Coordinator event loop failed during shutdown");
            }
        }
        let _ = stop_tx.send(());
        match http.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "RPC server error"),
            Err(e) => error!(error = %e, "RPC server task failed"),
        }

        info!("Coordinator server shutdown complete");
        result
    }
}

fn loop_exit(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(Error::with_source("Coordinator event loop panicked", e)),
    }
}

/// Server information
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub worker_listen: SocketAddr,
    pub rpc_listen: SocketAddr,
    pub database_path: String,
    pub scheduler: String,
    pub max_retries: u32,
    pub heartbeat_timeout_secs: u64,
    pub recovered_jobs: usize,
}

impl ServerInfo {
    /// Format as display string
    pub fn display(&self) -> String {
        format!(
            "Coordinator Server\n\
             {:-<40}\n\
             Worker Port: {}\n\
             RPC Address: {}\n\
             Database: {}\n\
             Scheduler: {}\n\
             Max Retries: {}\n\
             Heartbeat Timeout: {}s\n\
             Recovered Jobs: {}",
            "",
            self.worker_listen,
            self.rpc_listen,
            self.database_path,
            self.scheduler,
            self.max_retries,
            self.heartbeat_timeout_secs,
            self.recovered_jobs,
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
