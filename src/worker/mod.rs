//! Worker process
//!
//! Connects to the coordinator's worker port, announces its name,
//! concurrency and capabilities, then runs dispatched jobs through its
//! [`ExecutorRegistry`] and answers each with exactly one result. The
//! connection is re-established after a delay whenever it drops.

pub mod executor;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::coordinator::config::DEFAULT_WORKER_PORT;
use crate::models::Capabilities;
use crate::protocol::{
    CoordinatorMessage, FrameReader, FrameWriter, Handshake, ProtocolError, WorkerMessage,
    DEFAULT_MAX_FRAME_BYTES,
};

pub use crate::catalog::CPU_EXEC_CAPABILITY;
pub use executor::{Executor, ExecutorError, ExecutorRegistry, PingExecutor};

// ============================================================================
// Configuration
// ============================================================================

/// Worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Coordinator host name or address
    pub coordinator: String,

    /// Coordinator worker port
    pub port: u16,

    /// Name announced in the handshake; must be unique among live workers
    pub name: String,

    /// Jobs this worker runs at once
    pub concurrency: u32,

    pub capabilities: Capabilities,

    /// Delay before reconnecting after the connection drops
    pub reconnect_delay_secs: u64,

    pub max_frame_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator: "127.0.0.1".to_string(),
            port: DEFAULT_WORKER_PORT,
            name: default_worker_name(),
            concurrency: 1,
            capabilities: Capabilities::new(),
            reconnect_delay_secs: 5,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl WorkerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.coordinator, self.port)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn handshake(&self) -> Handshake {
        Handshake::new(
            self.name.clone(),
            self.concurrency,
            self.capabilities.clone(),
        )
    }
}

/// Host name from the environment, or "worker"
fn default_worker_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| "worker".to_string())
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("coordinator rejected this worker: {0}")]
    Rejected(String),

    #[error("invalid worker settings: {0}")]
    InvalidConfig(String),
}

// ============================================================================
// Worker Client
// ============================================================================

/// A worker connected (or reconnecting) to one coordinator
pub struct WorkerClient {
    config: WorkerConfig,
    executors: Arc<ExecutorRegistry>,
}

impl WorkerClient {
    pub fn new(config: WorkerConfig, executors: ExecutorRegistry) -> Result<Self, WorkerError> {
        config
            .handshake()
            .validate()
            .map_err(WorkerError::InvalidConfig)?;
        Ok(Self {
            config,
            executors: Arc::new(executors),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Connect once and serve until the connection ends
    pub async fn run_once(&self) -> Result<(), WorkerError> {
        let address = self.config.address();
        let stream = TcpStream::connect(&address)
            .await
            .map_err(|source| WorkerError::Connect {
                address: address.clone(),
                source,
            })?;
        stream.set_nodelay(true).ok();
        info!(address = %address, name = %self.config.name, "Connected to coordinator");
        self.serve(stream).await
    }

    /// Keep a connection to the coordinator until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                outcome = self.run_once() => match outcome {
                    Ok(()) => info!("Coordinator closed the connection"),
                    Err(e) => warn!(error = %e, "Worker connection ended"),
                },
            }

            debug!(delay_secs = self.config.reconnect_delay_secs, "Reconnecting");
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
            }
        }
        info!("Worker stopped");
    }

    /// Run the worker side of the protocol on an open stream
    pub async fn serve<S>(&self, stream: S) -> Result<(), WorkerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half, self.config.max_frame_bytes);
        let mut writer = FrameWriter::new(write_half);

        writer
            .send(&WorkerMessage::Handshake(self.config.handshake()))
            .await?;

        let heartbeat_secs = match reader.next::<CoordinatorMessage>().await? {
            Some(CoordinatorMessage::Welcome {
                heartbeat_interval_secs,
            }) => heartbeat_interval_secs.max(1),
            Some(CoordinatorMessage::Rejected { reason }) => {
                return Err(WorkerError::Rejected(reason))
            }
            Some(other) => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: "welcome",
                    got: other.kind_name(),
                }
                .into())
            }
            None => return Err(ProtocolError::Closed.into()),
        };
        info!(
            name = %self.config.name,
            concurrency = self.config.concurrency,
            heartbeat_secs,
            "Handshake accepted"
        );

        // Reads happen on their own task: a frame read is not safe to
        // abandon halfway through
        let (inbound_tx, inbound) = mpsc::channel(64);
        let reader_task = tokio::spawn(async move {
            loop {
                let record = reader.next::<CoordinatorMessage>().await;
                let more = matches!(record, Ok(Some(_)));
                if inbound_tx.send(record).await.is_err() || !more {
                    break;
                }
            }
        });

        let outcome = self
            .session(inbound, &mut writer, Duration::from_secs(heartbeat_secs))
            .await;
        reader_task.abort();
        outcome
    }

    async fn session<W>(
        &self,
        mut inbound: mpsc::Receiver<Result<Option<CoordinatorMessage>, ProtocolError>>,
        writer: &mut FrameWriter<W>,
        heartbeat_interval: Duration,
    ) -> Result<(), WorkerError>
    where
        W: AsyncWrite + Unpin,
    {
        let slots = Arc::new(Semaphore::new(self.config.concurrency as usize));
        let mut jobs = JoinSet::new();
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                record = inbound.recv() => match record {
                    Some(Ok(Some(CoordinatorMessage::Dispatch(dispatch)))) => {
                        debug!(job_id = %dispatch.job_id, kind = %dispatch.job_kind, "Job received");
                        let executors = Arc::clone(&self.executors);
                        let slots = Arc::clone(&slots);
                        jobs.spawn(async move {
                            let _permit = slots.acquire_owned().await.ok();
                            executors.run(dispatch).await
                        });
                    }
                    Some(Ok(Some(CoordinatorMessage::Heartbeat))) => {}
                    Some(Ok(Some(other))) => {
                        return Err(ProtocolError::UnexpectedMessage {
                            expected: "dispatch or heartbeat",
                            got: other.kind_name(),
                        }
                        .into())
                    }
                    Some(Ok(None)) | None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                },
                Some(joined) = jobs.join_next(), if !jobs.is_empty() => match joined {
                    Ok(result) => {
                        debug!(job_id = %result.job_id, success = result.success, "Job finished");
                        writer.send(&WorkerMessage::Result(result)).await?;
                    }
                    Err(e) => warn!(error = %e, "Job task failed"),
                },
                _ = heartbeat.tick() => {
                    writer.send(&WorkerMessage::Heartbeat).await?;
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Environ, JobId, OK_CODE};
    use crate::protocol::Dispatch;
    use tokio::io::DuplexStream;

    fn config(name: &str, concurrency: u32) -> WorkerConfig {
        WorkerConfig {
            name: name.to_string(),
            concurrency,
            ..WorkerConfig::default()
        }
    }

    struct FakeCoordinator {
        reader: FrameReader<tokio::io::ReadHalf<DuplexStream>>,
        writer: FrameWriter<tokio::io::WriteHalf<DuplexStream>>,
    }

    impl FakeCoordinator {
        fn new(stream: DuplexStream) -> Self {
            let (r, w) = tokio::io::split(stream);
            Self {
                reader: FrameReader::new(r, DEFAULT_MAX_FRAME_BYTES),
                writer: FrameWriter::new(w),
            }
        }

        async fn recv(&mut self) -> WorkerMessage {
            loop {
                match self.reader.next::<WorkerMessage>().await.unwrap().unwrap() {
                    WorkerMessage::Heartbeat => continue,
                    other => return other,
                }
            }
        }

        async fn send(&mut self, msg: CoordinatorMessage) {
            self.writer.send(&msg).await.unwrap();
        }
    }

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.port, 7888);
        assert_eq!(config.concurrency, 1);
        assert!(!config.name.is_empty());
        assert_eq!(config.address(), "127.0.0.1:7888");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = WorkerClient::new(config("w", 0), ExecutorRegistry::builtin()).err();
        assert!(matches!(err, Some(WorkerError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_handshake_then_ping() {
        let (worker_side, coordinator_side) = tokio::io::duplex(64 * 1024);
        let mut caps = Capabilities::new();
        caps.insert(CPU_EXEC_CAPABILITY.to_string());
        let client = WorkerClient::new(
            WorkerConfig {
                capabilities: caps,
                ..config("judge-01", 2)
            },
            ExecutorRegistry::builtin(),
        )
        .unwrap();
        let worker = tokio::spawn(async move { client.serve(worker_side).await });

        let mut coordinator = FakeCoordinator::new(coordinator_side);
        match coordinator.recv().await {
            WorkerMessage::Handshake(hs) => {
                assert_eq!(hs.name, "judge-01");
                assert_eq!(hs.concurrency, 2);
                assert!(hs.capabilities.contains(CPU_EXEC_CAPABILITY));
            }
            other => panic!("expected handshake, got {other:?}"),
        }
        coordinator
            .send(CoordinatorMessage::Welcome {
                heartbeat_interval_secs: 10,
            })
            .await;

        let job_id = JobId::new();
        coordinator
            .send(CoordinatorMessage::Dispatch(Dispatch {
                job_id,
                job_kind: "ping".to_string(),
                parameters: Environ::new().with("ping", "hello"),
            }))
            .await;

        match coordinator.recv().await {
            WorkerMessage::Result(result) => {
                assert_eq!(result.job_id, job_id);
                assert!(result.success);
                assert_eq!(result.parameters.get_str("pong"), Some("hello"));
                assert_eq!(result.parameters.get_str("result_code"), Some(OK_CODE));
            }
            other => panic!("expected result, got {other:?}"),
        }

        drop(coordinator);
        assert!(worker.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_rejected_handshake() {
        let (worker_side, coordinator_side) = tokio::io::duplex(64 * 1024);
        let client = WorkerClient::new(config("dup", 1), ExecutorRegistry::builtin()).unwrap();
        let worker = tokio::spawn(async move { client.serve(worker_side).await });

        let mut coordinator = FakeCoordinator::new(coordinator_side);
        assert!(matches!(coordinator.recv().await, WorkerMessage::Handshake(_)));
        coordinator
            .send(CoordinatorMessage::Rejected {
                reason: "worker name already connected".to_string(),
            })
            .await;

        let err = worker.await.unwrap().unwrap_err();
        assert!(matches!(err, WorkerError::Rejected(reason) if reason.contains("already")));
    }

    #[tokio::test]
    async fn test_every_dispatch_gets_one_result() {
        let (worker_side, coordinator_side) = tokio::io::duplex(64 * 1024);
        let client = WorkerClient::new(config("w", 1), ExecutorRegistry::builtin()).unwrap();
        let _worker = tokio::spawn(async move { client.serve(worker_side).await });

        let mut coordinator = FakeCoordinator::new(coordinator_side);
        coordinator.recv().await;
        coordinator
            .send(CoordinatorMessage::Welcome {
                heartbeat_interval_secs: 10,
            })
            .await;

        let mut sent = Vec::new();
        for (i, kind) in ["ping", "compile", "ping"].into_iter().enumerate() {
            let job_id = JobId::new();
            sent.push(job_id);
            coordinator
                .send(CoordinatorMessage::Dispatch(Dispatch {
                    job_id,
                    job_kind: kind.to_string(),
                    parameters: Environ::new().with("ping", i as i64),
                }))
                .await;
        }

        let mut received = Vec::new();
        for _ in 0..3 {
            match coordinator.recv().await {
                WorkerMessage::Result(result) => {
                    let is_compile = result.job_id == sent[1];
                    assert_eq!(result.success, !is_compile);
                    received.push(result.job_id);
                }
                other => panic!("expected result, got {other:?}"),
            }
        }
        received.sort_by_key(|id| id.to_string());
        sent.sort_by_key(|id| id.to_string());
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_unexpected_welcome_is_violation() {
        let (worker_side, coordinator_side) = tokio::io::duplex(64 * 1024);
        let client = WorkerClient::new(config("w", 1), ExecutorRegistry::builtin()).unwrap();
        let worker = tokio::spawn(async move { client.serve(worker_side).await });

        let mut coordinator = FakeCoordinator::new(coordinator_side);
        coordinator.recv().await;
        for _ in 0..2 {
            coordinator
                .send(CoordinatorMessage::Welcome {
                    heartbeat_interval_secs: 10,
                })
                .await;
        }

        let err = worker.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Protocol(ProtocolError::UnexpectedMessage { got: "welcome", .. })
        ));
    }
}
