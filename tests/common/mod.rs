//! Common test utilities

use std::net::SocketAddr;
use std::time::Duration;

use judgeworks::coordinator::{CoordinatorConfig, CoordinatorHandle, CoordinatorServer};
use judgeworks::models::{Capabilities, Environ, JobSpec};
use judgeworks::protocol::{
    CoordinatorMessage, Dispatch, FrameReader, FrameWriter, Handshake, JobResult, WorkerMessage,
    DEFAULT_MAX_FRAME_BYTES,
};
use judgeworks::storage::{JobStore, MemoryJobStore};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Coordinator config bound to ephemeral loopback ports
pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig::builder()
        .worker_listen_str("127.0.0.1:0")
        .unwrap()
        .rpc_listen_str("127.0.0.1:0")
        .unwrap()
        .enable_request_logging(false)
        .build()
        .unwrap()
}

pub fn ping(value: &str) -> JobSpec {
    JobSpec::new("ping", Environ::new().with("ping", value))
}

/// A coordinator serving on real sockets
pub struct TestCoordinator {
    pub worker_addr: SocketAddr,
    pub rpc_addr: SocketAddr,
    pub handle: CoordinatorHandle,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<judgeworks::Result<()>>,
}

impl TestCoordinator {
    pub async fn start(config: CoordinatorConfig) -> Self {
        Self::start_with_store(config, Box::new(MemoryJobStore::new())).await
    }

    pub async fn start_with_store(config: CoordinatorConfig, store: Box<dyn JobStore>) -> Self {
        let server = CoordinatorServer::with_store(config, store).unwrap();
        Self::serve(server).await
    }

    pub async fn serve(server: CoordinatorServer) -> Self {
        let bound = server.bind().await.unwrap();
        let worker_addr = bound.worker_addr();
        let rpc_addr = bound.rpc_addr();
        let handle = bound.handle();

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(bound.serve(async {
            let _ = rx.await;
        }));

        Self {
            worker_addr,
            rpc_addr,
            handle,
            shutdown: Some(tx),
            task,
        }
    }

    pub fn rpc_url(&self) -> String {
        format!("http://{}", self.rpc_addr)
    }

    pub async fn stop(mut self) -> judgeworks::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.unwrap()
    }
}

/// A worker speaking the wire protocol by hand
pub struct RawWorker {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
}

impl RawWorker {
    /// Connect and send a handshake; returns the coordinator's first reply
    pub async fn connect(
        addr: SocketAddr,
        name: &str,
        concurrency: u32,
        capabilities: &[&str],
    ) -> (Self, CoordinatorMessage) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, w) = stream.into_split();
        let mut worker = Self {
            reader: FrameReader::new(r, DEFAULT_MAX_FRAME_BYTES),
            writer: FrameWriter::new(w),
        };

        let capabilities: Capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        worker
            .send(&WorkerMessage::Handshake(Handshake::new(
                name,
                concurrency,
                capabilities,
            )))
            .await;
        let reply = worker.recv().await.expect("connection closed before reply");
        (worker, reply)
    }

    /// Connect and insist on a welcome
    pub async fn join(addr: SocketAddr, name: &str, concurrency: u32) -> Self {
        let (worker, reply) = Self::connect(addr, name, concurrency, &[]).await;
        assert!(
            matches!(reply, CoordinatorMessage::Welcome { .. }),
            "expected welcome, got {reply:?}"
        );
        worker
    }

    pub async fn send<T: serde::Serialize>(&mut self, record: &T) {
        self.writer.send(record).await.unwrap();
    }

    /// Next non-heartbeat record, or `None` once the coordinator hangs up
    pub async fn recv(&mut self) -> Option<CoordinatorMessage> {
        loop {
            match self.reader.next::<CoordinatorMessage>().await {
                Ok(Some(CoordinatorMessage::Heartbeat)) => continue,
                Ok(record) => return record,
                Err(_) => return None,
            }
        }
    }

    pub async fn next_dispatch(&mut self) -> Dispatch {
        match tokio::time::timeout(Duration::from_secs(5), self.recv()).await {
            Ok(Some(CoordinatorMessage::Dispatch(dispatch))) => dispatch,
            other => panic!("expected dispatch, got {other:?}"),
        }
    }

    /// Answer a dispatch with the ping executor's output
    pub async fn answer_ping(&mut self, dispatch: &Dispatch) {
        let mut parameters = dispatch.parameters.clone();
        if let Some(ping) = dispatch.parameters.get("ping").cloned() {
            parameters.insert("pong", ping);
        }
        parameters.insert("result_code", "OK");
        self.send(&WorkerMessage::Result(JobResult {
            job_id: dispatch.job_id,
            success: true,
            parameters,
        }))
        .await;
    }

    /// No dispatch arrives within `wait`
    pub async fn assert_idle(&mut self, wait: Duration) {
        if let Ok(record) = tokio::time::timeout(wait, self.recv()).await {
            panic!("expected no dispatch, got {record:?}");
        }
    }
}
