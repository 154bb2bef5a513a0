//! Cloneable async facade over the coordinator event loop

use tokio::sync::{mpsc, oneshot};

use super::event_loop::{CoordinatorStats, Event};
use super::registry::{ConnectionId, WorkerInfo};
use super::session::WorkerSender;
use crate::error::{Error, Result};
use crate::manager::{BatchHandle, BatchOutcome, QueuedJob};
use crate::models::{BatchId, BatchStatus, CancelOutcome, JobSpec};
use crate::protocol::{Handshake, WorkerMessage};

/// Handle for talking to a running coordinator.
///
/// Every call is a message to the event loop; once the loop has stopped
/// they fail with [`Error::ShuttingDown`].
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Event>,
}

impl CoordinatorHandle {
    /// A handle together with the receiving end of its event queue
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Event) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Submit a batch. Fails with a validation error if any spec is
    /// malformed, in which case nothing was queued.
    pub async fn submit(&self, specs: Vec<JobSpec>) -> Result<BatchHandle> {
        self.request(|reply| Event::Submit { specs, reply }).await?
    }

    /// Submit a batch and wait until it is finished or cancelled
    pub async fn submit_and_wait(&self, specs: Vec<JobSpec>) -> Result<BatchOutcome> {
        let handle = self.submit(specs).await?;
        handle.wait().await.ok_or(Error::ShuttingDown)
    }

    pub async fn status(&self, batch_id: BatchId) -> Result<Option<BatchStatus>> {
        self.request(|reply| Event::Status { batch_id, reply }).await
    }

    pub async fn cancel(&self, batch_id: BatchId) -> Result<Option<CancelOutcome>> {
        self.request(|reply| Event::Cancel { batch_id, reply }).await?
    }

    pub async fn workers(&self) -> Result<Vec<WorkerInfo>> {
        self.request(|reply| Event::Workers { reply }).await
    }

    pub async fn queue(&self) -> Result<Vec<QueuedJob>> {
        self.request(|reply| Event::Queue { reply }).await
    }

    pub async fn stats(&self) -> Result<CoordinatorStats> {
        self.request(|reply| Event::Stats { reply }).await
    }

    pub(crate) async fn connect(
        &self,
        handshake: Handshake,
        outbound: WorkerSender,
    ) -> Result<ConnectionId> {
        self.request(|reply| Event::Connect {
            handshake,
            outbound,
            reply,
        })
        .await?
    }

    pub(crate) async fn worker_message(
        &self,
        worker: String,
        connection: ConnectionId,
        message: WorkerMessage,
    ) -> Result<()> {
        self.tx
            .send(Event::Message {
                worker,
                connection,
                message,
            })
            .await
            .map_err(|_| Error::ShuttingDown)
    }

    pub(crate) async fn disconnected(
        &self,
        worker: String,
        connection: ConnectionId,
        reason: String,
    ) {
        // Nothing to clean up once the loop is gone
        let _ = self
            .tx
            .send(Event::Disconnect {
                worker,
                connection,
                reason,
            })
            .await;
    }
}
