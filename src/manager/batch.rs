//! Batch table entries and producer-side result handles

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::models::{BatchId, BatchReport, JobId};

/// How a batch ended, as delivered to a waiting producer
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Finished(BatchReport),
    Cancelled,
}

/// An unresolved batch
#[derive(Debug)]
pub struct Batch {
    pub id: BatchId,
    /// Member jobs in submission order
    pub job_ids: Vec<JobId>,
    /// Jobs not yet in a terminal state
    pub pending: usize,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
    notifier: Option<oneshot::Sender<BatchOutcome>>,
}

impl Batch {
    /// Create a batch together with the handle its producer waits on
    pub fn new(id: BatchId, job_ids: Vec<JobId>, created_at: DateTime<Utc>) -> (Self, BatchHandle) {
        let (tx, rx) = oneshot::channel();
        let pending = job_ids.len();
        let batch = Self {
            id,
            job_ids,
            pending,
            cancelled: false,
            created_at,
            notifier: Some(tx),
        };
        (batch, BatchHandle { batch_id: id, rx })
    }

    /// A batch rebuilt from the store; nobody is waiting on it
    pub fn recovered(
        id: BatchId,
        job_ids: Vec<JobId>,
        pending: usize,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            job_ids,
            pending,
            cancelled: false,
            created_at,
            notifier: None,
        }
    }

    /// Deliver the outcome to the producer. Only the first call has any
    /// effect; later calls return false.
    pub fn resolve(&mut self, outcome: BatchOutcome) -> bool {
        match self.notifier.take() {
            Some(tx) => {
                // The producer may have stopped waiting; that is fine
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.notifier.is_none()
    }
}

/// Producer-side handle for one batch's final outcome
#[derive(Debug)]
pub struct BatchHandle {
    batch_id: BatchId,
    rx: oneshot::Receiver<BatchOutcome>,
}

impl BatchHandle {
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// Wait for the batch to finish or be cancelled. `None` if the
    /// coordinator stopped before resolving it.
    pub async fn wait(self) -> Option<BatchOutcome> {
        self.rx.await.ok()
    }
}
