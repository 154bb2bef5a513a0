//! Durable job store
//!
//! The task manager writes every batch and job-state change through a
//! [`JobStore`] before treating it as committed. On startup the store is
//! asked to [`recover`](JobStore::recover): in-flight jobs fall back to
//! `queued`, cancelled batches are purged, and whatever remains is handed
//! back so the pending queue and unresolved batches can be rebuilt.
//!
//! ```text
//! ┌──────────────┐   insert_batch / update_job / delete_jobs   ┌──────────────┐
//! │ TaskManager  │ ──────────────────────────────────────────▶ │   JobStore   │
//! │ (event loop) │ ◀────────────────────────────────────────── │ sqlite / mem │
//! └──────────────┘              recover() at startup           └──────────────┘
//! ```

pub mod memory;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{BatchId, Environ, JobId, JobOutcome, JobState};

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

/// Result type for store operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Store failures. All of them are fatal to the coordinator.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// Records
// ============================================================================

/// Persisted batch row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRecord {
    pub id: BatchId,
    pub created_at: DateTime<Utc>,
    pub cancelled: bool,
}

/// What a terminal job produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub outcome: JobOutcome,
    #[serde(default)]
    pub parameters: Environ,
}

/// Persisted job row
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: JobId,
    /// Global submission sequence; orders the pending queue
    pub seq: u64,
    pub batch_id: BatchId,
    pub kind: String,
    pub parameters: Environ,
    pub state: JobState,
    pub retries: u32,
    pub result: Option<StoredResult>,
}

/// Everything left in the store after recovery
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredState {
    pub batches: Vec<BatchRecord>,
    /// Ordered by `seq`
    pub jobs: Vec<JobRecord>,
}

impl StoredState {
    /// Jobs belonging to `batch`, in submission order
    pub fn jobs_of(&self, batch: BatchId) -> impl Iterator<Item = &JobRecord> {
        self.jobs.iter().filter(move |job| job.batch_id == batch)
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Durable storage for batches and jobs.
///
/// Only the task manager writes to the store, one call at a time, so
/// implementations need no internal locking for correctness.
pub trait JobStore: Send {
    /// Insert a batch and all of its jobs atomically
    fn insert_batch(&mut self, batch: &BatchRecord, jobs: &[JobRecord]) -> StorageResult<()>;

    /// Overwrite the mutable columns of one job (state, retries, result)
    fn update_job(&mut self, job: &JobRecord) -> StorageResult<()>;

    /// Remove jobs (queued jobs dropped by a cancel)
    fn delete_jobs(&mut self, ids: &[JobId]) -> StorageResult<()>;

    /// Flag a batch as cancelled
    fn mark_batch_cancelled(&mut self, batch: BatchId) -> StorageResult<()>;

    /// Delete a resolved batch and its jobs
    fn archive_batch(&mut self, batch: BatchId) -> StorageResult<()>;

    /// Normalize the store after a restart and return its contents
    fn recover(&mut self) -> StorageResult<StoredState>;
}

impl<S: JobStore + ?Sized> JobStore for Box<S> {
    fn insert_batch(&mut self, batch: &BatchRecord, jobs: &[JobRecord]) -> StorageResult<()> {
        (**self).insert_batch(batch, jobs)
    }

    fn update_job(&mut self, job: &JobRecord) -> StorageResult<()> {
        (**self).update_job(job)
    }

    fn delete_jobs(&mut self, ids: &[JobId]) -> StorageResult<()> {
        (**self).delete_jobs(ids)
    }

    fn mark_batch_cancelled(&mut self, batch: BatchId) -> StorageResult<()> {
        (**self).mark_batch_cancelled(batch)
    }

    fn archive_batch(&mut self, batch: BatchId) -> StorageResult<()> {
        (**self).archive_batch(batch)
    }

    fn recover(&mut self) -> StorageResult<StoredState> {
        (**self).recover()
    }
}
