//! In-memory job store
//!
//! Clones share the same state, so a test can hand one clone to a task
//! manager, drop the manager, and build a new one from another clone to
//! simulate a restart. Writes can be switched off to exercise persistence
//! failures.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{BatchRecord, JobRecord, JobStore, StorageError, StorageResult, StoredState};
use crate::models::{BatchId, JobId, JobState};

#[derive(Debug, Default)]
struct MemoryState {
    batches: BTreeMap<BatchId, BatchRecord>,
    jobs: BTreeMap<JobId, JobRecord>,
}

/// Volatile [`JobStore`] for tests and throwaway coordinators
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    state: Arc<Mutex<MemoryState>>,
    failing: Arc<AtomicBool>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail with [`StorageError::Unavailable`]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of stored jobs
    pub fn job_count(&self) -> usize {
        self.lock().map(|s| s.jobs.len()).unwrap_or(0)
    }

    /// Stored copy of one job
    pub fn job(&self, id: JobId) -> Option<JobRecord> {
        self.lock().ok().and_then(|s| s.jobs.get(&id).cloned())
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn writable(&self) -> StorageResult<MutexGuard<'_, MemoryState>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("writes disabled".to_string()));
        }
        self.lock()
    }
}

impl JobStore for MemoryJobStore {
    fn insert_batch(&mut self, batch: &BatchRecord, jobs: &[JobRecord]) -> StorageResult<()> {
        let mut state = self.writable()?;
        state.batches.insert(batch.id, batch.clone());
        for job in jobs {
            state.jobs.insert(job.id, job.clone());
        }
        Ok(())
    }

    fn update_job(&mut self, job: &JobRecord) -> StorageResult<()> {
        let mut state = self.writable()?;
        let stored = state
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| StorageError::Corrupt(format!("job {} is not stored", job.id)))?;
        stored.state = job.state;
        stored.retries = job.retries;
        stored.result = job.result.clone();
        Ok(())
    }

    fn delete_jobs(&mut self, ids: &[JobId]) -> StorageResult<()> {
        let mut state = self.writable()?;
        for id in ids {
            state.jobs.remove(id);
        }
        Ok(())
    }

    fn mark_batch_cancelled(&mut self, batch: BatchId) -> StorageResult<()> {
        let mut state = self.writable()?;
        if let Some(record) = state.batches.get_mut(&batch) {
            record.cancelled = true;
        }
        Ok(())
    }

    fn archive_batch(&mut self, batch: BatchId) -> StorageResult<()> {
        let mut state = self.writable()?;
        state.batches.remove(&batch);
        state.jobs.retain(|_, job| job.batch_id != batch);
        Ok(())
    }

    fn recover(&mut self) -> StorageResult<StoredState> {
        let mut state = self.writable()?;

        let cancelled: Vec<BatchId> = state
            .batches
            .values()
            .filter(|b| b.cancelled)
            .map(|b| b.id)
            .collect();
        state.jobs.retain(|_, job| !cancelled.contains(&job.batch_id));

        let MemoryState { batches, jobs } = &mut *state;
        batches.retain(|id, _| jobs.values().any(|job| job.batch_id == *id));

        for job in jobs.values_mut() {
            if job.state.is_in_flight() {
                job.state = JobState::Queued;
            }
        }

        let mut jobs: Vec<JobRecord> = jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.seq);
        let mut batches: Vec<BatchRecord> = batches.values().cloned().collect();
        batches.sort_by_key(|batch| batch.created_at);

        Ok(StoredState { batches, jobs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Environ;
    use chrono::Utc;

    #[test]
    fn test_clones_share_state() {
        let mut store = MemoryJobStore::new();
        let other = store.clone();
        let batch = BatchRecord {
            id: BatchId::new(),
            created_at: Utc::now(),
            cancelled: false,
        };
        let job = JobRecord {
            id: JobId::new(),
            seq: 0,
            batch_id: batch.id,
            kind: "ping".to_string(),
            parameters: Environ::new(),
            state: JobState::Running,
            retries: 0,
            result: None,
        };
        store.insert_batch(&batch, &[job.clone()]).unwrap();

        let mut reopened = other;
        let state = reopened.recover().unwrap();
        assert_eq!(state.jobs.len(), 1);
        assert_eq!(state.jobs[0].state, JobState::Queued);
    }

    #[test]
    fn test_failing_writes() {
        let mut store = MemoryJobStore::new();
        store.set_failing(true);
        let err = store.archive_batch(BatchId::new()).unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));
    }
}
