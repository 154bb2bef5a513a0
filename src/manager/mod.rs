//! Task manager: job lifecycle, batches, retries and recovery
//!
//! The task manager owns every job and batch. It is driven by the
//! coordinator event loop, one call at a time:
//!
//! - [`submit`](TaskManager::submit) validates a batch, persists it and
//!   queues its jobs
//! - [`dispatch`](TaskManager::dispatch) asks the scheduling policy for
//!   assignments until none is left and hands each job to its worker
//! - [`on_result`](TaskManager::on_result) records a job's outcome and
//!   resolves its batch once every job is terminal
//! - [`on_worker_lost`](TaskManager::on_worker_lost) requeues a lost
//!   worker's jobs or fails them permanently once retries run out
//! - [`cancel`](TaskManager::cancel) drops a batch's queued jobs
//!
//! Every state change is written to the [`JobStore`] before the call
//! returns. A store error is returned to the caller and must stop the
//! coordinator.

pub mod batch;
pub mod queue;

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::JobKindCatalog;
use crate::coordinator::registry::{ConnectionId, WorkerRegistry};
use crate::error::Result;
use crate::metrics;
use crate::models::{
    BatchId, BatchReport, BatchStatus, CancelOutcome, Capabilities, Environ, JobId, JobOutcome,
    JobReport, JobSpec, JobState, SYSTEM_ERROR_CODE,
};
use crate::protocol::{CoordinatorMessage, Dispatch, JobResult, ProtocolError};
use crate::scheduler::{check_assignment, Assignment, PendingJob, SchedulingPolicy};
use crate::storage::{BatchRecord, JobRecord, JobStore, StoredResult};
use crate::utils::retry::RetryConfig;

pub use batch::{Batch, BatchHandle, BatchOutcome};
pub use queue::PendingQueue;

// ============================================================================
// Settings
// ============================================================================

/// Task manager tuning
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Retry limit and backoff for jobs whose worker was lost
    pub retry: RetryConfig,

    /// Resolved batch statuses kept for polling
    pub finished_retention: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::with_delays(3, 0, 30_000),
            finished_retention: 1024,
        }
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// A job known to the task manager
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub seq: u64,
    pub batch_id: BatchId,
    pub kind: String,
    pub parameters: Environ,
    pub required_capabilities: Capabilities,
    pub state: JobState,
    pub retries: u32,
    /// Worker holding the job while it is in flight
    pub worker: Option<String>,
    /// Earliest time a requeued job may be dispatched again
    pub not_before: Option<Instant>,
    pub result: Option<StoredResult>,
}

impl Job {
    fn from_record(record: JobRecord) -> Self {
        Self {
            id: record.id,
            seq: record.seq,
            batch_id: record.batch_id,
            kind: record.kind,
            parameters: record.parameters,
            required_capabilities: Capabilities::new(),
            state: record.state,
            retries: record.retries,
            worker: None,
            not_before: None,
            result: record.result,
        }
    }

    fn record(&self) -> JobRecord {
        JobRecord {
            id: self.id,
            seq: self.seq,
            batch_id: self.batch_id,
            kind: self.kind.clone(),
            parameters: self.parameters.clone(),
            state: self.state,
            retries: self.retries,
            result: self.result.clone(),
        }
    }

    fn is_eligible(&self, now: Instant) -> bool {
        self.state == JobState::Queued && self.not_before.map_or(true, |t| t <= now)
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow
    fn transition(&mut self, next: JobState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            warn!(job_id = %self.id, from = %self.state, to = %next, "Illegal job state transition");
            false
        }
    }

    fn into_report(self) -> JobReport {
        let (outcome, parameters) = match self.result {
            Some(result) => (result.outcome, result.parameters),
            None => (JobOutcome::permanent_failure(self.retries), Environ::new()),
        };
        JobReport {
            job_id: self.id,
            kind: self.kind,
            state: self.state,
            retries: self.retries,
            result_code: outcome.result_code,
            result_string: outcome.result_string,
            result_percentage: outcome.result_percentage,
            parameters,
        }
    }
}

/// What happened to a worker's result
#[derive(Debug)]
pub enum ResultDisposition {
    /// Outcome stored; `batch_finished` if it was the batch's last job
    Recorded { batch_finished: bool },
    /// The job's batch was cancelled; result dropped
    Discarded,
    /// The result did not match a job running on that connection
    Violation(ProtocolError),
}

/// Queue entry for introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub batch_id: BatchId,
    pub kind: String,
    pub retries: u32,
    /// Milliseconds until a backed-off job becomes eligible again
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred_ms: Option<u64>,
}

/// Task manager counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    pub queued: usize,
    pub in_flight: usize,
    pub open_batches: usize,
    pub finished_batches: usize,
}

/// Result of rebuilding state from the store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub batches: usize,
    pub queued: usize,
    pub resolved: usize,
}

enum Handoff {
    Started,
    Failed,
    NoSlot,
}

// ============================================================================
// Task Manager
// ============================================================================

pub struct TaskManager {
    store: Box<dyn JobStore>,
    policy: Box<dyn SchedulingPolicy>,
    catalog: JobKindCatalog,
    settings: ManagerSettings,
    jobs: HashMap<JobId, Job>,
    batches: HashMap<BatchId, Batch>,
    queue: PendingQueue,
    finished: HashMap<BatchId, BatchStatus>,
    finished_order: VecDeque<BatchId>,
    next_seq: u64,
}

impl TaskManager {
    pub fn new(
        store: Box<dyn JobStore>,
        policy: Box<dyn SchedulingPolicy>,
        catalog: JobKindCatalog,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            store,
            policy,
            catalog,
            settings,
            jobs: HashMap::new(),
            batches: HashMap::new(),
            queue: PendingQueue::new(),
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
            next_seq: 0,
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Rebuild the queue and open batches from the store.
    ///
    /// Must run once, before any other call. Jobs that were in flight come
    /// back as queued; batches whose jobs are all terminal are resolved
    /// immediately.
    pub fn recover(&mut self) -> Result<RecoveryReport> {
        let state = self.store.recover()?;
        let mut report = RecoveryReport::default();

        for batch in &state.batches {
            let mut job_ids = Vec::new();
            let mut pending = 0;

            for record in state.jobs_of(batch.id) {
                self.next_seq = self.next_seq.max(record.seq + 1);
                let mut job = Job::from_record(record.clone());

                if !job.state.is_terminal() {
                    let spec = JobSpec::new(job.kind.clone(), job.parameters.clone());
                    match self.catalog.validate(job_ids.len(), &spec) {
                        Ok(capabilities) => {
                            job.required_capabilities = capabilities;
                            self.queue.push(job.seq, job.id);
                            pending += 1;
                            report.queued += 1;
                        }
                        Err(e) => {
                            warn!(job_id = %job.id, error = %e, "Stored job no longer valid, failing it");
                            job.state = JobState::Failed;
                            job.result = Some(StoredResult {
                                outcome: JobOutcome {
                                    result_code: SYSTEM_ERROR_CODE.to_string(),
                                    result_string: Some(e.to_string()),
                                    result_percentage: None,
                                },
                                parameters: Environ::new(),
                            });
                            self.store.update_job(&job.record())?;
                        }
                    }
                }

                job_ids.push(job.id);
                self.jobs.insert(job.id, job);
            }

            self.batches.insert(
                batch.id,
                Batch::recovered(batch.id, job_ids, pending, batch.created_at),
            );
            report.batches += 1;

            if pending == 0 {
                self.finish_batch(batch.id)?;
                report.resolved += 1;
            }
        }

        info!(
            batches = report.batches,
            queued = report.queued,
            resolved = report.resolved,
            "Recovered task state"
        );
        Ok(report)
    }

    /// Validate, persist and queue a batch.
    ///
    /// Nothing is queued if any spec is invalid. The returned handle
    /// resolves once every job is terminal or the batch is cancelled.
    pub fn submit(&mut self, specs: Vec<JobSpec>) -> Result<BatchHandle> {
        let capabilities = self.catalog.validate_batch(&specs)?;

        let batch_id = BatchId::new();
        let created_at = Utc::now();
        let mut jobs = Vec::with_capacity(specs.len());
        for (spec, required_capabilities) in specs.into_iter().zip(capabilities) {
            jobs.push(Job {
                id: JobId::new(),
                seq: self.next_seq,
                batch_id,
                kind: spec.kind,
                parameters: spec.parameters,
                required_capabilities,
                state: JobState::Queued,
                retries: 0,
                worker: None,
                not_before: None,
                result: None,
            });
            self.next_seq += 1;
        }

        let records: Vec<JobRecord> = jobs.iter().map(Job::record).collect();
        self.store.insert_batch(
            &BatchRecord {
                id: batch_id,
                created_at,
                cancelled: false,
            },
            &records,
        )?;

        let (batch, handle) = Batch::new(batch_id, jobs.iter().map(|j| j.id).collect(), created_at);
        for job in jobs {
            self.queue.push(job.seq, job.id);
            self.jobs.insert(job.id, job);
        }
        self.batches.insert(batch_id, batch);

        info!(batch_id = %batch_id, jobs = records.len(), "Batch accepted");
        Ok(handle)
    }

    /// Dispatch until the policy finds no further assignment.
    ///
    /// Returns the number of jobs handed to workers.
    pub fn dispatch(&mut self, registry: &mut WorkerRegistry, now: Instant) -> Result<usize> {
        let mut dispatched = 0;

        while let Some(assignment) = self.next_assignment(registry, now) {
            match self.start_job(registry, assignment)? {
                Handoff::Started => dispatched += 1,
                Handoff::Failed => {}
                Handoff::NoSlot => break,
            }
        }

        Ok(dispatched)
    }

    fn next_assignment(&self, registry: &WorkerRegistry, now: Instant) -> Option<Assignment> {
        if self.queue.is_empty() {
            return None;
        }

        let workers = registry.list_available(&Capabilities::new());
        if workers.is_empty() {
            return None;
        }

        let pending: Vec<PendingJob<'_>> = self
            .queue
            .iter()
            .filter_map(|id| self.jobs.get(&id))
            .filter(|job| job.is_eligible(now))
            .map(|job| PendingJob {
                id: job.id,
                kind: &job.kind,
                required_capabilities: &job.required_capabilities,
            })
            .collect();

        let assignment = self.policy.select_assignment(&workers, &pending)?;
        match check_assignment(self.policy.as_ref(), &assignment, &workers, &pending) {
            Ok(()) => Some(assignment),
            Err(e) => {
                warn!(error = %e, "Discarding scheduler assignment");
                None
            }
        }
    }

    fn start_job(
        &mut self,
        registry: &mut WorkerRegistry,
        assignment: Assignment,
    ) -> Result<Handoff> {
        let Assignment { job_id, worker } = assignment;

        if !registry.reserve_slot(&worker, job_id) {
            warn!(job_id = %job_id, worker = %worker, "Assigned worker has no free slot");
            return Ok(Handoff::NoSlot);
        }

        let Some(job) = self.jobs.get_mut(&job_id) else {
            registry.release_slot(&worker, job_id);
            return Ok(Handoff::NoSlot);
        };

        self.queue.remove(job_id);
        job.transition(JobState::Assigned);
        job.worker = Some(worker.clone());
        job.not_before = None;
        self.store.update_job(&job.record())?;

        let message = CoordinatorMessage::Dispatch(Dispatch {
            job_id,
            job_kind: job.kind.clone(),
            parameters: job.parameters.clone(),
        });

        if !registry.send(&worker, message) {
            warn!(job_id = %job_id, worker = %worker, "Dispatch hand-off failed, requeueing");
            registry.release_slot(&worker, job_id);
            registry.mark_suspected(&worker);
            job.transition(JobState::Queued);
            job.worker = None;
            self.queue.push(job.seq, job_id);
            self.store.update_job(&job.record())?;
            return Ok(Handoff::Failed);
        }

        job.transition(JobState::Running);
        self.store.update_job(&job.record())?;
        metrics::record_dispatch();
        debug!(job_id = %job_id, worker = %worker, kind = %job.kind, "Job dispatched");

        Ok(Handoff::Started)
    }

    /// Apply a worker's result for one job
    pub fn on_result(
        &mut self,
        registry: &mut WorkerRegistry,
        worker: &str,
        connection: ConnectionId,
        result: JobResult,
    ) -> Result<ResultDisposition> {
        let job_id = result.job_id;
        if !registry.holds(worker, connection, job_id) {
            return Ok(ResultDisposition::Violation(ProtocolError::UnknownJob(job_id)));
        }
        registry.release_slot(worker, job_id);

        let Some(batch_id) = self.jobs.get(&job_id).map(|job| job.batch_id) else {
            return Ok(ResultDisposition::Discarded);
        };
        if self.is_cancelled(batch_id) {
            debug!(job_id = %job_id, batch_id = %batch_id, "Discarding result of cancelled batch");
            self.drop_cancelled_job(job_id)?;
            return Ok(ResultDisposition::Discarded);
        }

        let outcome = JobOutcome::from_result(result.success, &result.parameters);
        metrics::record_completion(&outcome.result_code);

        if let Some(job) = self.jobs.get_mut(&job_id) {
            let next = if result.success {
                JobState::Done
            } else {
                JobState::Failed
            };
            job.transition(next);
            job.worker = None;
            info!(
                job_id = %job_id,
                worker = %worker,
                result_code = %outcome.result_code,
                "Job finished"
            );
            job.result = Some(StoredResult {
                outcome,
                parameters: result.parameters,
            });
            self.store.update_job(&job.record())?;
        }

        let batch_finished = self.job_resolved(batch_id)?;
        Ok(ResultDisposition::Recorded { batch_finished })
    }

    /// Handle jobs that were in flight on a worker that disconnected or
    /// timed out
    pub fn on_worker_lost<I>(&mut self, job_ids: I, now: Instant) -> Result<()>
    where
        I: IntoIterator<Item = JobId>,
    {
        for job_id in job_ids {
            let Some(batch_id) = self
                .jobs
                .get(&job_id)
                .filter(|job| job.state.is_in_flight())
                .map(|job| job.batch_id)
            else {
                continue;
            };

            if self.is_cancelled(batch_id) {
                self.drop_cancelled_job(job_id)?;
                continue;
            }

            let Some(job) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            job.retries += 1;
            job.worker = None;

            if self.settings.retry.allows(job.retries) {
                job.transition(JobState::Queued);
                let delay = self.settings.retry.delay_for(job.retries);
                job.not_before = (!delay.is_zero()).then(|| now + delay);
                self.queue.push(job.seq, job_id);
                self.store.update_job(&job.record())?;
                metrics::record_retry();
                info!(
                    job_id = %job_id,
                    retries = job.retries,
                    delay_ms = delay.as_millis() as u64,
                    "Requeued job after worker loss"
                );
            } else {
                job.transition(JobState::Failed);
                job.result = Some(StoredResult {
                    outcome: JobOutcome::permanent_failure(job.retries),
                    parameters: Environ::new(),
                });
                self.store.update_job(&job.record())?;
                metrics::record_permanent_failure();
                warn!(job_id = %job_id, retries = job.retries, "Job failed permanently");
                self.job_resolved(batch_id)?;
            }
        }
        Ok(())
    }

    /// Cancel a batch. Queued jobs are dropped at once; in-flight jobs run
    /// to completion and their results are discarded.
    ///
    /// Returns `None` for unknown batches.
    pub fn cancel(&mut self, batch_id: BatchId) -> Result<Option<CancelOutcome>> {
        if self.finished.contains_key(&batch_id) {
            return Ok(Some(CancelOutcome::AlreadyFinished));
        }
        let Some(batch) = self.batches.get(&batch_id) else {
            return Ok(None);
        };

        let mut dropped = Vec::new();
        let mut in_flight = Vec::new();
        let mut removed = 0;
        for id in &batch.job_ids {
            match self.jobs.get(id).map(|job| job.state) {
                Some(state) if state.is_in_flight() => in_flight.push(*id),
                Some(state) => {
                    if state == JobState::Queued {
                        removed += 1;
                    }
                    dropped.push(*id);
                }
                None => {}
            }
        }

        self.store.mark_batch_cancelled(batch_id)?;
        if in_flight.is_empty() {
            self.store.archive_batch(batch_id)?;
        } else {
            self.store.delete_jobs(&dropped)?;
        }

        for id in &dropped {
            self.queue.remove(*id);
            self.jobs.remove(id);
        }

        let in_flight_count = in_flight.len();
        if in_flight.is_empty() {
            if let Some(mut batch) = self.batches.remove(&batch_id) {
                batch.resolve(BatchOutcome::Cancelled);
            }
        } else if let Some(batch) = self.batches.get_mut(&batch_id) {
            batch.cancelled = true;
            batch.job_ids = in_flight;
            batch.resolve(BatchOutcome::Cancelled);
        }
        self.remember(batch_id, BatchStatus::Cancelled);

        info!(
            batch_id = %batch_id,
            removed,
            in_flight = in_flight_count,
            "Batch cancelled"
        );
        Ok(Some(CancelOutcome::Cancelled {
            removed,
            in_flight: in_flight_count,
        }))
    }

    /// Status of a batch, `None` if unknown or long forgotten
    pub fn status(&self, batch_id: BatchId) -> Option<BatchStatus> {
        if let Some(status) = self.finished.get(&batch_id) {
            return Some(status.clone());
        }
        self.batches.get(&batch_id).map(|batch| {
            if batch.cancelled {
                BatchStatus::Cancelled
            } else {
                BatchStatus::Pending {
                    remaining: batch.pending,
                }
            }
        })
    }

    /// Queued jobs in queue order
    pub fn queue_snapshot(&self, now: Instant) -> Vec<QueuedJob> {
        self.queue
            .iter()
            .filter_map(|id| self.jobs.get(&id))
            .map(|job| QueuedJob {
                job_id: job.id,
                batch_id: job.batch_id,
                kind: job.kind.clone(),
                retries: job.retries,
                deferred_ms: job
                    .not_before
                    .filter(|t| *t > now)
                    .map(|t| t.saturating_duration_since(now).as_millis() as u64),
            })
            .collect()
    }

    /// Earliest time a backed-off job becomes eligible
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        self.queue
            .iter()
            .filter_map(|id| self.jobs.get(&id))
            .filter_map(|job| job.not_before)
            .filter(|t| *t > now)
            .min()
    }

    /// (job, worker) for every in-flight job
    pub fn in_flight(&self) -> Vec<(JobId, String)> {
        self.jobs
            .values()
            .filter(|job| job.state.is_in_flight())
            .filter_map(|job| job.worker.clone().map(|w| (job.id, w)))
            .collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            queued: self.queue.len(),
            in_flight: self
                .jobs
                .values()
                .filter(|job| job.state.is_in_flight())
                .count(),
            open_batches: self.batches.len(),
            finished_batches: self.finished.len(),
        }
    }

    fn is_cancelled(&self, batch_id: BatchId) -> bool {
        self.batches.get(&batch_id).map_or(true, |b| b.cancelled)
    }

    /// Forget a job of a cancelled batch; archive the batch with its last job
    fn drop_cancelled_job(&mut self, job_id: JobId) -> Result<()> {
        let Some(job) = self.jobs.remove(&job_id) else {
            return Ok(());
        };

        let drained = match self.batches.get_mut(&job.batch_id) {
            Some(batch) => {
                batch.job_ids.retain(|id| *id != job_id);
                batch.job_ids.is_empty()
            }
            None => false,
        };

        if drained {
            self.store.archive_batch(job.batch_id)?;
            self.batches.remove(&job.batch_id);
            debug!(batch_id = %job.batch_id, "Cancelled batch drained");
        } else {
            self.store.delete_jobs(&[job_id])?;
        }
        Ok(())
    }

    /// Count one more terminal job; finish the batch if it was the last
    fn job_resolved(&mut self, batch_id: BatchId) -> Result<bool> {
        let Some(batch) = self.batches.get_mut(&batch_id) else {
            return Ok(false);
        };
        batch.pending = batch.pending.saturating_sub(1);
        if batch.pending > 0 {
            return Ok(false);
        }
        self.finish_batch(batch_id)?;
        Ok(true)
    }

    fn finish_batch(&mut self, batch_id: BatchId) -> Result<()> {
        self.store.archive_batch(batch_id)?;

        let Some(mut batch) = self.batches.remove(&batch_id) else {
            return Ok(());
        };
        let jobs: Vec<JobReport> = batch
            .job_ids
            .iter()
            .filter_map(|id| self.jobs.remove(id))
            .map(Job::into_report)
            .collect();

        let report = BatchReport {
            batch_id,
            finished_at: Utc::now(),
            jobs,
        };
        info!(
            batch_id = %batch_id,
            jobs = report.jobs.len(),
            failed = report.failed_count(),
            "Batch finished"
        );

        self.remember(batch_id, BatchStatus::Finished {
            report: report.clone(),
        });
        batch.resolve(BatchOutcome::Finished(report));
        Ok(())
    }

    fn remember(&mut self, batch_id: BatchId, status: BatchStatus) {
        if self.settings.finished_retention == 0 {
            return;
        }
        if self.finished.insert(batch_id, status).is_none() {
            self.finished_order.push_back(batch_id);
        }
        while self.finished_order.len() > self.settings.finished_retention {
            if let Some(old) = self.finished_order.pop_front() {
                self.finished.remove(&old);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::session::Outbound;
    use crate::models::OK_CODE;
    use crate::protocol::Handshake;
    use crate::scheduler::FifoFirstFit;
    use crate::storage::{MemoryJobStore, StorageError};
    use crate::Error;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn manager_with(store: MemoryJobStore, retry: RetryConfig) -> TaskManager {
        TaskManager::new(
            Box::new(store),
            Box::new(FifoFirstFit),
            JobKindCatalog::builtin(),
            ManagerSettings {
                retry,
                finished_retention: 16,
            },
        )
    }

    fn manager() -> TaskManager {
        manager_with(MemoryJobStore::new(), RetryConfig::with_delays(2, 0, 0))
    }

    fn connect(
        registry: &mut WorkerRegistry,
        name: &str,
        concurrency: u32,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = registry.next_connection_id();
        registry
            .register(
                &Handshake::new(name, concurrency, Capabilities::new()),
                conn,
                tx,
                Instant::now(),
            )
            .unwrap();
        registry.activate(name);
        (conn, rx)
    }

    fn dispatched(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Dispatch> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Outbound::Message(CoordinatorMessage::Dispatch(d)) = msg {
                out.push(d);
            }
        }
        out
    }

    fn ping() -> JobSpec {
        JobSpec::new("ping", Environ::new().with("ping", "x"))
    }

    fn ok_result(job_id: JobId) -> JobResult {
        JobResult {
            job_id,
            success: true,
            parameters: Environ::new().with("result_code", OK_CODE),
        }
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let mut tm = manager();
        let mut registry = WorkerRegistry::new();
        let (conn, mut rx) = connect(&mut registry, "w1", 1);

        let handle = tm.submit(vec![ping()]).unwrap();
        assert_eq!(tm.dispatch(&mut registry, Instant::now()).unwrap(), 1);

        let sent = dispatched(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].job_kind, "ping");

        let disposition = tm
            .on_result(&mut registry, "w1", conn, ok_result(sent[0].job_id))
            .unwrap();
        assert!(matches!(
            disposition,
            ResultDisposition::Recorded { batch_finished: true }
        ));
        assert_eq!(registry.get("w1").unwrap().used_slots(), 0);

        match handle.wait().await {
            Some(BatchOutcome::Finished(report)) => {
                assert_eq!(report.jobs.len(), 1);
                assert_eq!(report.jobs[0].result_code, OK_CODE);
                assert_eq!(report.jobs[0].state, JobState::Done);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_concurrency_limits_running_jobs() {
        let mut tm = manager();
        let mut registry = WorkerRegistry::new();
        let (conn, mut rx) = connect(&mut registry, "w1", 1);

        let batch = tm.submit(vec![ping(), ping(), ping()]).unwrap().batch_id();

        for remaining in (0..3).rev() {
            assert_eq!(tm.dispatch(&mut registry, Instant::now()).unwrap(), 1);
            assert_eq!(tm.in_flight().len(), 1);
            assert_eq!(tm.dispatch(&mut registry, Instant::now()).unwrap(), 0);

            let sent = dispatched(&mut rx);
            tm.on_result(&mut registry, "w1", conn, ok_result(sent[0].job_id))
                .unwrap();
            if remaining > 0 {
                assert_eq!(tm.status(batch), Some(BatchStatus::Pending { remaining }));
            }
        }

        assert!(matches!(tm.status(batch), Some(BatchStatus::Finished { .. })));
    }

    #[test]
    fn test_jobs_dispatched_in_submission_order() {
        let mut tm = manager();
        let mut registry = WorkerRegistry::new();
        let (_conn, mut rx) = connect(&mut registry, "w1", 4);

        tm.submit(vec![
            JobSpec::new("ping", Environ::new().with("n", 0)),
            JobSpec::new("ping", Environ::new().with("n", 1)),
        ])
        .unwrap();
        tm.submit(vec![JobSpec::new("ping", Environ::new().with("n", 2))])
            .unwrap();
        tm.dispatch(&mut registry, Instant::now()).unwrap();

        let order: Vec<f64> = dispatched(&mut rx)
            .iter()
            .filter_map(|d| d.parameters.get_f64("n"))
            .collect();
        assert_eq!(order, vec![0.0, 1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_worker_loss_retries_then_fails() {
        let mut tm = manager();
        let mut registry = WorkerRegistry::new();
        let handle = tm.submit(vec![ping()]).unwrap();

        for attempt in 0..3 {
            let name = format!("w{attempt}");
            let (conn, mut rx) = connect(&mut registry, &name, 1);
            assert_eq!(tm.dispatch(&mut registry, Instant::now()).unwrap(), 1);
            assert_eq!(dispatched(&mut rx).len(), 1);

            let lost = registry.unregister(&name, conn).unwrap();
            tm.on_worker_lost(lost.running, Instant::now()).unwrap();
        }

        match handle.wait().await {
            Some(BatchOutcome::Finished(report)) => {
                let job = &report.jobs[0];
                assert_eq!(job.state, JobState::Failed);
                assert_eq!(job.result_code, SYSTEM_ERROR_CODE);
                assert_eq!(job.retries, 3);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(tm.in_flight().is_empty());
        assert_eq!(tm.stats().queued, 0);
    }

    #[test]
    fn test_lost_job_returns_to_queue() {
        let mut tm = manager();
        let mut registry = WorkerRegistry::new();
        let (conn, _rx) = connect(&mut registry, "w1", 2);
        tm.submit(vec![ping(), ping()]).unwrap();
        assert_eq!(tm.dispatch(&mut registry, Instant::now()).unwrap(), 2);

        let lost = registry.unregister("w1", conn).unwrap();
        assert_eq!(lost.running.len(), 2);
        tm.on_worker_lost(lost.running, Instant::now()).unwrap();

        let queued = tm.queue_snapshot(Instant::now());
        assert_eq!(queued.len(), 2);
        assert!(queued.iter().all(|q| q.retries == 1));
        assert!(tm.in_flight().is_empty());
    }

    #[test]
    fn test_validation_error_leaves_queue_untouched() {
        let mut tm = manager();
        let err = tm
            .submit(vec![ping(), JobSpec::new("compile", Environ::new())])
            .err()
            .unwrap();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(tm.stats().queued, 0);
        assert_eq!(tm.stats().open_batches, 0);
    }

    #[test]
    fn test_result_from_wrong_connection_is_violation() {
        let mut tm = manager();
        let mut registry = WorkerRegistry::new();
        let (conn, mut rx) = connect(&mut registry, "w1", 1);
        tm.submit(vec![ping()]).unwrap();
        tm.dispatch(&mut registry, Instant::now()).unwrap();
        let job_id = dispatched(&mut rx)[0].job_id;

        let disposition = tm
            .on_result(&mut registry, "w1", ConnectionId(conn.0 + 100), ok_result(job_id))
            .unwrap();
        assert!(matches!(
            disposition,
            ResultDisposition::Violation(ProtocolError::UnknownJob(_))
        ));

        let disposition = tm
            .on_result(&mut registry, "w1", conn, ok_result(JobId::new()))
            .unwrap();
        assert!(matches!(disposition, ResultDisposition::Violation(_)));
        assert_eq!(tm.in_flight().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_drops_queued_and_discards_in_flight() {
        let mut tm = manager();
        let mut registry = WorkerRegistry::new();
        let (conn, mut rx) = connect(&mut registry, "w1", 1);

        let handle = tm.submit(vec![ping(), ping()]).unwrap();
        let batch = handle.batch_id();
        tm.dispatch(&mut registry, Instant::now()).unwrap();
        let running = dispatched(&mut rx)[0].job_id;

        let outcome = tm.cancel(batch).unwrap().unwrap();
        assert_eq!(
            outcome,
            CancelOutcome::Cancelled {
                removed: 1,
                in_flight: 1
            }
        );
        assert_eq!(handle.wait().await, Some(BatchOutcome::Cancelled));
        assert_eq!(tm.status(batch), Some(BatchStatus::Cancelled));

        let disposition = tm
            .on_result(&mut registry, "w1", conn, ok_result(running))
            .unwrap();
        assert!(matches!(disposition, ResultDisposition::Discarded));
        assert_eq!(tm.stats().open_batches, 0);
        assert_eq!(tm.cancel(batch).unwrap(), Some(CancelOutcome::AlreadyFinished));
        assert_eq!(tm.cancel(BatchId::new()).unwrap(), None);
    }

    #[test]
    fn test_persistence_failure_is_fatal() {
        let store = MemoryJobStore::new();
        let mut tm = manager_with(store.clone(), RetryConfig::with_delays(2, 0, 0));
        store.set_failing(true);

        let err = tm.submit(vec![ping()]).err().unwrap();
        assert!(matches!(err, Error::Storage(StorageError::Unavailable(_))));
        assert!(crate::error::CoordinatorErrorTrait::is_fatal(&err));
        assert_eq!(tm.stats().queued, 0);
    }

    #[test]
    fn test_restart_requeues_non_terminal_jobs() {
        let store = MemoryJobStore::new();
        let mut registry = WorkerRegistry::new();
        let (conn, mut rx) = connect(&mut registry, "w1", 1);

        let (batch, done_job) = {
            let mut tm = manager_with(store.clone(), RetryConfig::with_delays(2, 0, 0));
            let batch = tm.submit(vec![ping(), ping(), ping()]).unwrap().batch_id();
            tm.dispatch(&mut registry, Instant::now()).unwrap();
            let first = dispatched(&mut rx)[0].job_id;
            tm.on_result(&mut registry, "w1", conn, ok_result(first)).unwrap();
            tm.dispatch(&mut registry, Instant::now()).unwrap();
            (batch, first)
        };

        let mut tm = manager_with(store, RetryConfig::with_delays(2, 0, 0));
        let report = tm.recover().unwrap();
        assert_eq!(report.batches, 1);
        assert_eq!(report.queued, 2);

        let queued: Vec<JobId> = tm
            .queue_snapshot(Instant::now())
            .into_iter()
            .map(|q| q.job_id)
            .collect();
        assert_eq!(queued.len(), 2);
        assert!(!queued.contains(&done_job));
        assert_eq!(tm.status(batch), Some(BatchStatus::Pending { remaining: 2 }));
        assert_eq!(tm.job(done_job).map(|j| j.state), Some(JobState::Done));
    }

    #[test]
    fn test_backoff_defers_dispatch() {
        let mut tm = manager_with(MemoryJobStore::new(), RetryConfig::with_delays(3, 500, 5000));
        let mut registry = WorkerRegistry::new();
        let (conn, _rx) = connect(&mut registry, "w1", 1);
        tm.submit(vec![ping()]).unwrap();

        let now = Instant::now();
        tm.dispatch(&mut registry, now).unwrap();
        let lost = registry.unregister("w1", conn).unwrap();
        tm.on_worker_lost(lost.running, now).unwrap();

        let (_conn2, mut rx2) = connect(&mut registry, "w2", 1);
        assert_eq!(tm.dispatch(&mut registry, now).unwrap(), 0);
        assert_eq!(tm.next_wakeup(now), Some(now + Duration::from_millis(500)));
        assert_eq!(tm.queue_snapshot(now)[0].deferred_ms, Some(500));

        let later = now + Duration::from_millis(600);
        assert_eq!(tm.dispatch(&mut registry, later).unwrap(), 1);
        assert_eq!(dispatched(&mut rx2).len(), 1);
    }

    #[test]
    fn test_failed_handoff_requeues_job() {
        let mut tm = manager();
        let mut registry = WorkerRegistry::new();
        let (_conn, rx) = connect(&mut registry, "w1", 1);
        drop(rx);
        tm.submit(vec![ping()]).unwrap();

        assert_eq!(tm.dispatch(&mut registry, Instant::now()).unwrap(), 0);
        assert_eq!(tm.stats().queued, 1);
        assert_eq!(
            registry.get("w1").map(|w| w.state),
            Some(crate::coordinator::registry::WorkerState::SuspectedDead)
        );
    }
}
