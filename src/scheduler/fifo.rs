//! FIFO first-fit policy

use super::{Assignment, PendingJob, SchedulingPolicy, WorkerCandidate};

/// Earliest-queued eligible job paired with the first eligible worker.
///
/// A job that no available worker can run is skipped, so one
/// `unsafe-exec` job waiting for a capable worker does not hold back the
/// ordinary jobs queued behind it.
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoFirstFit;

impl SchedulingPolicy for FifoFirstFit {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn select_assignment(
        &self,
        workers: &[WorkerCandidate],
        pending: &[PendingJob<'_>],
    ) -> Option<Assignment> {
        pending.iter().find_map(|job| {
            workers
                .iter()
                .find(|w| w.can_run(job.required_capabilities))
                .map(|w| Assignment {
                    job_id: job.id,
                    worker: w.name.clone(),
                })
        })
    }
}
