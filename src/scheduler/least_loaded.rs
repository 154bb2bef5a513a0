//! Least-loaded policy

use std::cmp::Ordering;

use super::{Assignment, PendingJob, SchedulingPolicy, WorkerCandidate};

/// Earliest-queued eligible job paired with the eligible worker whose
/// used/concurrency ratio is lowest. Ties go to the earlier-registered worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastLoaded;

/// Compare `a.used / a.concurrency` with `b.used / b.concurrency` without floats
fn compare_load(a: &WorkerCandidate, b: &WorkerCandidate) -> Ordering {
    let lhs = u64::from(a.used_slots()) * u64::from(b.concurrency.max(1));
    let rhs = u64::from(b.used_slots()) * u64::from(a.concurrency.max(1));
    lhs.cmp(&rhs)
}

impl SchedulingPolicy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least-loaded"
    }

    fn select_assignment(
        &self,
        workers: &[WorkerCandidate],
        pending: &[PendingJob<'_>],
    ) -> Option<Assignment> {
        pending.iter().find_map(|job| {
            workers
                .iter()
                .filter(|w| w.can_run(job.required_capabilities))
                .fold(None::<&WorkerCandidate>, |best, w| match best {
                    Some(b) if compare_load(w, b) != Ordering::Less => Some(b),
                    _ => Some(w),
                })
                .map(|w| Assignment {
                    job_id: job.id,
                    worker: w.name.clone(),
                })
        })
    }
}
