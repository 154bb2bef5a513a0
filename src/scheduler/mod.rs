//! Job-to-worker assignment policies
//!
//! A scheduling policy is a pure function over two inputs handed to it by
//! the task manager: the workers that currently have a free slot, and the
//! pending queue in insertion order. It returns at most one pairing per
//! call; the task manager keeps calling until it gets `None`.
//!
//! Policies hold no state of their own, so the same inputs always give the
//! same pairing. They are registered by name at process start and selected
//! through the `scheduler` configuration key.
//!
//! # Policies
//!
//! | Name | Behavior |
//! |------|----------|
//! | `fifo` | Earliest eligible job, first worker (in registration order) that can take it |
//! | `least-loaded` | Earliest eligible job, worker with the lowest used/concurrency ratio |
//!
//! Both only consider workers with a free slot whose capabilities are a
//! superset of the job's required capabilities.

pub mod error;
pub mod fifo;
pub mod least_loaded;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{Capabilities, JobId};

pub use error::{SchedulerError, SchedulerResult};
pub use fifo::FifoFirstFit;
pub use least_loaded::LeastLoaded;

/// Policy used when the configuration does not name one
pub const DEFAULT_POLICY: &str = "fifo";

// ============================================================================
// Policy Inputs and Outputs
// ============================================================================

/// A worker as seen by a policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCandidate {
    pub name: String,
    pub free_slots: u32,
    pub concurrency: u32,
    pub capabilities: Capabilities,
}

impl WorkerCandidate {
    /// Whether this worker may run a job needing `required`
    pub fn can_run(&self, required: &Capabilities) -> bool {
        self.free_slots > 0 && required.is_subset(&self.capabilities)
    }

    pub fn used_slots(&self) -> u32 {
        self.concurrency.saturating_sub(self.free_slots)
    }
}

/// A queued job as seen by a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingJob<'a> {
    pub id: JobId,
    pub kind: &'a str,
    pub required_capabilities: &'a Capabilities,
}

/// A chosen (job, worker) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub job_id: JobId,
    pub worker: String,
}

// ============================================================================
// Policy Trait
// ============================================================================

/// Strategy for pairing pending jobs with available workers
pub trait SchedulingPolicy: Send {
    /// Registered name of the policy
    fn name(&self) -> &'static str;

    /// Pick one assignment, or `None` when nothing can be placed.
    ///
    /// `workers` is ordered by registration time and `pending` by queue
    /// insertion order. Implementations must not return a worker without a
    /// free slot or one lacking a capability the job requires.
    fn select_assignment(
        &self,
        workers: &[WorkerCandidate],
        pending: &[PendingJob<'_>],
    ) -> Option<Assignment>;
}

/// Check an assignment against the inputs it was derived from
pub fn check_assignment(
    policy: &dyn SchedulingPolicy,
    assignment: &Assignment,
    workers: &[WorkerCandidate],
    pending: &[PendingJob<'_>],
) -> SchedulerResult<()> {
    let job = pending
        .iter()
        .find(|job| job.id == assignment.job_id)
        .ok_or_else(|| SchedulerError::invalid_assignment(policy.name(), "job is not pending"))?;

    let worker = workers
        .iter()
        .find(|w| w.name == assignment.worker)
        .ok_or_else(|| {
            SchedulerError::invalid_assignment(policy.name(), "worker is not available")
        })?;

    if worker.free_slots == 0 {
        return Err(SchedulerError::invalid_assignment(
            policy.name(),
            format!("worker '{}' has no free slot", worker.name),
        ));
    }
    if !job.required_capabilities.is_subset(&worker.capabilities) {
        return Err(SchedulerError::invalid_assignment(
            policy.name(),
            format!("worker '{}' lacks capabilities for {}", worker.name, job.kind),
        ));
    }
    Ok(())
}

// ============================================================================
// Policy Registry
// ============================================================================

type PolicyFactory = fn() -> Box<dyn SchedulingPolicy>;

/// Named policies available for selection at startup
#[derive(Clone)]
pub struct PolicyRegistry {
    factories: BTreeMap<&'static str, PolicyFactory>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("policies", &self.names())
            .finish()
    }
}

impl PolicyRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry holding the built-in policies
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("fifo", || Box::new(FifoFirstFit));
        registry.register("least-loaded", || Box::new(LeastLoaded));
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: PolicyFactory) {
        self.factories.insert(name, factory);
    }

    /// Instantiate the policy registered under `name`
    pub fn create(&self, name: &str) -> SchedulerResult<Box<dyn SchedulingPolicy>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| SchedulerError::unknown_policy(name, self.names()))
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().map(|name| name.to_string()).collect()
    }
}
