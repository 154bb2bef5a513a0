//! Ordered pending set

use std::collections::{BTreeMap, HashMap};

use crate::models::JobId;

/// Queued job ids ordered by submission sequence.
///
/// Keying on the sequence number rather than arrival order means a job
/// returned to the queue after a worker loss takes back its original place
/// instead of going to the end.
#[derive(Debug, Default, Clone)]
pub struct PendingQueue {
    by_seq: BTreeMap<u64, JobId>,
    seq_of: HashMap<JobId, u64>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job; false if it is already queued
    pub fn push(&mut self, seq: u64, id: JobId) -> bool {
        if self.seq_of.contains_key(&id) {
            return false;
        }
        self.by_seq.insert(seq, id);
        self.seq_of.insert(id, seq);
        true
    }

    pub fn remove(&mut self, id: JobId) -> bool {
        match self.seq_of.remove(&id) {
            Some(seq) => {
                self.by_seq.remove(&seq);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.seq_of.contains_key(&id)
    }

    /// Job ids in queue order
    pub fn iter(&self) -> impl Iterator<Item = JobId> + '_ {
        self.by_seq.values().copied()
    }

    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }
}
