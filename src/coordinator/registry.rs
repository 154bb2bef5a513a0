//! Worker registry
//!
//! Tracks connected workers, their slot usage and liveness. The registry is
//! owned by the coordinator event loop and never shared, so it needs no
//! locking. Nothing here is persisted: after a restart workers reconnect
//! and re-register.
//!
//! Each worker moves through an explicit lifecycle:
//!
//! ```text
//! Connecting ──activate──▶ Active ──heartbeat timeout / send failure──▶ SuspectedDead
//!      │                     │                                              │
//!      └─────────────────────┴──────────────── unregister ─────────────────┴──▶ Removed
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, Instant};

use super::session::{Outbound, WorkerSender};
use crate::models::{Capabilities, JobId};
use crate::protocol::{CoordinatorMessage, Handshake};
use crate::scheduler::WorkerCandidate;

// ============================================================================
// Worker State
// ============================================================================

/// Liveness state of a registered worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Handshake accepted, welcome not yet queued
    Connecting,

    /// Eligible for dispatch
    Active,

    /// Missed its heartbeat deadline or its connection stopped accepting records
    SuspectedDead,

    /// Unregistered; only seen on entries handed back by `unregister`
    Removed,
}

impl WorkerState {
    /// Connecting and active workers hold their name
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connecting | Self::Active)
    }

    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Connecting, Active)
                | (Connecting, SuspectedDead)
                | (Active, SuspectedDead)
                | (Connecting, Removed)
                | (Active, Removed)
                | (SuspectedDead, Removed)
        )
    }
}

/// Identifies one TCP connection; a reconnecting worker gets a new one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ============================================================================
// Worker Entry
// ============================================================================

/// A registered worker
#[derive(Debug)]
pub struct Worker {
    pub name: String,
    pub connection: ConnectionId,
    pub concurrency: u32,
    pub capabilities: Capabilities,
    pub state: WorkerState,

    /// Jobs dispatched to this worker and not yet resulted
    pub running: BTreeSet<JobId>,

    pub last_seen: Instant,
    pub connected_at: DateTime<Utc>,

    outbound: WorkerSender,
}

impl Worker {
    pub fn used_slots(&self) -> u32 {
        self.running.len() as u32
    }

    pub fn free_slots(&self) -> u32 {
        self.concurrency.saturating_sub(self.used_slots())
    }

    fn transition(&mut self, next: WorkerState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    fn info(&self, now: Instant) -> WorkerInfo {
        WorkerInfo {
            name: self.name.clone(),
            connection: self.connection,
            concurrency: self.concurrency,
            used_slots: self.used_slots(),
            capabilities: self.capabilities.clone(),
            state: self.state,
            running: self.running.iter().copied().collect(),
            connected_at: self.connected_at,
            idle_secs: now.saturating_duration_since(self.last_seen).as_secs(),
        }
    }
}

/// Snapshot of a worker for introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub name: String,
    pub connection: ConnectionId,
    pub concurrency: u32,
    pub used_slots: u32,
    pub capabilities: Capabilities,
    pub state: WorkerState,
    pub running: Vec<JobId>,
    pub connected_at: DateTime<Utc>,
    /// Seconds since the last record from this worker
    pub idle_secs: u64,
}

// ============================================================================
// Worker Registry
// ============================================================================

/// Registry of connected workers, keyed by name
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<String, Worker>,
    next_connection: u64,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a freshly accepted connection
    pub fn next_connection_id(&mut self) -> ConnectionId {
        self.next_connection += 1;
        ConnectionId(self.next_connection)
    }

    /// Register a worker from its handshake.
    ///
    /// Fails with `DuplicateName` when a live worker already uses the name.
    /// A suspected-dead holder of the name is evicted and returned so its
    /// jobs can be requeued.
    pub fn register(
        &mut self,
        handshake: &Handshake,
        connection: ConnectionId,
        outbound: WorkerSender,
        now: Instant,
    ) -> Result<Option<Worker>, RegistryError> {
        let live = self.workers.get(&handshake.name).map(|w| w.state.is_live());
        let evicted = match live {
            Some(true) => return Err(RegistryError::DuplicateName(handshake.name.clone())),
            Some(false) => self.remove(&handshake.name),
            None => None,
        };

        self.workers.insert(
            handshake.name.clone(),
            Worker {
                name: handshake.name.clone(),
                connection,
                concurrency: handshake.concurrency,
                capabilities: handshake.capabilities.clone(),
                state: WorkerState::Connecting,
                running: BTreeSet::new(),
                last_seen: now,
                connected_at: Utc::now(),
                outbound,
            },
        );

        Ok(evicted)
    }

    /// Make a connecting worker eligible for dispatch
    pub fn activate(&mut self, name: &str) -> bool {
        self.workers
            .get_mut(name)
            .is_some_and(|w| w.transition(WorkerState::Active))
    }

    /// Remove a worker if `connection` is still the one registered under
    /// `name`. Returns the entry, with its in-flight jobs, in `Removed` state.
    pub fn unregister(&mut self, name: &str, connection: ConnectionId) -> Option<Worker> {
        if self.is_current(name, connection) {
            self.remove(name)
        } else {
            None
        }
    }

    fn remove(&mut self, name: &str) -> Option<Worker> {
        let mut worker = self.workers.remove(name)?;
        worker.transition(WorkerState::Removed);
        let _ = worker.outbound.send(Outbound::Close);
        Some(worker)
    }

    /// Claim a slot on `name` for `job`. Succeeds only for active workers
    /// with used < concurrency.
    pub fn reserve_slot(&mut self, name: &str, job: JobId) -> bool {
        match self.workers.get_mut(name) {
            Some(w) if w.state == WorkerState::Active && w.free_slots() > 0 => {
                w.running.insert(job)
            }
            _ => false,
        }
    }

    /// Give back the slot held by `job`; a no-op if it was not held
    pub fn release_slot(&mut self, name: &str, job: JobId) -> bool {
        self.workers
            .get_mut(name)
            .is_some_and(|w| w.running.remove(&job))
    }

    /// Whether `job` is running on `name` over `connection`
    pub fn holds(&self, name: &str, connection: ConnectionId, job: JobId) -> bool {
        self.workers
            .get(name)
            .is_some_and(|w| w.connection == connection && w.running.contains(&job))
    }

    /// Whether `connection` is the current connection of `name`
    pub fn is_current(&self, name: &str, connection: ConnectionId) -> bool {
        self.workers
            .get(name)
            .is_some_and(|w| w.connection == connection)
    }

    /// Active workers with a free slot and every capability in `required`,
    /// in connection order (oldest first)
    pub fn list_available(&self, required: &Capabilities) -> Vec<WorkerCandidate> {
        let mut available: Vec<&Worker> = self
            .workers
            .values()
            .filter(|w| {
                w.state == WorkerState::Active
                    && w.free_slots() > 0
                    && required.is_subset(&w.capabilities)
            })
            .collect();
        available.sort_by_key(|w| w.connection);

        available
            .into_iter()
            .map(|w| WorkerCandidate {
                name: w.name.clone(),
                free_slots: w.free_slots(),
                concurrency: w.concurrency,
                capabilities: w.capabilities.clone(),
            })
            .collect()
    }

    /// Record activity from a worker
    pub fn touch(&mut self, name: &str, connection: ConnectionId, now: Instant) {
        if let Some(w) = self.workers.get_mut(name) {
            if w.connection == connection {
                w.last_seen = now;
            }
        }
    }

    /// Queue a record for a worker. False if the worker is gone or its
    /// connection task has stopped reading the queue.
    pub fn send(&self, name: &str, message: CoordinatorMessage) -> bool {
        self.workers
            .get(name)
            .is_some_and(|w| w.outbound.send(Outbound::Message(message)).is_ok())
    }

    pub fn mark_suspected(&mut self, name: &str) -> bool {
        self.workers
            .get_mut(name)
            .is_some_and(|w| w.transition(WorkerState::SuspectedDead))
    }

    /// Mark every worker silent for longer than `timeout` as suspected dead
    /// and return (name, connection) for each newly suspected one
    pub fn sweep_expired(
        &mut self,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(String, ConnectionId)> {
        self.workers
            .values_mut()
            .filter(|w| w.state.is_live() && now.saturating_duration_since(w.last_seen) > timeout)
            .filter_map(|w| {
                w.transition(WorkerState::SuspectedDead)
                    .then(|| (w.name.clone(), w.connection))
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&Worker> {
        self.workers.get(name)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn snapshot(&self, now: Instant) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self.workers.values().map(|w| w.info(now)).collect();
        infos.sort_by_key(|info| info.connection);
        infos
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for w in self.workers.values() {
            stats.total_workers += 1;
            match w.state {
                WorkerState::Active => stats.active += 1,
                WorkerState::SuspectedDead => stats.suspected += 1,
                WorkerState::Connecting | WorkerState::Removed => {}
            }
            stats.total_slots += u64::from(w.concurrency);
            stats.used_slots += u64::from(w.used_slots());
        }
        stats
    }
}

/// Registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_workers: usize,
    pub active: usize,
    pub suspected: usize,
    pub total_slots: u64,
    pub used_slots: u64,
}

impl RegistryStats {
    pub fn free_slots(&self) -> u64 {
        self.total_slots.saturating_sub(self.used_slots)
    }

    /// Percentage of slots in use
    pub fn utilization(&self) -> f64 {
        if self.total_slots == 0 {
            0.0
        } else {
            (self.used_slots as f64 / self.total_slots as f64) * 100.0
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A live worker already uses this name
    DuplicateName(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateName(name) => write!(f, "Worker name already in use: {}", name),
        }
    }
}

impl std::error::Error for RegistryError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handshake(name: &str, concurrency: u32, caps: &[&str]) -> Handshake {
        Handshake::new(
            name,
            concurrency,
            caps.iter().map(|c| c.to_string()).collect(),
        )
    }

    fn register(
        registry: &mut WorkerRegistry,
        name: &str,
        concurrency: u32,
        caps: &[&str],
    ) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = registry.next_connection_id();
        registry
            .register(&handshake(name, concurrency, caps), conn, tx, Instant::now())
            .unwrap();
        assert!(registry.activate(name));
        (conn, rx)
    }

    #[test]
    fn test_worker_state_transitions() {
        assert!(WorkerState::Connecting.can_transition_to(WorkerState::Active));
        assert!(WorkerState::Active.can_transition_to(WorkerState::SuspectedDead));
        assert!(WorkerState::SuspectedDead.can_transition_to(WorkerState::Removed));
        assert!(!WorkerState::SuspectedDead.can_transition_to(WorkerState::Active));
        assert!(!WorkerState::Removed.can_transition_to(WorkerState::Active));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = WorkerRegistry::new();
        let (_conn, _rx) = register(&mut registry, "w1", 1, &[]);

        let (tx, _rx2) = mpsc::unbounded_channel();
        let conn = registry.next_connection_id();
        let err = registry
            .register(&handshake("w1", 2, &[]), conn, tx, Instant::now())
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateName("w1".to_string()));
        assert_eq!(registry.get("w1").unwrap().concurrency, 1);
    }

    #[test]
    fn test_suspected_worker_is_evicted_on_reregister() {
        let mut registry = WorkerRegistry::new();
        let (_conn, _rx) = register(&mut registry, "w1", 1, &[]);
        let job = JobId::new();
        assert!(registry.reserve_slot("w1", job));
        assert!(registry.mark_suspected("w1"));

        let (tx, _rx2) = mpsc::unbounded_channel();
        let conn = registry.next_connection_id();
        let evicted = registry
            .register(&handshake("w1", 1, &[]), conn, tx, Instant::now())
            .unwrap()
            .unwrap();
        assert_eq!(evicted.state, WorkerState::Removed);
        assert!(evicted.running.contains(&job));
    }

    #[test]
    fn test_slot_accounting() {
        let mut registry = WorkerRegistry::new();
        let (_conn, _rx) = register(&mut registry, "w1", 2, &[]);
        let (a, b, c) = (JobId::new(), JobId::new(), JobId::new());

        assert!(registry.reserve_slot("w1", a));
        assert!(registry.reserve_slot("w1", b));
        assert!(!registry.reserve_slot("w1", c));
        assert_eq!(registry.get("w1").unwrap().used_slots(), 2);

        assert!(registry.release_slot("w1", a));
        assert!(!registry.release_slot("w1", a));
        assert_eq!(registry.get("w1").unwrap().used_slots(), 1);
    }

    #[test]
    fn test_connecting_worker_gets_no_jobs() {
        let mut registry = WorkerRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = registry.next_connection_id();
        registry
            .register(&handshake("w1", 1, &[]), conn, tx, Instant::now())
            .unwrap();

        assert!(registry.list_available(&Capabilities::new()).is_empty());
        assert!(!registry.reserve_slot("w1", JobId::new()));
    }

    #[test]
    fn test_list_available_filters_capabilities() {
        let mut registry = WorkerRegistry::new();
        let (_c1, _r1) = register(&mut registry, "plain", 1, &[]);
        let (_c2, _r2) = register(&mut registry, "timed", 1, &["cpu-exec"]);

        let cpu: Capabilities = ["cpu-exec".to_string()].into_iter().collect();
        let names: Vec<String> = registry
            .list_available(&cpu)
            .into_iter()
            .map(|w| w.name)
            .collect();
        assert_eq!(names, vec!["timed"]);

        let all: Vec<String> = registry
            .list_available(&Capabilities::new())
            .into_iter()
            .map(|w| w.name)
            .collect();
        assert_eq!(all, vec!["plain", "timed"]);
    }

    #[test]
    fn test_unregister_ignores_stale_connection() {
        let mut registry = WorkerRegistry::new();
        let (conn, mut rx) = register(&mut registry, "w1", 1, &[]);

        assert!(registry.unregister("w1", ConnectionId(999)).is_none());
        let removed = registry.unregister("w1", conn).unwrap();
        assert_eq!(removed.state, WorkerState::Removed);
        assert!(registry.is_empty());
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
    }

    #[test]
    fn test_sweep_expired() {
        let mut registry = WorkerRegistry::new();
        let (conn, _rx) = register(&mut registry, "w1", 1, &[]);
        let later = Instant::now() + Duration::from_secs(60);

        let expired = registry.sweep_expired(later, Duration::from_secs(30));
        assert_eq!(expired, vec![("w1".to_string(), conn)]);
        assert_eq!(registry.get("w1").unwrap().state, WorkerState::SuspectedDead);

        // Already suspected workers are not reported twice
        assert!(registry.sweep_expired(later, Duration::from_secs(30)).is_empty());
    }

    #[test]
    fn test_send_to_closed_connection_fails() {
        let mut registry = WorkerRegistry::new();
        let (_conn, rx) = register(&mut registry, "w1", 1, &[]);
        drop(rx);
        assert!(!registry.send("w1", CoordinatorMessage::Heartbeat));
    }

    #[test]
    fn test_stats() {
        let mut registry = WorkerRegistry::new();
        let (_c1, _r1) = register(&mut registry, "w1", 2, &[]);
        let (_c2, _r2) = register(&mut registry, "w2", 2, &[]);
        registry.reserve_slot("w1", JobId::new());

        let stats = registry.stats();
        assert_eq!(stats.total_workers, 2);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.free_slots(), 3);
        assert!((stats.utilization() - 25.0).abs() < 0.1);
    }
}
