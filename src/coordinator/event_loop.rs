//! Coordinator event loop
//!
//! A single task owns the [`WorkerRegistry`] and the [`TaskManager`] and
//! applies every state change in turn: worker connects and disconnects,
//! inbound records, producer requests, the heartbeat sweep and the wakeup
//! for backed-off retries. Nothing else holds a reference to either, so no
//! locking is needed and every dispatch decision sees a consistent view.
//!
//! A storage error is fatal. The loop returns it, pending requests observe
//! the closed channel and the server shuts down.
//!
//! Store writes are synchronous. [`Coordinator::spawn`] runs the loop on a
//! blocking-pool thread with its own runtime so a slow fsync only holds up
//! the loop itself, never sessions or the RPC front door.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::handle::CoordinatorHandle;
use super::registry::{ConnectionId, RegistryError, RegistryStats, WorkerInfo, WorkerRegistry};
use super::session::WorkerSender;
use crate::error::{CoordinatorErrorTrait, Error, Result};
use crate::manager::{BatchHandle, ManagerStats, QueuedJob, ResultDisposition, TaskManager};
use crate::metrics;
use crate::models::{BatchId, BatchStatus, CancelOutcome, JobSpec};
use crate::protocol::{Handshake, ProtocolError, WorkerMessage};

/// Requests to the event loop
pub(crate) enum Event {
    Connect {
        handshake: Handshake,
        outbound: WorkerSender,
        reply: oneshot::Sender<Result<ConnectionId>>,
    },
    Message {
        worker: String,
        connection: ConnectionId,
        message: WorkerMessage,
    },
    Disconnect {
        worker: String,
        connection: ConnectionId,
        reason: String,
    },
    Submit {
        specs: Vec<JobSpec>,
        reply: oneshot::Sender<Result<BatchHandle>>,
    },
    Status {
        batch_id: BatchId,
        reply: oneshot::Sender<Option<BatchStatus>>,
    },
    Cancel {
        batch_id: BatchId,
        reply: oneshot::Sender<Result<Option<CancelOutcome>>>,
    },
    Workers {
        reply: oneshot::Sender<Vec<WorkerInfo>>,
    },
    Queue {
        reply: oneshot::Sender<Vec<QueuedJob>>,
    },
    Stats {
        reply: oneshot::Sender<CoordinatorStats>,
    },
}

/// Combined coordinator counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub policy: String,
    pub workers: RegistryStats,
    pub jobs: ManagerStats,
}

/// Event loop tuning
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Silence after which a worker is dropped
    pub heartbeat_timeout: Duration,
    /// How often worker liveness is checked
    pub sweep_interval: Duration,
    /// Bound of the event queue
    pub event_capacity: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            event_capacity: 1024,
        }
    }
}

/// The coordinator actor
pub struct Coordinator {
    registry: WorkerRegistry,
    manager: TaskManager,
    events: mpsc::Receiver<Event>,
    settings: LoopSettings,
}

impl Coordinator {
    /// Create the loop around a recovered task manager
    pub fn new(manager: TaskManager, settings: LoopSettings) -> (Self, CoordinatorHandle) {
        let (handle, events) = CoordinatorHandle::channel(settings.event_capacity.max(1));
        let coordinator = Self {
            registry: WorkerRegistry::new(),
            manager,
            events,
            settings,
        };
        (coordinator, handle)
    }

    /// Run on a dedicated blocking thread until `stop` fires, every handle
    /// is dropped, or a fatal error occurs
    pub fn spawn(self, stop: oneshot::Receiver<()>) -> JoinHandle<Result<()>> {
        tokio::task::spawn_blocking(move || -> Result<()> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(self.run_until(async {
                let _ = stop.await;
            }))
        })
    }

    /// Run until every handle is dropped or a fatal error occurs
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run until `stop` resolves, every handle is dropped, or a fatal
    /// error occurs
    pub async fn run_until<F>(mut self, stop: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(policy = self.manager.policy_name(), "Coordinator event loop started");
        tokio::pin!(stop);

        let mut sweep = interval(self.settings.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let wakeup = self.manager.next_wakeup(Instant::now());
            let retry_due = async move {
                match wakeup {
                    Some(at) => sleep_until(at.into()).await,
                    None => std::future::pending().await,
                }
            };

            let outcome = tokio::select! {
                _ = &mut stop => {
                    info!("Coordinator event loop stopped");
                    return Ok(());
                }
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        info!("All coordinator handles dropped, stopping event loop");
                        return Ok(());
                    }
                },
                _ = sweep.tick() => self.sweep(Instant::now()),
                _ = retry_due => self.dispatch(Instant::now()),
            };

            if let Err(e) = outcome {
                error!(category = e.category().as_str(), error = %e, "Fatal coordinator error");
                return Err(e);
            }
            self.publish_metrics();
        }
    }

    fn handle_event(&mut self, event: Event) -> Result<()> {
        let now = Instant::now();
        match event {
            Event::Connect {
                handshake,
                outbound,
                reply,
            } => {
                match self.connect(&handshake, outbound, now) {
                    Ok(result) => {
                        let _ = reply.send(result.map_err(Error::from));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(Error::ShuttingDown));
                        return Err(e);
                    }
                }
                self.dispatch(now)
            }

            Event::Message {
                worker,
                connection,
                message,
            } => self.on_message(&worker, connection, message, now),

            Event::Disconnect {
                worker,
                connection,
                reason,
            } => {
                if self.drop_worker(&worker, connection, now)? {
                    info!(worker = %worker, %connection, %reason, "Worker disconnected");
                }
                self.dispatch(now)
            }

            Event::Submit { specs, reply } => match self.manager.submit(specs) {
                Ok(handle) => {
                    let _ = reply.send(Ok(handle));
                    self.dispatch(now)
                }
                Err(e) => reply_or_fail(reply, e),
            },

            Event::Status { batch_id, reply } => {
                let _ = reply.send(self.manager.status(batch_id));
                Ok(())
            }

            Event::Cancel { batch_id, reply } => match self.manager.cancel(batch_id) {
                Ok(outcome) => {
                    let _ = reply.send(Ok(outcome));
                    Ok(())
                }
                Err(e) => reply_or_fail(reply, e),
            },

            Event::Workers { reply } => {
                let _ = reply.send(self.registry.snapshot(now));
                Ok(())
            }

            Event::Queue { reply } => {
                let _ = reply.send(self.manager.queue_snapshot(now));
                Ok(())
            }

            Event::Stats { reply } => {
                let _ = reply.send(CoordinatorStats {
                    policy: self.manager.policy_name().to_string(),
                    workers: self.registry.stats(),
                    jobs: self.manager.stats(),
                });
                Ok(())
            }
        }
    }

    /// Register and activate a worker. The inner error is a refusal to
    /// report to the worker; the outer one is fatal.
    fn connect(
        &mut self,
        handshake: &Handshake,
        outbound: WorkerSender,
        now: Instant,
    ) -> Result<std::result::Result<ConnectionId, RegistryError>> {
        let connection = self.registry.next_connection_id();
        let evicted = match self.registry.register(handshake, connection, outbound, now) {
            Ok(evicted) => evicted,
            Err(e) => return Ok(Err(e)),
        };

        if let Some(old) = evicted {
            warn!(
                worker = %old.name,
                connection = %old.connection,
                lost_jobs = old.running.len(),
                "Replacing suspected-dead worker"
            );
            self.manager.on_worker_lost(old.running, now)?;
        }

        self.registry.activate(&handshake.name);
        info!(
            worker = %handshake.name,
            %connection,
            concurrency = handshake.concurrency,
            capabilities = ?handshake.capabilities,
            "Worker connected"
        );
        Ok(Ok(connection))
    }

    fn on_message(
        &mut self,
        worker: &str,
        connection: ConnectionId,
        message: WorkerMessage,
        now: Instant,
    ) -> Result<()> {
        if !self.registry.is_current(worker, connection) {
            debug!(worker = %worker, %connection, "Ignoring record from stale connection");
            return Ok(());
        }
        self.registry.touch(worker, connection, now);

        match message {
            WorkerMessage::Heartbeat => return Ok(()),
            WorkerMessage::Handshake(_) => {
                self.violation(worker, connection, ProtocolError::DuplicateHandshake, now)?;
            }
            WorkerMessage::Result(result) => {
                match self
                    .manager
                    .on_result(&mut self.registry, worker, connection, result)?
                {
                    ResultDisposition::Violation(e) => {
                        self.violation(worker, connection, e, now)?;
                    }
                    ResultDisposition::Recorded { .. } | ResultDisposition::Discarded => {}
                }
            }
        }

        self.dispatch(now)
    }

    fn violation(
        &mut self,
        worker: &str,
        connection: ConnectionId,
        violation: ProtocolError,
        now: Instant,
    ) -> Result<()> {
        metrics::record_protocol_violation(violation.kind());
        warn!(worker = %worker, %connection, error = %violation, "Protocol violation, dropping worker");
        self.drop_worker(worker, connection, now)?;
        Ok(())
    }

    /// Remove a worker and hand its in-flight jobs back to the task
    /// manager. False if `connection` was no longer current.
    fn drop_worker(
        &mut self,
        worker: &str,
        connection: ConnectionId,
        now: Instant,
    ) -> Result<bool> {
        let Some(removed) = self.registry.unregister(worker, connection) else {
            return Ok(false);
        };
        if !removed.running.is_empty() {
            info!(worker = %worker, lost_jobs = removed.running.len(), "Returning jobs of lost worker");
        }
        self.manager.on_worker_lost(removed.running, now)?;
        Ok(true)
    }

    fn sweep(&mut self, now: Instant) -> Result<()> {
        for (worker, connection) in self
            .registry
            .sweep_expired(now, self.settings.heartbeat_timeout)
        {
            warn!(worker = %worker, %connection, "Heartbeat timeout, dropping worker");
            self.drop_worker(&worker, connection, now)?;
        }
        self.dispatch(now)
    }

    fn dispatch(&mut self, now: Instant) -> Result<()> {
        let dispatched = self.manager.dispatch(&mut self.registry, now)?;
        if dispatched > 0 {
            debug!(dispatched, queued = self.manager.queue_len(), "Dispatch round");
        }
        Ok(())
    }

    fn publish_metrics(&self) {
        let stats = self.registry.stats();
        metrics::update_capacity(
            stats.total_workers,
            stats.free_slots(),
            self.manager.queue_len(),
        );
    }
}

/// Answer a request with its error, or stop the loop if the error is fatal
fn reply_or_fail<T>(reply: oneshot::Sender<Result<T>>, e: Error) -> Result<()> {
    if e.is_fatal() {
        let _ = reply.send(Err(Error::ShuttingDown));
        Err(e)
    } else {
        let _ = reply.send(Err(e));
        Ok(())
    }
}
