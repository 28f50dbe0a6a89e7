//! Worker supervision: spawning, tracking and stopping per-task workers

use crate::queue::manager::Command;
use crate::queue::task::{Task, TaskId};
use crate::worker::{ProgressReporter, WorkerFactory, WorkerOutcome};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything the control loop consumes arrives through one mailbox
#[derive(Debug)]
pub(crate) enum Envelope {
    Command(Command),
    Worker(WorkerMessage),
}

/// Messages emitted by a running worker, tagged with its generation
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Progress {
        id: TaskId,
        generation: u64,
        percent: u8,
    },
    Finished {
        id: TaskId,
        generation: u64,
        outcome: WorkerOutcome,
    },
}

fn crash_reason(err: JoinError) -> String {
    if !err.is_panic() {
        return format!("worker aborted: {}", err);
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("worker panicked: {}", message)
}

/// Handle for one in-flight worker
pub(crate) struct ActiveWorker {
    generation: u64,
    cancel: CancellationToken,
    join_handle: JoinHandle<()>,
    pause_waiters: Vec<oneshot::Sender<bool>>,
}

impl ActiveWorker {
    /// A pause was requested and the worker has not acknowledged it yet
    pub(crate) fn stop_requested(&self) -> bool {
        !self.pause_waiters.is_empty()
    }

    /// Answer everyone waiting on a pause of this worker
    pub(crate) fn answer_waiters(self, paused: bool) {
        for waiter in self.pause_waiters {
            let _ = waiter.send(paused);
        }
    }
}

/// Owns the active worker handles. Lives inside the control loop.
pub(crate) struct WorkerSupervisor {
    factory: Arc<dyn WorkerFactory>,
    destination: PathBuf,
    mailbox: mpsc::WeakSender<Envelope>,
    active: HashMap<TaskId, ActiveWorker>,
    next_generation: u64,
}

impl WorkerSupervisor {
    pub(crate) fn new(
        factory: Arc<dyn WorkerFactory>,
        destination: PathBuf,
        mailbox: mpsc::WeakSender<Envelope>,
    ) -> Self {
        Self {
            factory,
            destination,
            mailbox,
            active: HashMap::new(),
            next_generation: 0,
        }
    }

    pub(crate) fn destination(&self) -> &PathBuf {
        &self.destination
    }

    /// A sender into the control loop, if any handle is still alive to keep it open
    pub(crate) fn mailbox(&self) -> Option<mpsc::Sender<Envelope>> {
        self.mailbox.upgrade()
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn is_current(&self, id: &TaskId, generation: u64) -> bool {
        self.active
            .get(id)
            .is_some_and(|worker| worker.generation == generation)
    }

    pub(crate) fn is_stopping(&self, id: &TaskId) -> bool {
        self.active.get(id).is_some_and(ActiveWorker::stop_requested)
    }

    /// Create a worker for the task and run it on its own tokio task
    pub(crate) fn start(&mut self, task: &Task, mailbox: mpsc::Sender<Envelope>) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let id = task.id;
        let cancel = CancellationToken::new();

        let worker = self.factory.create(&task.source_ref, &self.destination);
        let reporter = ProgressReporter::new(id, generation, mailbox.clone());
        let token = cancel.clone();

        let join_handle = tokio::spawn(async move {
            // Run the worker on its own task so a panic still produces an outcome
            let run = tokio::spawn(worker.run(reporter, token));
            let outcome = match run.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!("Worker for task {} crashed: {}", id, err);
                    WorkerOutcome::Failure(crash_reason(err))
                }
            };
            let message = WorkerMessage::Finished {
                id,
                generation,
                outcome,
            };
            if mailbox.send(Envelope::Worker(message)).await.is_err() {
                debug!("Queue closed before task {} reported its outcome", id);
            }
        });

        self.active.insert(
            id,
            ActiveWorker {
                generation,
                cancel,
                join_handle,
                pause_waiters: Vec::new(),
            },
        );

        info!("Started worker for task {} (generation {})", id, generation);
    }

    /// Ask the worker to stop; `waiter` is answered once it acknowledges.
    /// Hands the waiter back if the task has no active worker.
    pub(crate) fn request_stop(
        &mut self,
        id: &TaskId,
        waiter: oneshot::Sender<bool>,
    ) -> Result<(), oneshot::Sender<bool>> {
        match self.active.get_mut(id) {
            Some(worker) => {
                worker.cancel.cancel();
                worker.pause_waiters.push(waiter);
                debug!("Stop requested for task {}", id);
                Ok(())
            }
            None => Err(waiter),
        }
    }

    /// Remove the handle of a worker that has finished
    pub(crate) fn retire(&mut self, id: &TaskId) -> Option<ActiveWorker> {
        self.active.remove(id)
    }

    /// Drop the worker without waiting for it. Late messages become stale.
    pub(crate) fn abandon(&mut self, id: &TaskId) {
        if let Some(worker) = self.active.remove(id) {
            worker.cancel.cancel();
            debug!("Abandoned worker for task {}", id);
            worker.answer_waiters(false);
        }
    }

    /// Cancel and abort every worker
    pub(crate) fn shutdown(&mut self) {
        for (id, worker) in self.active.drain() {
            worker.cancel.cancel();
            worker.join_handle.abort();
            debug!("Aborted worker for task {}", id);
            worker.answer_waiters(false);
        }
    }
}
