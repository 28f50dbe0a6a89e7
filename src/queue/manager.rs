//! Download queue manager with concurrent download support
//!
//! [`QueueManager`] is a cheap, cloneable handle. Every operation becomes a
//! message to a single control loop ([`QueueActor`]) which owns the registry,
//! the active workers and the `running` flag. Workers post their progress and
//! outcome into the same mailbox, so every state transition is serialized
//! without locks.
//!
//! `stop()` only halts *new* admissions. Tasks that are already downloading
//! keep running, and their outcomes are still processed.

use crate::importer::LibraryImporter;
use crate::queue::events::QueueEvent;
use crate::queue::persistence::{self, QueueDocument};
use crate::queue::registry::Registry;
use crate::queue::retry::{RetryDecision, RetryPolicy};
use crate::queue::supervisor::{Envelope, WorkerMessage, WorkerSupervisor};
use crate::queue::task::{Metadata, ResultMetadata, Task, TaskId, TaskStatus};
use crate::utils::config::QueueSettings;
use crate::utils::error::QueueError;
use crate::worker::{WorkerFactory, WorkerOutcome};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Requests handled by the control loop
#[derive(Debug)]
pub(crate) enum Command {
    Add {
        source_ref: String,
        metadata: Metadata,
        reply: oneshot::Sender<TaskId>,
    },
    Get {
        id: TaskId,
        reply: oneshot::Sender<Option<Task>>,
    },
    List {
        reply: oneshot::Sender<Vec<Task>>,
    },
    ClearCompleted {
        reply: oneshot::Sender<usize>,
    },
    Start {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    IsRunning {
        reply: oneshot::Sender<bool>,
    },
    Pause {
        id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    Resume {
        id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    ResumeAll {
        reply: oneshot::Sender<usize>,
    },
    Cancel {
        id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<QueueDocument>,
    },
    Merge {
        items: Vec<Task>,
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Download queue handle
#[derive(Clone)]
pub struct QueueManager {
    mailbox: mpsc::Sender<Envelope>,
    events: broadcast::Sender<QueueEvent>,
    max_concurrent: usize,
}

impl QueueManager {
    /// Create the queue and spawn its control loop. Must be called within a tokio runtime.
    pub fn new(
        settings: &QueueSettings,
        factory: Arc<dyn WorkerFactory>,
        importer: Option<Arc<dyn LibraryImporter>>,
    ) -> Self {
        let settings = settings.clone().sanitized();
        let (mailbox, inbox) = mpsc::channel(settings.mailbox_capacity);
        let (events, _) = broadcast::channel(settings.event_capacity);

        let actor = QueueActor {
            registry: Registry::new(
                settings.max_concurrent,
                RetryPolicy::new(settings.max_retries),
            ),
            supervisor: WorkerSupervisor::new(
                factory,
                settings.download_dir.clone(),
                mailbox.downgrade(),
            ),
            importer,
            events: events.clone(),
            running: false,
        };
        tokio::spawn(actor.run(inbox));

        info!(
            "Queue created (max_concurrent={}, max_retries={})",
            settings.max_concurrent, settings.max_retries
        );

        Self {
            mailbox,
            events,
            max_concurrent: settings.max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Receive queue events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, QueueError> {
        let (reply, response) = oneshot::channel();
        self.mailbox
            .send(Envelope::Command(make(reply)))
            .await
            .map_err(|_| QueueError::QueueClosed)?;
        response.await.map_err(|_| QueueError::QueueClosed)
    }

    /// Add a task; it is admitted right away if the queue is running
    pub async fn add(
        &self,
        source_ref: impl Into<String>,
        metadata: Metadata,
    ) -> Result<TaskId, QueueError> {
        let source_ref = source_ref.into();
        self.request(|reply| Command::Add {
            source_ref,
            metadata,
            reply,
        })
        .await
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<Task>, QueueError> {
        self.request(|reply| Command::Get { id, reply }).await
    }

    /// Snapshot of all tasks in insertion order
    pub async fn list(&self) -> Result<Vec<Task>, QueueError> {
        self.request(|reply| Command::List { reply }).await
    }

    /// Remove completed tasks, returning how many were removed
    pub async fn clear_completed(&self) -> Result<usize, QueueError> {
        self.request(|reply| Command::ClearCompleted { reply }).await
    }

    /// Start admitting tasks
    pub async fn start(&self) -> Result<(), QueueError> {
        self.request(|reply| Command::Start { reply }).await
    }

    /// Stop admitting new tasks. Downloads already in flight are not interrupted.
    pub async fn stop(&self) -> Result<(), QueueError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn is_running(&self) -> Result<bool, QueueError> {
        self.request(|reply| Command::IsRunning { reply }).await
    }

    /// Pause a downloading task.
    ///
    /// Resolves only after the worker has acknowledged termination, so a late
    /// message from the old worker can never touch the paused task. Returns
    /// `false` if the task is not downloading, or if it finished or was
    /// canceled before the worker stopped.
    pub async fn pause(&self, id: TaskId) -> Result<bool, QueueError> {
        self.request(|reply| Command::Pause { id, reply }).await
    }

    /// Move a paused task back into the admission pool
    pub async fn resume(&self, id: TaskId) -> Result<bool, QueueError> {
        self.request(|reply| Command::Resume { id, reply }).await
    }

    /// Resume every paused task, returning how many were resumed
    pub async fn resume_all(&self) -> Result<usize, QueueError> {
        self.request(|reply| Command::ResumeAll { reply }).await
    }

    /// Cancel any non-terminal task
    pub async fn cancel(&self, id: TaskId) -> Result<bool, QueueError> {
        self.request(|reply| Command::Cancel { id, reply }).await
    }

    /// Persist every task that is not currently downloading
    pub async fn save(&self, path: &Path) -> Result<(), QueueError> {
        let document = self.request(|reply| Command::Snapshot { reply }).await?;
        persistence::write_document(path, &document).await?;
        info!("Saved {} tasks to {:?}", document.items.len(), path);
        Ok(())
    }

    /// Merge saved tasks into the queue by id. Does not start processing.
    pub async fn load(&self, path: &Path) -> Result<usize, QueueError> {
        let document = persistence::read_document(path).await?;
        if document.max_concurrent != self.max_concurrent {
            debug!(
                "Saved max_concurrent {} ignored, queue keeps {}",
                document.max_concurrent, self.max_concurrent
            );
        }
        let items = document.items;
        let merged = self.request(|reply| Command::Merge { items, reply }).await?;
        info!("Loaded {} tasks from {:?}", merged, path);
        Ok(merged)
    }

    /// Stop the control loop, aborting in-flight workers
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// The control loop: sole owner of queue state
struct QueueActor {
    registry: Registry,
    supervisor: WorkerSupervisor,
    importer: Option<Arc<dyn LibraryImporter>>,
    events: broadcast::Sender<QueueEvent>,
    running: bool,
}

impl QueueActor {
    async fn run(mut self, mut inbox: mpsc::Receiver<Envelope>) {
        debug!("Queue control loop started");

        while let Some(envelope) = inbox.recv().await {
            match envelope {
                Envelope::Command(Command::Shutdown { reply }) => {
                    self.running = false;
                    self.supervisor.shutdown();
                    let _ = reply.send(());
                    break;
                }
                Envelope::Command(command) => self.handle_command(command),
                Envelope::Worker(message) => self.handle_worker(message),
            }
        }

        info!("Queue control loop stopped");
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Add {
                source_ref,
                metadata,
                reply,
            } => {
                let task = Task::new(source_ref, metadata);
                let source_ref = task.source_ref.clone();
                let id = self.registry.insert(task);
                info!("Added task {} to queue", id);
                self.emit(QueueEvent::TaskAdded {
                    task_id: id,
                    source_ref,
                    timestamp: Utc::now(),
                });
                if self.running {
                    self.admission_pass();
                }
                let _ = reply.send(id);
            }
            Command::Get { id, reply } => {
                let _ = reply.send(self.registry.get(&id).cloned());
            }
            Command::List { reply } => {
                let _ = reply.send(self.registry.list());
            }
            Command::ClearCompleted { reply } => {
                let removed = self.registry.clear_completed();
                info!("Cleared {} completed tasks from queue", removed);
                let _ = reply.send(removed);
            }
            Command::Start { reply } => {
                info!("Starting queue processing");
                self.running = true;
                self.admission_pass();
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                info!(
                    "Stopping admissions; {} downloads continue",
                    self.supervisor.active_count()
                );
                self.running = false;
                let _ = reply.send(());
            }
            Command::IsRunning { reply } => {
                let _ = reply.send(self.running);
            }
            Command::Pause { id, reply } => self.pause(id, reply),
            Command::Resume { id, reply } => {
                let resumed = self.resume(id);
                if resumed {
                    self.admission_pass();
                }
                let _ = reply.send(resumed);
            }
            Command::ResumeAll { reply } => {
                let resumed = self
                    .registry
                    .paused_ids()
                    .into_iter()
                    .filter(|id| self.resume(*id))
                    .count();
                if resumed > 0 {
                    self.admission_pass();
                }
                let _ = reply.send(resumed);
            }
            Command::Cancel { id, reply } => {
                let canceled = self.cancel(id);
                self.admission_pass();
                let _ = reply.send(canceled);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(QueueDocument {
                    max_concurrent: self.registry.max_concurrent(),
                    items: self.registry.persistable(),
                });
            }
            Command::Merge { items, reply } => {
                let _ = reply.send(self.registry.merge(items));
            }
            Command::Shutdown { reply } => {
                // Handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    fn handle_worker(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Progress {
                id,
                generation,
                percent,
            } => {
                if !self.supervisor.is_current(&id, generation) || self.supervisor.is_stopping(&id)
                {
                    debug!("Ignoring stale progress for task {}", id);
                    return;
                }
                if self.registry.record_progress(&id, percent) {
                    self.emit(QueueEvent::TaskProgress {
                        task_id: id,
                        progress: percent,
                        timestamp: Utc::now(),
                    });
                }
            }
            WorkerMessage::Finished {
                id,
                generation,
                outcome,
            } => {
                if !self.supervisor.is_current(&id, generation) {
                    debug!("Discarding outcome of superseded worker for task {}", id);
                    return;
                }
                let Some(worker) = self.supervisor.retire(&id) else {
                    return;
                };

                match outcome {
                    WorkerOutcome::Success(result) => {
                        self.on_success(id, result);
                        worker.answer_waiters(false);
                    }
                    WorkerOutcome::Failure(_) if worker.stop_requested() => {
                        self.registry.pause(&id);
                        info!("Paused task {}", id);
                        self.emit(QueueEvent::TaskPaused {
                            task_id: id,
                            timestamp: Utc::now(),
                        });
                        worker.answer_waiters(true);
                    }
                    WorkerOutcome::Failure(error) => self.on_failure(id, error),
                }

                self.admission_pass();
            }
        }
    }

    /// Promote pending tasks in FIFO order until the ceiling is reached
    fn admission_pass(&mut self) {
        if self.running {
            while let Some(id) = self.registry.next_admission() {
                let Some(mailbox) = self.supervisor.mailbox() else {
                    warn!("No queue handles remain, not starting task {}", id);
                    break;
                };
                if !self.registry.mark_downloading(&id) {
                    break;
                }
                let Some(task) = self.registry.get(&id).cloned() else {
                    break;
                };
                self.supervisor.start(&task, mailbox);
                self.emit(QueueEvent::TaskStarted {
                    task_id: id,
                    timestamp: Utc::now(),
                });
            }
        }

        if self.registry.take_queue_completed() {
            info!("All {} tasks reached a terminal state", self.registry.len());
            self.emit(QueueEvent::QueueCompleted {
                timestamp: Utc::now(),
            });
        }
    }

    fn pause(&mut self, id: TaskId, reply: oneshot::Sender<bool>) {
        if self.registry.status(&id) != Some(TaskStatus::Downloading) {
            let _ = reply.send(false);
            return;
        }
        // The status flips once the worker's outcome arrives
        if let Err(reply) = self.supervisor.request_stop(&id, reply) {
            warn!("Task {} is downloading without a worker", id);
            let _ = reply.send(false);
        }
    }

    fn resume(&mut self, id: TaskId) -> bool {
        if !self.registry.resume(&id) {
            return false;
        }
        info!("Resumed task {}", id);
        self.emit(QueueEvent::TaskResumed {
            task_id: id,
            timestamp: Utc::now(),
        });
        true
    }

    fn cancel(&mut self, id: TaskId) -> bool {
        let Some(previous) = self.registry.cancel(&id) else {
            return false;
        };
        if previous == TaskStatus::Downloading {
            self.supervisor.abandon(&id);
        }
        info!("Cancelled task {} (was {})", id, previous);
        self.emit(QueueEvent::TaskCanceled {
            task_id: id,
            timestamp: Utc::now(),
        });
        true
    }

    fn on_success(&mut self, id: TaskId, result: ResultMetadata) {
        let Some(metadata) = self.registry.complete(&id, &result) else {
            return;
        };
        info!("Task {} completed successfully", id);

        if let Some(importer) = &self.importer {
            let path = result
                .get("file_path")
                .map(PathBuf::from)
                .unwrap_or_else(|| self.supervisor.destination().clone());
            let importer = Arc::clone(importer);
            let import_metadata = metadata.clone();
            tokio::spawn(async move {
                match importer.import_file(&path, &import_metadata).await {
                    Ok(()) => info!("Imported {:?} for task {}", path, id),
                    Err(e) => warn!("Library import of {:?} for task {} failed: {}", path, id, e),
                }
            });
        }

        self.emit(QueueEvent::ItemCompleted {
            task_id: id,
            metadata,
            timestamp: Utc::now(),
        });
    }

    fn on_failure(&mut self, id: TaskId, error: String) {
        match self.registry.fail(&id, &error) {
            Some(RetryDecision::Requeue) => {
                let retry_count = self
                    .registry
                    .get(&id)
                    .map(|t| t.retry_count)
                    .unwrap_or_default();
                warn!(
                    "Task {} failed (attempt {} of {}), retrying: {}",
                    id,
                    retry_count,
                    self.registry.max_retries(),
                    error
                );
                self.emit(QueueEvent::TaskRetrying {
                    task_id: id,
                    retry_count,
                    error,
                    timestamp: Utc::now(),
                });
            }
            Some(RetryDecision::GiveUp) => {
                error!("Task {} failed: {}", id, error);
                self.emit(QueueEvent::ItemFailed {
                    task_id: id,
                    error,
                    timestamp: Utc::now(),
                });
            }
            None => debug!("Failure for task {} ignored, not downloading", id),
        }
    }
}
