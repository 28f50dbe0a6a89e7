use crate::queue::supervisor::{Envelope, WorkerMessage};
use crate::queue::task::{ResultMetadata, TaskId};
use async_trait::async_trait;
use std::path::Path;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Terminal outcome of one worker run
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Success(ResultMetadata),
    Failure(String),
}

/// Unit of execution performing the transfer for one task
///
/// A worker reports progress as often as it likes and returns exactly one
/// outcome. When `cancel` fires it should stop promptly and return; whatever
/// it returns after cancellation is treated as the termination acknowledgement.
#[async_trait]
pub trait Worker: Send {
    async fn run(self: Box<Self>, progress: ProgressReporter, cancel: CancellationToken)
        -> WorkerOutcome;
}

/// Creates workers for admitted tasks
pub trait WorkerFactory: Send + Sync {
    fn create(&self, source_ref: &str, destination: &Path) -> Box<dyn Worker>;
}

/// Progress channel handed to a worker, tagged with the run it belongs to
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    generation: u64,
    mailbox: mpsc::Sender<Envelope>,
}

impl ProgressReporter {
    pub(crate) fn new(task_id: TaskId, generation: u64, mailbox: mpsc::Sender<Envelope>) -> Self {
        Self {
            task_id,
            generation,
            mailbox,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Report completion percentage; values above 100 are clamped
    pub async fn report(&self, percent: u8) {
        let message = WorkerMessage::Progress {
            id: self.task_id,
            generation: self.generation,
            percent: percent.min(100),
        };
        if self.mailbox.send(Envelope::Worker(message)).await.is_err() {
            debug!("Queue closed, dropping progress for task {}", self.task_id);
        }
    }
}
