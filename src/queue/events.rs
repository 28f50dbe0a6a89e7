use crate::queue::task::{Metadata, TaskId};
use crate::utils::error::QueueError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

/// Events that describe changes in the download queue state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueueEvent {
    /// A new task was added to the queue
    TaskAdded {
        task_id: TaskId,
        source_ref: String,
        timestamp: DateTime<Utc>,
    },
    /// A task was admitted and its worker started
    TaskStarted {
        task_id: TaskId,
        timestamp: DateTime<Utc>,
    },
    /// A worker reported progress
    TaskProgress {
        task_id: TaskId,
        progress: u8,
        timestamp: DateTime<Utc>,
    },
    /// A task's worker acknowledged a pause
    TaskPaused {
        task_id: TaskId,
        timestamp: DateTime<Utc>,
    },
    /// A paused task went back to pending
    TaskResumed {
        task_id: TaskId,
        timestamp: DateTime<Utc>,
    },
    /// A task was canceled
    TaskCanceled {
        task_id: TaskId,
        timestamp: DateTime<Utc>,
    },
    /// A failed attempt was put back into the admission pool
    TaskRetrying {
        task_id: TaskId,
        retry_count: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// A task completed successfully
    ItemCompleted {
        task_id: TaskId,
        metadata: Metadata,
        timestamp: DateTime<Utc>,
    },
    /// A task failed and will not be retried
    ItemFailed {
        task_id: TaskId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// Every task has reached a terminal state
    QueueCompleted { timestamp: DateTime<Utc> },
}

impl QueueEvent {
    /// The task this event concerns, if any
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            QueueEvent::TaskAdded { task_id, .. }
            | QueueEvent::TaskStarted { task_id, .. }
            | QueueEvent::TaskProgress { task_id, .. }
            | QueueEvent::TaskPaused { task_id, .. }
            | QueueEvent::TaskResumed { task_id, .. }
            | QueueEvent::TaskCanceled { task_id, .. }
            | QueueEvent::TaskRetrying { task_id, .. }
            | QueueEvent::ItemCompleted { task_id, .. }
            | QueueEvent::ItemFailed { task_id, .. } => Some(*task_id),
            QueueEvent::QueueCompleted { .. } => None,
        }
    }
}

/// Append-only journal of queue events, one JSON document per line
#[derive(Debug, Clone)]
pub struct EventJournal {
    file_path: PathBuf,
    writer: Arc<Mutex<BufWriter<File>>>,
}

impl EventJournal {
    pub async fn open(file_path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)
            .await?;

        Ok(Self {
            file_path: file_path.to_path_buf(),
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Append an event to the journal
    pub async fn append(&self, event: &QueueEvent) -> Result<(), QueueError> {
        let json = serde_json::to_string(event)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Record events from a queue subscription until the queue goes away
    pub async fn record(self, mut events: broadcast::Receiver<QueueEvent>) {
        loop {
            match events.recv().await {
                Ok(QueueEvent::TaskProgress { .. }) => {}
                Ok(event) => {
                    if let Err(e) = self.append(&event).await {
                        warn!("Failed to write event journal {:?}: {}", self.file_path, e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event journal lagged, {} events were not recorded", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Event journal {:?} closed", self.file_path);
    }

    /// Read every event back, skipping lines that do not parse
    pub async fn read_events(&self) -> Result<Vec<QueueEvent>, QueueError> {
        if !self.file_path.exists() {
            return Ok(Vec::new());
        }

        let content = tokio::fs::read_to_string(&self.file_path).await?;
        let mut events = Vec::new();

        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<QueueEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!("Skipping unreadable journal line: {}", e),
            }
        }
        Ok(events)
    }
}
