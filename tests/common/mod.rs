//! Shared test fixtures: scriptable workers and queue helpers
#![allow(dead_code)]

use async_trait::async_trait;
use soundloader::queue::{QueueManager, ResultMetadata, Task, TaskId, TaskStatus};
use soundloader::{
    LibraryImporter, Metadata, ProgressReporter, QueueSettings, Worker, WorkerFactory,
    WorkerOutcome,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Instruction sent to a scripted worker
#[derive(Debug)]
pub enum Step {
    Progress(u8),
    Succeed(ResultMetadata),
    Fail(String),
    /// Let a worker that is holding a stop request go
    Release,
    Panic(String),
}

/// Worker driven step by step from the test
struct ScriptedWorker {
    steps: mpsc::UnboundedReceiver<Step>,
    slow_stop: bool,
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn run(
        self: Box<Self>,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> WorkerOutcome {
        let ScriptedWorker {
            mut steps,
            slow_stop,
        } = *self;

        loop {
            tokio::select! {
                step = steps.recv() => match step {
                    Some(Step::Progress(p)) => progress.report(p).await,
                    Some(Step::Succeed(meta)) => return WorkerOutcome::Success(meta),
                    Some(Step::Fail(e)) => return WorkerOutcome::Failure(e),
                    Some(Step::Release) => {}
                    Some(Step::Panic(msg)) => panic!("{}", msg),
                    None => return WorkerOutcome::Failure("script dropped".into()),
                },
                _ = cancel.cancelled() => break,
            }
        }

        if slow_stop {
            // Hold the acknowledgement until the test says so
            while let Some(step) = steps.recv().await {
                match step {
                    Step::Progress(p) => progress.report(p).await,
                    Step::Succeed(meta) => return WorkerOutcome::Success(meta),
                    Step::Release => break,
                    Step::Panic(msg) => panic!("{}", msg),
                    Step::Fail(_) => {}
                }
            }
        }
        WorkerOutcome::Failure("canceled".into())
    }
}

/// Factory recording every worker it creates, keyed by source reference
#[derive(Default)]
pub struct ScriptedFactory {
    controls: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Step>>>>,
    destinations: Mutex<Vec<PathBuf>>,
    slow_stop: bool,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Workers from this factory acknowledge a stop only after [`Step::Release`]
    pub fn with_slow_stop() -> Arc<Self> {
        Arc::new(Self {
            slow_stop: true,
            ..Self::default()
        })
    }

    /// How many workers were created for `source`
    pub fn created(&self, source: &str) -> usize {
        self.controls
            .lock()
            .unwrap()
            .get(source)
            .map_or(0, Vec::len)
    }

    pub fn total_created(&self) -> usize {
        self.controls.lock().unwrap().values().map(Vec::len).sum()
    }

    pub fn destinations(&self) -> Vec<PathBuf> {
        self.destinations.lock().unwrap().clone()
    }

    /// Send a step to the most recent worker for `source`
    pub fn send(&self, source: &str, step: Step) {
        let controls = self.controls.lock().unwrap();
        let sender = controls
            .get(source)
            .and_then(|workers| workers.last())
            .unwrap_or_else(|| panic!("no worker was created for {}", source));
        let _ = sender.send(step);
    }

    pub fn succeed(&self, source: &str) {
        self.send(source, Step::Succeed(ResultMetadata::new()));
    }

    pub fn succeed_with(&self, source: &str, pairs: &[(&str, &str)]) {
        let result = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.send(source, Step::Succeed(result));
    }

    pub fn fail(&self, source: &str, error: &str) {
        self.send(source, Step::Fail(error.to_string()));
    }

    pub fn progress(&self, source: &str, percent: u8) {
        self.send(source, Step::Progress(percent));
    }

    /// Make the worker for `source` panic instead of returning an outcome
    pub fn panic(&self, source: &str, message: &str) {
        self.send(source, Step::Panic(message.to_string()));
    }

    pub fn release(&self, source: &str) {
        self.send(source, Step::Release);
    }
}

impl WorkerFactory for ScriptedFactory {
    fn create(&self, source_ref: &str, destination: &Path) -> Box<dyn Worker> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.controls
            .lock()
            .unwrap()
            .entry(source_ref.to_string())
            .or_default()
            .push(tx);
        self.destinations
            .lock()
            .unwrap()
            .push(destination.to_path_buf());
        Box::new(ScriptedWorker {
            steps: rx,
            slow_stop: self.slow_stop,
        })
    }
}

/// Importer that records calls and optionally fails them
#[derive(Default)]
pub struct RecordingImporter {
    pub calls: Mutex<Vec<(PathBuf, Metadata)>>,
    pub fail: bool,
}

#[async_trait]
impl LibraryImporter for RecordingImporter {
    async fn import_file(&self, path: &Path, metadata: &Metadata) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((path.to_path_buf(), metadata.clone()));
        if self.fail {
            anyhow::bail!("catalog is read-only");
        }
        Ok(())
    }
}

pub fn settings(max_concurrent: usize, max_retries: u32) -> QueueSettings {
    QueueSettings {
        download_dir: PathBuf::from("/tmp/soundloader-test"),
        max_concurrent,
        max_retries,
        journal_file: None,
        ..Default::default()
    }
}

pub fn queue(max_concurrent: usize, max_retries: u32) -> (QueueManager, Arc<ScriptedFactory>) {
    let factory = ScriptedFactory::new();
    let queue = QueueManager::new(&settings(max_concurrent, max_retries), factory.clone(), None);
    (queue, factory)
}

pub async fn add(queue: &QueueManager, source: &str) -> TaskId {
    queue.add(source, Metadata::new()).await.expect("add task")
}

pub async fn task(queue: &QueueManager, id: TaskId) -> Task {
    queue
        .get(id)
        .await
        .expect("queue alive")
        .expect("task exists")
}

pub async fn status(queue: &QueueManager, id: TaskId) -> TaskStatus {
    task(queue, id).await.status
}

/// Poll until the task satisfies `check`, failing after two seconds
pub async fn wait_for<F>(queue: &QueueManager, id: TaskId, check: F) -> Task
where
    F: Fn(&Task) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let current = task(queue, id).await;
        if check(&current) {
            return current;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting on task {}: {:?}", id, current);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_status(queue: &QueueManager, id: TaskId, expected: TaskStatus) -> Task {
    wait_for(queue, id, |t| t.status == expected).await
}

pub async fn downloading_count(queue: &QueueManager) -> usize {
    queue
        .list()
        .await
        .expect("queue alive")
        .iter()
        .filter(|t| t.status == TaskStatus::Downloading)
        .count()
}
