//! Stress tests for QueueManager
//!
//! These tests try to break the concurrency model by:
//! 1. Spawning many concurrent operations
//! 2. Randomly interleaving pause/resume/cancel with worker outcomes
//! 3. Checking invariants after every operation
//!
//! Invariants tested:
//! A - Concurrency Bound: Downloading tasks <= max_concurrent
//! B - Retry Bound: retry_count <= max_retries
//! C - Unique Ids: no task id appears twice
//! D - Eventual Progress: with pauses lifted, every task ends terminal

use async_trait::async_trait;
use rand::Rng;
use soundloader::queue::{QueueManager, ResultMetadata, TaskStatus};
use soundloader::{
    Metadata, ProgressReporter, QueueSettings, Worker, WorkerFactory, WorkerOutcome,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Worker that runs for a random short time and randomly succeeds or fails
struct FlakyWorker {
    steps: u8,
    step_delay: Duration,
    fails: bool,
}

#[async_trait]
impl Worker for FlakyWorker {
    async fn run(
        self: Box<Self>,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> WorkerOutcome {
        for step in 1..=self.steps {
            tokio::select! {
                _ = sleep(self.step_delay) => {}
                _ = cancel.cancelled() => return WorkerOutcome::Failure("canceled".into()),
            }
            progress.report(step * (100 / self.steps)).await;
        }
        if self.fails {
            WorkerOutcome::Failure("flaky network".into())
        } else {
            WorkerOutcome::Success(ResultMetadata::new())
        }
    }
}

struct FlakyFactory {
    created: AtomicUsize,
}

impl WorkerFactory for FlakyFactory {
    fn create(&self, _source_ref: &str, _destination: &Path) -> Box<dyn Worker> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let mut rng = rand::thread_rng();
        Box::new(FlakyWorker {
            steps: rng.gen_range(1..=4),
            step_delay: Duration::from_millis(rng.gen_range(1..5)),
            fails: rng.gen_bool(0.3),
        })
    }
}

fn create_test_queue(
    max_concurrent: usize,
    max_retries: u32,
) -> (QueueManager, Arc<FlakyFactory>) {
    let factory = Arc::new(FlakyFactory {
        created: AtomicUsize::new(0),
    });
    let settings = QueueSettings {
        download_dir: PathBuf::from("/tmp/soundloader-stress"),
        max_concurrent,
        max_retries,
        journal_file: None,
        ..Default::default()
    };
    (QueueManager::new(&settings, factory.clone(), None), factory)
}

async fn check_invariants(
    qm: &QueueManager,
    max_concurrent: usize,
    max_retries: u32,
) -> Result<(), String> {
    let tasks = qm.list().await.map_err(|e| e.to_string())?;

    let downloading = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Downloading)
        .count();
    if downloading > max_concurrent {
        return Err(format!(
            "INVARIANT A VIOLATED: {} tasks Downloading, max_concurrent = {}",
            downloading, max_concurrent
        ));
    }

    if let Some(t) = tasks.iter().find(|t| t.retry_count > max_retries) {
        return Err(format!(
            "INVARIANT B VIOLATED: task {} has retry_count {}",
            t.id, t.retry_count
        ));
    }

    let mut ids = HashSet::new();
    for task in &tasks {
        if !ids.insert(task.id) {
            return Err(format!("INVARIANT C VIOLATED: duplicate id {}", task.id));
        }
    }
    Ok(())
}

async fn wait_until_all_terminal(qm: &QueueManager) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let tasks = qm.list().await.unwrap();
        if tasks.iter().all(|t| t.status.is_terminal()) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "INVARIANT D VIOLATED: tasks never settled: {:?}",
            tasks
                .iter()
                .filter(|t| !t.status.is_terminal())
                .map(|t| t.status)
                .collect::<Vec<_>>()
        );
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_test_random_operations() {
    const NUM_TASKS: usize = 40;
    const MAX_CONCURRENT: usize = 3;
    const MAX_RETRIES: u32 = 2;
    const OPERATION_ROUNDS: usize = 150;

    let (qm, _factory) = create_test_queue(MAX_CONCURRENT, MAX_RETRIES);
    let mut ids = Vec::with_capacity(NUM_TASKS);
    for i in 0..NUM_TASKS {
        ids.push(
            qm.add(format!("https://example.com/{}.mp3", i), Metadata::new())
                .await
                .unwrap(),
        );
    }
    qm.start().await.unwrap();

    for round in 0..OPERATION_ROUNDS {
        let (id, operation, pause_for) = {
            let mut rng = rand::thread_rng();
            (
                ids[rng.gen_range(0..NUM_TASKS)],
                rng.gen_range(0..6),
                rng.gen_bool(0.3).then(|| rng.gen_range(1..5)),
            )
        };

        match operation {
            0 => {
                let _ = qm.pause(id).await;
            }
            1 => {
                let _ = qm.resume(id).await;
            }
            2 => {
                let _ = qm.resume_all().await;
            }
            3 => {
                if round % 10 == 0 {
                    let _ = qm.cancel(id).await;
                }
            }
            4 => {
                let _ = qm.start().await;
            }
            _ => {}
        }

        check_invariants(&qm, MAX_CONCURRENT, MAX_RETRIES)
            .await
            .unwrap_or_else(|e| panic!("round {}: {}", round, e));

        if let Some(ms) = pause_for {
            sleep(Duration::from_millis(ms)).await;
        }
        tokio::task::yield_now().await;
    }

    // Lift every pause and let the queue drain
    qm.start().await.unwrap();
    qm.resume_all().await.unwrap();
    wait_until_all_terminal(&qm).await;
    check_invariants(&qm, MAX_CONCURRENT, MAX_RETRIES)
        .await
        .expect("final invariants");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_test_concurrent_callers() {
    const CALLERS: usize = 8;
    const TASKS_PER_CALLER: usize = 10;
    const MAX_CONCURRENT: usize = 2;

    let (qm, factory) = create_test_queue(MAX_CONCURRENT, 1);
    qm.start().await.unwrap();

    let mut handles = Vec::new();
    for caller in 0..CALLERS {
        let qm = qm.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..TASKS_PER_CALLER {
                let id = qm
                    .add(format!("caller-{}-{}", caller, i), Metadata::new())
                    .await
                    .unwrap();
                if i % 3 == 0 {
                    let _ = qm.pause(id).await;
                    let _ = qm.resume(id).await;
                }
                let _ = qm.start().await;
                check_invariants(&qm, MAX_CONCURRENT, 1).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    wait_until_all_terminal(&qm).await;
    let tasks = qm.list().await.unwrap();
    assert_eq!(tasks.len(), CALLERS * TASKS_PER_CALLER);
    // Each task ran at least once, and a failed task at most once more
    let created = factory.created.load(Ordering::SeqCst);
    assert!(created >= tasks.len());
    assert!(created <= tasks.len() * 3);
}
