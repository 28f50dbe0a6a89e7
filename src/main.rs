//! SoundLoader - headless download queue runner
//!
//! Restores the saved queue, adds any URLs given on the command line, runs
//! until every task has finished, and saves the queue again. Ctrl-C pauses
//! in-flight downloads and saves them for the next run.

use anyhow::{Context, Result};
use clap::Parser;
use soundloader::queue::{EventJournal, QueueEvent, QueueManager, TaskStatus};
use soundloader::utils::{get_settings_path, QueueSettings};
use soundloader::{HttpWorkerFactory, Metadata};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Download queue for your local audio collection")]
struct Args {
    /// URLs to add to the queue
    urls: Vec<String>,

    /// Settings file (JSON)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Maximum concurrent downloads
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Failed attempts allowed per task
    #[arg(long)]
    max_retries: Option<u32>,

    /// Directory downloads are written to
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Saved queue state
    #[arg(long)]
    state: Option<PathBuf>,

    /// Do not write the event journal
    #[arg(long)]
    no_journal: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings_path = args.settings.clone().unwrap_or_else(get_settings_path);
    let mut settings = QueueSettings::load(&settings_path)
        .with_context(|| format!("Failed to read settings from {:?}", settings_path))?;
    if let Some(n) = args.max_concurrent {
        settings.max_concurrent = n;
    }
    if let Some(n) = args.max_retries {
        settings.max_retries = n;
    }
    if let Some(dir) = args.download_dir {
        settings.download_dir = dir;
    }
    if let Some(state) = args.state {
        settings.state_file = state;
    }
    if args.no_journal {
        settings.journal_file = None;
    }
    let settings = settings.sanitized();

    let factory = Arc::new(HttpWorkerFactory::new()?);
    let queue = QueueManager::new(&settings, factory, None);

    if let Some(journal_path) = &settings.journal_file {
        let journal = EventJournal::open(journal_path)
            .await
            .with_context(|| format!("Failed to open event journal {:?}", journal_path))?;
        info!("Recording queue events to {:?}", journal.path());
        tokio::spawn(journal.record(queue.subscribe()));
    }

    if settings.state_file.exists() {
        queue
            .load(&settings.state_file)
            .await
            .with_context(|| format!("Failed to load queue from {:?}", settings.state_file))?;
        let resumed = queue.resume_all().await?;
        if resumed > 0 {
            info!("Resuming {} paused downloads", resumed);
        }
    }

    for url in args.urls {
        queue.add(url, Metadata::new()).await?;
    }

    if queue.list().await?.is_empty() {
        println!("Nothing to download.");
        queue.shutdown().await?;
        return Ok(());
    }

    let events = queue.subscribe();
    queue.start().await?;

    tokio::select! {
        _ = report_until_done(events) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, pausing active downloads");
            queue.stop().await?;
            for task in queue.list().await? {
                if task.status == TaskStatus::Downloading && !queue.pause(task.id).await? {
                    warn!("Task {} finished before it could be paused", task.id);
                }
            }
        }
    }

    queue
        .save(&settings.state_file)
        .await
        .with_context(|| format!("Failed to save queue to {:?}", settings.state_file))?;

    let tasks = queue.list().await?;
    let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
    println!(
        "Completed: {}  Failed: {}  Canceled: {}  Paused: {}",
        count(TaskStatus::Completed),
        count(TaskStatus::Failed),
        count(TaskStatus::Canceled),
        count(TaskStatus::Paused),
    );

    queue.shutdown().await?;
    Ok(())
}

async fn report_until_done(mut events: broadcast::Receiver<QueueEvent>) {
    loop {
        match events.recv().await {
            Ok(QueueEvent::ItemCompleted { task_id, metadata, .. }) => {
                let path = metadata
                    .get("file_path")
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                println!("✓ {} {}", task_id, path);
            }
            Ok(QueueEvent::ItemFailed { task_id, error, .. }) => {
                println!("✗ {} {}", task_id, error);
            }
            Ok(QueueEvent::TaskRetrying {
                task_id,
                retry_count,
                ..
            }) => {
                println!("↻ {} retry {}", task_id, retry_count);
            }
            Ok(QueueEvent::QueueCompleted { .. }) => break,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
