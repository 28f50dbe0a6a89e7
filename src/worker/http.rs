//! Streaming HTTP worker

use crate::queue::task::{ResultMetadata, TaskId};
use crate::worker::traits::{ProgressReporter, Worker, WorkerFactory, WorkerOutcome};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Creates [`HttpWorker`]s sharing one connection pool
#[derive(Debug, Clone)]
pub struct HttpWorkerFactory {
    client: Client,
}

impl HttpWorkerFactory {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("soundloader/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl WorkerFactory for HttpWorkerFactory {
    fn create(&self, source_ref: &str, destination: &Path) -> Box<dyn Worker> {
        Box::new(HttpWorker {
            client: self.client.clone(),
            url: source_ref.to_string(),
            destination: destination.to_path_buf(),
        })
    }
}

/// Downloads one URL into the destination directory
#[derive(Debug)]
pub struct HttpWorker {
    client: Client,
    url: String,
    destination: PathBuf,
}

/// File name for a URL: its last non-empty path segment, without query or fragment
pub fn file_name_for(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let after_scheme = without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query);

    after_scheme
        .split('/')
        .skip(1)
        .filter(|segment| !segment.is_empty())
        .last()
        .map(|segment| segment.replace(['\\', ':'], "_"))
        .unwrap_or_else(|| "download.bin".to_string())
}

/// Where a task's download lands. The task id prefix keeps concurrent
/// downloads of same-named files apart.
pub fn target_path(destination: &Path, task_id: TaskId, url: &str) -> PathBuf {
    destination.join(format!("{}-{}", task_id, file_name_for(url)))
}

enum Transfer {
    Done { bytes: u64, content_type: Option<String> },
    Canceled,
}

impl HttpWorker {
    async fn transfer(
        &self,
        target: &Path,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Transfer> {
        let response = tokio::select! {
            response = self.client.get(&self.url).send() => response?,
            _ = cancel.cancelled() => return Ok(Transfer::Canceled),
        };

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("HTTP error: {}", response.status()));
        }

        let total = response.content_length().unwrap_or(0);
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        tokio::fs::create_dir_all(&self.destination).await?;
        let mut file = BufWriter::new(File::create(target).await?);
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;
        let mut last_percent = 0u8;

        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    return Ok(Transfer::Canceled);
                }
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if total > 0 {
                let percent = ((downloaded.min(total) * 100) / total) as u8;
                if percent != last_percent {
                    last_percent = percent;
                    progress.report(percent).await;
                }
            }
        }

        file.flush().await?;
        Ok(Transfer::Done {
            bytes: downloaded,
            content_type,
        })
    }
}

#[async_trait]
impl Worker for HttpWorker {
    async fn run(
        self: Box<Self>,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> WorkerOutcome {
        let target = target_path(&self.destination, progress.task_id(), &self.url);
        debug!("Task {} downloading {} to {:?}", progress.task_id(), self.url, target);

        match self.transfer(&target, &progress, &cancel).await {
            Ok(Transfer::Done {
                bytes,
                content_type,
            }) => {
                info!("Downloaded {} ({} bytes)", self.url, bytes);
                let mut result = ResultMetadata::new();
                result.insert("file_path".into(), target.to_string_lossy().into_owned());
                result.insert("bytes".into(), bytes.to_string());
                if let Some(content_type) = content_type {
                    result.insert("content_type".into(), content_type);
                }
                WorkerOutcome::Success(result)
            }
            Ok(Transfer::Canceled) => {
                debug!("Download of {} stopped on request", self.url);
                WorkerOutcome::Failure("canceled".to_string())
            }
            Err(e) => {
                warn!("Download of {} failed: {:#}", self.url, e);
                WorkerOutcome::Failure(format!("{:#}", e))
            }
        }
    }
}
