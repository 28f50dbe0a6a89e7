//! Durable queue state: a JSON document of every non-downloading task

use crate::queue::task::Task;
use crate::utils::error::QueueError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Saved form of the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDocument {
    pub max_concurrent: usize,
    pub items: Vec<Task>,
}

impl QueueDocument {
    fn validate(&self) -> Result<(), QueueError> {
        let mut seen = HashSet::with_capacity(self.items.len());
        for task in &self.items {
            if !seen.insert(task.id) {
                return Err(QueueError::InvalidDocument(format!(
                    "duplicate task id {}",
                    task.id
                )));
            }
            if let Some((key, value)) = task
                .metadata
                .iter()
                .find(|(_, value)| !value.is_representable())
            {
                return Err(QueueError::InvalidDocument(format!(
                    "task {} metadata {:?} holds {}, which JSON cannot store",
                    task.id, key, value
                )));
            }
        }
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write the document next to its destination, then move it into place
pub async fn write_document(path: &Path, document: &QueueDocument) -> Result<(), QueueError> {
    document.validate()?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let json = serde_json::to_vec_pretty(document)?;
    let staging = temp_path(path);
    tokio::fs::write(&staging, &json).await?;
    tokio::fs::rename(&staging, path).await?;

    debug!("Wrote {} tasks to {:?}", document.items.len(), path);
    Ok(())
}

/// Read and validate a saved document
pub async fn read_document(path: &Path) -> Result<QueueDocument, QueueError> {
    let content = tokio::fs::read(path).await?;
    let document: QueueDocument = serde_json::from_slice(&content)?;
    document.validate()?;

    debug!("Read {} tasks from {:?}", document.items.len(), path);
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::task::{Metadata, TaskStatus};
    use tempfile::tempdir;

    #[test]
    fn test_document_uses_camel_case_fields() {
        let mut task = Task::new("https://example.com/track.mp3", Metadata::new());
        task.status = TaskStatus::Failed;
        task.retry_count = 3;
        task.last_error = Some("404".into());
        let document = QueueDocument {
            max_concurrent: 2,
            items: vec![task],
        };

        let value = serde_json::to_value(&document).unwrap();
        assert_eq!(value["maxConcurrent"], 2);
        let item = &value["items"][0];
        assert_eq!(item["sourceRef"], "https://example.com/track.mp3");
        assert_eq!(item["status"], "Failed");
        assert_eq!(item["retryCount"], 3);
        assert_eq!(item["lastError"], "404");
        assert_eq!(item["progress"], 0);
    }

    #[tokio::test]
    async fn test_write_creates_parent_and_leaves_no_staging_file() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("state").join("queue.json");
        let document = QueueDocument {
            max_concurrent: 1,
            items: vec![Task::new("a", Metadata::new())],
        };

        write_document(&path, &document).await.unwrap();

        assert!(path.exists());
        assert!(!temp_path(&path).exists());
        assert_eq!(read_document(&path).await.unwrap(), document);
    }

    #[tokio::test]
    async fn test_read_missing_file_is_io_error() {
        let dir = tempdir().expect("temp dir");
        let err = read_document(&dir.path().join("absent.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Io(_)));
    }

    #[tokio::test]
    async fn test_read_rejects_garbage_and_duplicates() {
        let dir = tempdir().expect("temp dir");
        let garbage = dir.path().join("garbage.json");
        tokio::fs::write(&garbage, b"{ not json").await.unwrap();
        assert!(matches!(
            read_document(&garbage).await.unwrap_err(),
            QueueError::Serialization(_)
        ));

        let task = Task::new("a", Metadata::new());
        let duplicated = QueueDocument {
            max_concurrent: 1,
            items: vec![task.clone(), task],
        };
        let path = dir.path().join("dup.json");
        tokio::fs::write(&path, serde_json::to_vec(&duplicated).unwrap())
            .await
            .unwrap();
        assert!(matches!(
            read_document(&path).await.unwrap_err(),
            QueueError::InvalidDocument(_)
        ));
    }
}
