//! Hook into the library catalog for finished downloads

use crate::queue::task::Metadata;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

/// Receives every completed download
///
/// Called fire-and-forget: an error is logged by the queue and never changes
/// the task's completed status.
#[async_trait]
pub trait LibraryImporter: Send + Sync {
    async fn import_file(&self, path: &Path, metadata: &Metadata) -> Result<()>;
}
