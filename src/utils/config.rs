//! Queue configuration

use crate::utils::error::QueueError;
use crate::utils::paths::{get_downloads_dir, get_journal_path, get_state_path};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Directory handed to workers as their download destination
    pub download_dir: PathBuf,

    /// Maximum concurrent downloads
    pub max_concurrent: usize,

    /// Failed attempts allowed before a task is marked failed
    pub max_retries: u32,

    /// Where the queue is saved between runs
    pub state_file: PathBuf,

    /// Append-only event journal, if enabled
    pub journal_file: Option<PathBuf>,

    /// Capacity of the control loop's mailbox
    pub mailbox_capacity: usize,

    /// Events buffered per subscriber before it starts lagging
    pub event_capacity: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            download_dir: get_downloads_dir(),
            max_concurrent: 3,
            max_retries: 3,
            state_file: get_state_path(),
            journal_file: Some(get_journal_path()),
            mailbox_capacity: 256,
            event_capacity: 256,
        }
    }
}

impl QueueSettings {
    /// Load settings from a JSON file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self, QueueError> {
        if !path.exists() {
            return Ok(Self::default().sanitized());
        }
        let content = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&content)?;
        Ok(settings.sanitized())
    }

    /// Enforce sane minimums
    pub fn sanitized(mut self) -> Self {
        self.max_concurrent = self.max_concurrent.max(1);
        self.mailbox_capacity = self.mailbox_capacity.max(1);
        self.event_capacity = self.event_capacity.max(1);
        self
    }
}
