//! Error handling for SoundLoader

use thiserror::Error;

/// Main error type for the download queue
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid queue document: {0}")]
    InvalidDocument(String),

    #[error("Queue control loop is no longer running")]
    QueueClosed,
}
