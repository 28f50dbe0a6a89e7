//! SoundLoader download queue
//!
//! Accepts requests to fetch remote media, runs a bounded number of them
//! concurrently, retries transient failures, and persists its state between runs.

pub mod importer;
pub mod queue;
pub mod utils;
pub mod worker;

// Re-export main types for easier use
pub use importer::LibraryImporter;
pub use queue::{
    EventJournal, Metadata, MetadataValue, QueueEvent, QueueManager, Task, TaskId, TaskStatus,
};
pub use utils::{QueueError, QueueSettings};
pub use worker::{HttpWorkerFactory, ProgressReporter, Worker, WorkerFactory, WorkerOutcome};
