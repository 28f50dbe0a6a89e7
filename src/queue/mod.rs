pub mod events;
pub mod manager;
pub mod persistence;
pub mod registry;
pub mod retry;
pub(crate) mod supervisor;
pub mod task;

pub use events::{EventJournal, QueueEvent};
pub use manager::QueueManager;
pub use persistence::QueueDocument;
pub use retry::{RetryDecision, RetryPolicy};
pub use task::{Metadata, MetadataValue, ResultMetadata, Task, TaskId, TaskStatus};
