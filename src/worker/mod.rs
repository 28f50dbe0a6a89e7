//! Worker contract and the built-in HTTP worker

pub mod http;
pub mod traits;

pub use http::{HttpWorker, HttpWorkerFactory};
pub use traits::{ProgressReporter, Worker, WorkerFactory, WorkerOutcome};
