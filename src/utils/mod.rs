//! Utility modules for error handling, configuration and paths

pub mod config;
pub mod error;
pub mod paths;

// Re-export for convenience
pub use config::QueueSettings;
pub use error::QueueError;
pub use paths::{get_app_data_dir, get_downloads_dir, get_settings_path};
