//! Platform path resolution
//!
//! All paths are resolved from the platform's standard directories rather than
//! the current working directory, which is `/` when a desktop app is launched
//! from a file manager or dock.

use std::path::PathBuf;
use tracing::{debug, warn};

const APP_DIR: &str = "SoundLoader";

/// Get the application data directory.
///
/// Returns the platform data directory joined with `SoundLoader`
/// (e.g. `~/.local/share/SoundLoader` or `~/Library/Application Support/SoundLoader`).
pub fn get_app_data_dir() -> PathBuf {
    let dir = dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))
        .unwrap_or_else(|| {
            warn!("Could not determine data directory, using the temp dir");
            std::env::temp_dir()
        })
        .join(APP_DIR);

    debug!("App data directory: {:?}", dir);
    dir
}

/// Saved queue state
pub fn get_state_path() -> PathBuf {
    get_app_data_dir().join("queue.json")
}

/// Event journal
pub fn get_journal_path() -> PathBuf {
    get_app_data_dir().join("events.jsonl")
}

/// User settings
pub fn get_settings_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(get_app_data_dir)
        .join("settings.json")
}

/// Get the downloads directory.
///
/// Falls back to `~/Downloads`, then to the temp dir, if the standard lookup fails.
pub fn get_downloads_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| {
            warn!("Could not determine Downloads directory, using the temp dir");
            std::env::temp_dir()
        })
}
