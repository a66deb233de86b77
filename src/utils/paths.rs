//! Platform path resolution
//!
//! All paths resolve to absolute, platform-standard locations so the queue
//! behaves the same whatever the working directory of the process is:
//! - Data: `dirs::data_dir()/mangaqueue/`
//! - Downloads: `dirs::download_dir()` (never relative paths like ./downloads)

use std::path::PathBuf;
use tracing::{debug, warn};

const APP_DIR: &str = "mangaqueue";

/// Get the application data directory.
///
/// Creates the directory if it doesn't exist.
pub fn get_app_support_dir() -> PathBuf {
    let dir = dirs::data_dir()
        .map(|data| data.join(APP_DIR))
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share").join(APP_DIR)))
        .unwrap_or_else(|| std::env::temp_dir().join(APP_DIR));

    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!("Failed to create app data directory {:?}: {}", dir, e);
    }

    debug!("App data directory: {:?}", dir);
    dir
}

/// Get the task database path.
pub fn get_database_path() -> PathBuf {
    get_app_support_dir().join("mangaqueue.db")
}

/// Get the default settings file path.
pub fn get_config_path() -> PathBuf {
    get_app_support_dir().join("settings.json")
}

/// Get the downloads directory.
///
/// Falls back to ~/Downloads, then the temp dir, if the standard lookup fails.
pub fn get_downloads_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| {
            warn!("Could not determine Downloads directory, using temp dir");
            std::env::temp_dir()
        })
}
