//! Utility modules for error handling, configuration and paths

pub mod config;
pub mod error;
pub mod paths;

// Re-export for convenience
pub use config::{CheckpointGranularity, QueueSettings};
pub use error::{QueueError, Result};
pub use paths::{get_app_support_dir, get_config_path, get_database_path, get_downloads_dir};
