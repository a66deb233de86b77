//! Queue configuration

use crate::utils::error::{QueueError, Result};
use crate::utils::paths::{get_database_path, get_downloads_dir};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Queue settings
///
/// Every field falls back to its default when absent, so config files written by
/// older or newer builds still load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Root directory downloaded units are written under
    pub download_location: PathBuf,

    /// SQLite file holding the task records
    pub database_path: PathBuf,

    /// Maximum tasks IN_PROGRESS at once
    pub max_concurrent: usize,

    /// Automatic task-level retries before a task stays FAILED
    pub max_retries: u32,

    /// In-place attempts per unit before the failure escalates to the task
    pub unit_attempts: u32,

    /// Backoff base for automatic task retries (milliseconds)
    pub retry_base_delay_ms: u64,

    /// Backoff cap for automatic task retries (milliseconds)
    pub retry_max_delay_ms: u64,

    /// Pause between in-place unit attempts (milliseconds)
    pub unit_retry_delay_ms: u64,

    /// A fetch or chunk read that takes longer than this becomes a network error
    pub fetch_timeout_secs: u64,

    /// Largest slice written between pause/cancel checks (bytes)
    pub chunk_size: usize,

    /// Shared bandwidth cap across all workers (bytes/sec), `None` for unlimited
    pub bandwidth_limit: Option<u64>,

    /// How often progress is made durable
    pub checkpoint: CheckpointGranularity,

    /// Minimum spacing between progress broadcasts (milliseconds)
    pub progress_interval_ms: u64,

    /// Capacity of the event and progress broadcast buffers
    pub event_buffer: usize,

    /// Base URL of the manga chapter source
    pub manga_source_url: String,

    /// Base URL of the anime episode source
    pub anime_source_url: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            download_location: get_downloads_dir().join("mangaqueue"),
            database_path: get_database_path(),
            max_concurrent: 3,
            max_retries: 3,
            unit_attempts: 3,
            retry_base_delay_ms: 2_000,
            retry_max_delay_ms: 60_000,
            unit_retry_delay_ms: 500,
            fetch_timeout_secs: 30,
            chunk_size: 64 * 1024, // 64KB
            bandwidth_limit: None,
            checkpoint: CheckpointGranularity::Unit,
            progress_interval_ms: 250,
            event_buffer: 256,
            manga_source_url: "http://127.0.0.1:8080".to_string(),
            anime_source_url: "http://127.0.0.1:8080".to_string(),
        }
    }
}

impl QueueSettings {
    /// Load settings from a JSON file, using defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default().normalized());
        }
        let content = std::fs::read_to_string(path).map_err(QueueError::from_io)?;
        let settings: QueueSettings = serde_json::from_str(&content)?;
        info!("Loaded settings from {:?}", path);
        Ok(settings.normalized())
    }

    /// Write settings as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(QueueError::from_io)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(QueueError::from_io)?;
        Ok(())
    }

    /// Enforce sane minimums
    pub fn normalized(mut self) -> Self {
        self.max_concurrent = self.max_concurrent.max(1);
        self.unit_attempts = self.unit_attempts.max(1);
        self.chunk_size = self.chunk_size.max(1024);
        self.event_buffer = self.event_buffer.max(16);
        self.fetch_timeout_secs = self.fetch_timeout_secs.max(1);
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            self.retry_max_delay_ms = self.retry_base_delay_ms;
        }
        if let CheckpointGranularity::Bytes { every } = &mut self.checkpoint {
            *every = (*every).max(1);
        }
        if self.bandwidth_limit == Some(0) {
            self.bandwidth_limit = None;
        }
        self
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn unit_retry_delay(&self) -> Duration {
        Duration::from_millis(self.unit_retry_delay_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// Checkpoint granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointGranularity {
    /// Persist after every completed unit; pause waits for the unit to finish
    Unit,
    /// Also persist every `every` bytes inside a unit; pause stops at the next chunk
    Bytes { every: u64 },
}

impl CheckpointGranularity {
    /// Byte interval for mid-unit checkpoints, if any
    pub fn byte_interval(&self) -> Option<u64> {
        match self {
            CheckpointGranularity::Unit => None,
            CheckpointGranularity::Bytes { every } => Some(*every),
        }
    }
}
