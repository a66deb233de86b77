//! mangaqueue library
//!
//! Offline download queue for manga chapters and anime episodes: persistent
//! tasks, priority admission under a concurrency cap, resumable workers and
//! throttled progress.

pub mod database;
pub mod downloader;
pub mod queue;
pub mod source;
pub mod utils;

// Re-export main types for easier use
pub use downloader::{FsStorage, OverallProgress, ProgressUpdate, Storage, TaskProgress};
pub use queue::{
    ContentKind, DownloadTask, NewTask, NotificationSink, QueueEvent, QueueManager, StatusSet,
    TaskId, TaskStatus, TaskStore,
};
pub use source::{ByteStream, ContentFetcher, UnitRef};
pub use utils::{CheckpointGranularity, QueueError, QueueSettings, Result};
