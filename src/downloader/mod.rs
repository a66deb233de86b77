//! Download execution: workers, storage, bandwidth and progress

pub mod limiter;
pub mod progress;
pub mod storage;
pub mod worker;

// Re-export for convenience
pub use limiter::BandwidthLimiter;
pub use progress::{OverallProgress, ProgressAggregator, ProgressUpdate, TaskProgress};
pub use storage::{unit_path, FsStorage, Storage, UnitSink};
pub use worker::{Worker, WorkerConfig, WorkerContext, WorkerOutcome};
