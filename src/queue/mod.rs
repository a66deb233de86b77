//! Download queue: task model, persistence, admission and the facade

pub mod events;
pub mod manager;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod task;

pub use events::{BroadcastSink, FanoutSink, NotificationSink, QueueEvent, TracingSink};
pub use manager::QueueManager;
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{ReadyQueue, Scheduler, WorkerSignals};
pub use store::TaskStore;
pub use task::{Checkpoint, ContentKind, DownloadTask, NewTask, StatusSet, TaskId, TaskStatus};
