use crate::queue::task::{DownloadTask, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, trace, warn};

/// Events that describe changes in the download queue state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueEvent {
    /// A task was created or changed status, counters or error
    TaskChanged {
        task: DownloadTask,
        timestamp: DateTime<Utc>,
    },
    /// A queue-wide condition paused every active task
    QueueHalted {
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// Terminal tasks were purged
    Cleared {
        task_ids: Vec<TaskId>,
        timestamp: DateTime<Utc>,
    },
}

/// Receives queue notifications. Implementations must not block: delivery is
/// best-effort and the queue never waits on a slow observer.
pub trait NotificationSink: Send + Sync {
    fn on_task_changed(&self, task: &DownloadTask);

    fn on_queue_halted(&self, _reason: &str) {}

    fn on_cleared(&self, _task_ids: &[TaskId]) {}
}

/// Fans notifications out over a bounded broadcast channel. Receivers that
/// fall behind lose the oldest events instead of stalling the queue.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<QueueEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, event: QueueEvent) {
        // No subscribers is fine
        if self.sender.send(event).is_err() {
            trace!("Queue event dropped, no subscribers");
        }
    }
}

impl NotificationSink for BroadcastSink {
    fn on_task_changed(&self, task: &DownloadTask) {
        self.publish(QueueEvent::TaskChanged {
            task: task.clone(),
            timestamp: Utc::now(),
        });
    }

    fn on_queue_halted(&self, reason: &str) {
        self.publish(QueueEvent::QueueHalted {
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn on_cleared(&self, task_ids: &[TaskId]) {
        self.publish(QueueEvent::Cleared {
            task_ids: task_ids.to_vec(),
            timestamp: Utc::now(),
        });
    }
}

/// Writes notifications to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn on_task_changed(&self, task: &DownloadTask) {
        info!(
            "Task {} ({}) is {} [{}/{:?} bytes]",
            task.id, task.title, task.status, task.bytes_downloaded, task.bytes_total
        );
    }

    fn on_queue_halted(&self, reason: &str) {
        warn!("Queue halted: {}", reason);
    }

    fn on_cleared(&self, task_ids: &[TaskId]) {
        info!("Cleared {} tasks", task_ids.len());
    }
}

/// Delivers to several sinks in order
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

impl NotificationSink for FanoutSink {
    fn on_task_changed(&self, task: &DownloadTask) {
        for sink in &self.sinks {
            sink.on_task_changed(task);
        }
    }

    fn on_queue_halted(&self, reason: &str) {
        for sink in &self.sinks {
            sink.on_queue_halted(reason);
        }
    }

    fn on_cleared(&self, task_ids: &[TaskId]) {
        for sink in &self.sinks {
            sink.on_cleared(task_ids);
        }
    }
}
