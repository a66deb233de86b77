//! Admission control and ordering.
//!
//! QUEUED tasks wait in a max-heap ordered by priority (higher first), then by
//! creation time (FIFO within a priority level). Whenever a slot frees up the
//! scheduler pops the best QUEUED task and promotes it to IN_PROGRESS, never
//! letting the IN_PROGRESS count exceed `max_concurrent`.
//!
//! Heap entries are not removed when a task is paused or cancelled while
//! waiting; stale entries are discarded when popped.
//!
//! Occupied slots are tracked here rather than counted from the store, so
//! admission never has to lock unrelated tasks.

use crate::queue::store::TaskStore;
use crate::queue::task::{DownloadTask, StatusSet, TaskId, TaskStatus};
use crate::utils::error::{QueueError, Result};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A QUEUED task waiting for a slot
#[derive(Debug, Clone)]
pub struct ReadyEntry {
    pub task_id: TaskId,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    sequence: u64,
}

impl ReadyEntry {
    pub fn new(task: &DownloadTask, sequence: u64) -> Self {
        Self {
            task_id: task.id.clone(),
            priority: task.priority,
            created_at: task.created_at,
            sequence,
        }
    }
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority first, then older first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Priority queue of QUEUED tasks
#[derive(Debug, Default)]
pub struct ReadyQueue {
    heap: BinaryHeap<ReadyEntry>,
    next_sequence: u64,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: &DownloadTask) {
        let entry = ReadyEntry::new(task, self.next_sequence);
        self.next_sequence += 1;
        self.heap.push(entry);
    }

    pub fn pop(&mut self) -> Option<ReadyEntry> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Signals the scheduler holds for one running worker
#[derive(Debug, Clone)]
pub struct WorkerSignals {
    /// Abort promptly; the task is already CANCELLED
    pub cancel: CancellationToken,
    /// Stop at the next safe point (pause, halt or shutdown)
    pub stop: CancellationToken,
}

pub struct Scheduler {
    store: Arc<TaskStore>,
    max_concurrent: usize,
    ready: Mutex<ReadyQueue>,
    /// Workers still alive, including ones draining after a pause
    running: Mutex<HashMap<TaskId, WorkerSignals>>,
    /// Tasks this scheduler moved to IN_PROGRESS that have not left it yet
    slots: Mutex<HashSet<TaskId>>,
    admission: Mutex<()>,
    shutdown: CancellationToken,
    admitted_total: AtomicU64,
}

impl Scheduler {
    pub fn new(store: Arc<TaskStore>, max_concurrent: usize) -> Self {
        Self {
            store,
            max_concurrent: max_concurrent.max(1),
            ready: Mutex::new(ReadyQueue::new()),
            running: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashSet::new()),
            admission: Mutex::new(()),
            shutdown: CancellationToken::new(),
            admitted_total: AtomicU64::new(0),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Rebuild the ready queue from the store (after recovery)
    pub async fn restore(&self) {
        let queued = self.store.list(TaskStatus::Queued.into()).await;
        let mut ready = self.ready.lock().await;
        *ready = ReadyQueue::new();
        for task in &queued {
            ready.push(task);
        }
        info!("Restored {} queued tasks", queued.len());
    }

    /// Register a freshly created QUEUED task for admission
    pub async fn enqueue(&self, task: &DownloadTask) {
        self.ready.lock().await.push(task);
        debug!("Task {} waiting for admission (priority {})", task.id, task.priority);
    }

    /// Promote as many QUEUED tasks as free slots allow.
    ///
    /// Returns each admitted task with the signals its worker must watch.
    /// Tasks whose previous worker is still draining are kept for a later pass.
    pub async fn admit(&self) -> Result<Vec<(DownloadTask, WorkerSignals)>> {
        let _admission = self.admission.lock().await;
        if self.shutdown.is_cancelled() {
            return Ok(Vec::new());
        }

        let in_progress = self.slots.lock().await.len();
        let mut free = self.max_concurrent.saturating_sub(in_progress);
        let mut admitted = Vec::new();
        let mut deferred = Vec::new();

        while free > 0 {
            let Some(entry) = self.ready.lock().await.pop() else {
                break;
            };

            if self.running.lock().await.contains_key(&entry.task_id) {
                deferred.push(entry);
                continue;
            }

            let update = self
                .store
                .update(&entry.task_id, |task| {
                    task.transition(TaskStatus::InProgress, "admit")
                })
                .await;

            let task = match update {
                Ok(((), task)) => task,
                Err(QueueError::InvalidState { .. }) | Err(QueueError::TaskNotFound(_)) => {
                    // Paused, cancelled or purged while waiting
                    continue;
                }
                Err(e) => {
                    self.ready.lock().await.heap.push(entry);
                    return Err(e);
                }
            };

            let signals = WorkerSignals {
                cancel: CancellationToken::new(),
                stop: self.shutdown.child_token(),
            };
            self.running
                .lock()
                .await
                .insert(task.id.clone(), signals.clone());
            self.slots.lock().await.insert(task.id.clone());
            self.admitted_total.fetch_add(1, AtomicOrdering::Relaxed);

            info!(
                "Admitted task {} ({} / {} slots)",
                task.id,
                in_progress + admitted.len() + 1,
                self.max_concurrent
            );
            admitted.push((task, signals));
            free -= 1;
        }

        if !deferred.is_empty() {
            let mut ready = self.ready.lock().await;
            for entry in deferred {
                ready.heap.push(entry);
            }
        }

        Ok(admitted)
    }

    /// Forget a worker that has exited. Its task has left IN_PROGRESS by
    /// now, or is left there for recovery after a shutdown.
    pub async fn release(&self, task_id: &str) {
        self.running.lock().await.remove(task_id);
        self.slots.lock().await.remove(task_id);
    }

    /// QUEUED or IN_PROGRESS -> PAUSED. A running worker is told to stop at
    /// its next safe point; progress is kept.
    pub async fn pause(&self, task_id: &str) -> Result<DownloadTask> {
        let ((), task) = self
            .store
            .update(task_id, |task| {
                if !matches!(task.status, TaskStatus::Queued | TaskStatus::InProgress) {
                    return Err(invalid(task, "pause"));
                }
                task.transition(TaskStatus::Paused, "pause")
            })
            .await?;

        self.slots.lock().await.remove(task_id);
        if let Some(signals) = self.running.lock().await.get(task_id) {
            signals.stop.cancel();
        }
        info!("Paused task {}", task_id);
        Ok(task)
    }

    /// PAUSED -> QUEUED
    pub async fn resume(&self, task_id: &str) -> Result<DownloadTask> {
        let ((), task) = self
            .store
            .update(task_id, |task| {
                if task.status != TaskStatus::Paused {
                    return Err(invalid(task, "resume"));
                }
                task.transition(TaskStatus::Queued, "resume")
            })
            .await?;

        self.enqueue(&task).await;
        info!("Resumed task {}", task_id);
        Ok(task)
    }

    /// Any non-terminal state -> CANCELLED. Frees the slot immediately; the
    /// worker is told to abort.
    pub async fn cancel(&self, task_id: &str) -> Result<DownloadTask> {
        let ((), task) = self
            .store
            .update(task_id, |task| task.transition(TaskStatus::Cancelled, "cancel"))
            .await?;

        self.slots.lock().await.remove(task_id);
        if let Some(signals) = self.running.lock().await.get(task_id) {
            signals.cancel.cancel();
        }
        info!("Cancelled task {}", task_id);
        Ok(task)
    }

    /// FAILED -> QUEUED on user request: the retry budget starts over
    pub async fn retry(&self, task_id: &str) -> Result<DownloadTask> {
        let ((), task) = self
            .store
            .update(task_id, |task| {
                if task.status != TaskStatus::Failed {
                    return Err(invalid(task, "retry"));
                }
                task.transition(TaskStatus::Queued, "retry")?;
                task.retry_count = 0;
                task.last_error = None;
                Ok(())
            })
            .await?;

        self.enqueue(&task).await;
        info!("Retrying task {}", task_id);
        Ok(task)
    }

    /// FAILED -> QUEUED after a backoff, unless the task moved on meanwhile
    pub async fn auto_retry(&self, task_id: &str, retry_count: u32) -> Result<Option<DownloadTask>> {
        let (requeued, task) = self
            .store
            .update(task_id, |task| {
                if task.status != TaskStatus::Failed || task.retry_count != retry_count {
                    return Ok(false);
                }
                task.transition(TaskStatus::Queued, "retry")?;
                Ok(true)
            })
            .await?;

        if !requeued {
            debug!("Skipping stale automatic retry for task {}", task_id);
            return Ok(None);
        }
        self.enqueue(&task).await;
        info!("Automatic retry {} for task {}", retry_count, task_id);
        Ok(Some(task))
    }

    /// Delete every COMPLETED task, leaving all others untouched
    pub async fn clear_completed(&self) -> Result<Vec<TaskId>> {
        let completed = self.store.list(TaskStatus::Completed.into()).await;
        let mut removed = Vec::with_capacity(completed.len());
        for task in completed {
            self.store.delete(&task.id).await?;
            removed.push(task.id);
        }
        info!("Cleared {} completed tasks", removed.len());
        Ok(removed)
    }

    /// Pause every QUEUED and IN_PROGRESS task (queue-wide halt)
    pub async fn pause_active(&self) -> Vec<DownloadTask> {
        let active = self.store.list(StatusSet::ACTIVE).await;
        let mut paused = Vec::new();
        for task in active {
            match self.pause(&task.id).await {
                Ok(task) => paused.push(task),
                Err(e) => debug!("Task {} not paused during halt: {}", task.id, e),
            }
        }
        paused
    }

    /// Stop admitting and tell every worker to stop at its next safe point.
    /// Task statuses are left as they are.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Slots taken by IN_PROGRESS tasks
    pub async fn occupied(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    pub async fn ready_len(&self) -> usize {
        self.ready.lock().await.len()
    }

    pub fn admitted_total(&self) -> u64 {
        self.admitted_total.load(AtomicOrdering::Relaxed)
    }
}

fn invalid(task: &DownloadTask, action: &'static str) -> QueueError {
    QueueError::InvalidState {
        id: task.id.clone(),
        status: task.status.to_string(),
        action,
    }
}
