//! Progress tracking for downloads

use crate::queue::task::{DownloadTask, TaskId, TaskStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::trace;

/// Progress of one task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskProgress {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub bytes_downloaded: u64,
    pub bytes_total: Option<u64>,
    pub units_completed: usize,
    pub units_total: usize,
    pub speed: f64, // bytes per second
    pub eta: Option<Duration>,
}

impl TaskProgress {
    pub fn from_task(task: &DownloadTask) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            bytes_downloaded: task.bytes_downloaded,
            bytes_total: task.bytes_total,
            units_completed: task.checkpoint.units_completed,
            units_total: task.units.len(),
            speed: 0.0,
            eta: None,
        }
    }

    /// Fraction done in `[0, 1]`, or `None` while the total is unknown
    pub fn fraction(&self) -> Option<f64> {
        match self.bytes_total {
            Some(0) if self.status == TaskStatus::Completed => Some(1.0),
            Some(0) | None => None,
            Some(total) => Some((self.bytes_downloaded as f64 / total as f64).clamp(0.0, 1.0)),
        }
    }

    pub fn is_indeterminate(&self) -> bool {
        self.fraction().is_none()
    }

    fn update_speed(&mut self, speed: f64) {
        self.speed = speed;
        self.eta = match self.bytes_total {
            Some(total) if speed > 0.0 && self.bytes_downloaded < total => Some(
                Duration::from_secs_f64((total - self.bytes_downloaded) as f64 / speed),
            ),
            Some(total) if self.bytes_downloaded >= total => Some(Duration::from_secs(0)),
            _ => None,
        };
    }
}

/// Size-weighted progress across QUEUED and IN_PROGRESS tasks
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OverallProgress {
    /// Downloaded bytes of active tasks with a known total
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
    pub active_tasks: usize,
    /// Active tasks left out of the byte sums because their size is unknown
    pub indeterminate_tasks: usize,
}

impl OverallProgress {
    pub fn fraction(&self) -> Option<f64> {
        if self.bytes_total == 0 {
            return None;
        }
        Some((self.bytes_downloaded as f64 / self.bytes_total as f64).clamp(0.0, 1.0))
    }
}

/// One entry of the throttled progress stream
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub task: TaskProgress,
    pub overall: OverallProgress,
}

#[derive(Debug)]
struct Tracked {
    progress: TaskProgress,
    last_emit: Option<Instant>,
    sample_at: Instant,
    sample_bytes: u64,
}

/// Turns task byte counters into UI-facing progress.
///
/// Workers report every chunk through [`observe`](Self::observe); at most one
/// update per task per `interval` reaches subscribers. Status changes always
/// go out immediately.
pub struct ProgressAggregator {
    interval: Duration,
    tasks: Mutex<HashMap<TaskId, Tracked>>,
    sender: broadcast::Sender<ProgressUpdate>,
}

impl ProgressAggregator {
    pub fn new(interval: Duration, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            interval,
            tasks: Mutex::new(HashMap::new()),
            sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.sender.subscribe()
    }

    /// Start tracking existing tasks without emitting anything
    pub async fn seed(&self, tasks: &[DownloadTask]) {
        let now = Instant::now();
        let mut tracked = self.tasks.lock().await;
        for task in tasks {
            tracked.insert(task.id.clone(), Tracked::new(task, now));
        }
    }

    /// Byte counters moved; emits only if the task's interval has elapsed
    pub async fn observe(&self, task: &DownloadTask) {
        self.record(task, false).await;
    }

    /// Status changed; always emits
    pub async fn status_changed(&self, task: &DownloadTask) {
        self.record(task, true).await;
    }

    /// Stop tracking a purged task
    pub async fn forget(&self, task_id: &str) {
        self.tasks.lock().await.remove(task_id);
    }

    pub async fn task_progress(&self, task_id: &str) -> Option<TaskProgress> {
        self.tasks
            .lock()
            .await
            .get(task_id)
            .map(|tracked| tracked.progress.clone())
    }

    pub async fn overall(&self) -> OverallProgress {
        let tasks = self.tasks.lock().await;
        overall_of(&tasks)
    }

    async fn record(&self, task: &DownloadTask, force: bool) {
        let now = Instant::now();
        let mut tasks = self.tasks.lock().await;
        let tracked = tasks
            .entry(task.id.clone())
            .or_insert_with(|| Tracked::new(task, now));

        let speed = tracked.progress.speed;
        tracked.progress = TaskProgress::from_task(task);
        tracked.progress.speed = speed;

        let elapsed = now.duration_since(tracked.sample_at);
        if elapsed >= Duration::from_secs(1) {
            let delta = task.bytes_downloaded.saturating_sub(tracked.sample_bytes);
            tracked
                .progress
                .update_speed(delta as f64 / elapsed.as_secs_f64());
            tracked.sample_at = now;
            tracked.sample_bytes = task.bytes_downloaded;
        }
        if task.status != TaskStatus::InProgress {
            tracked.progress.update_speed(0.0);
        }

        let due = match tracked.last_emit {
            None => true,
            Some(at) => now.duration_since(at) >= self.interval,
        };
        if !force && !due {
            return;
        }
        tracked.last_emit = Some(now);
        let snapshot = tracked.progress.clone();

        let update = ProgressUpdate {
            task: snapshot,
            overall: overall_of(&tasks),
        };
        if self.sender.send(update).is_err() {
            trace!("Progress update dropped, no subscribers");
        }
    }
}

impl Tracked {
    fn new(task: &DownloadTask, now: Instant) -> Self {
        Self {
            progress: TaskProgress::from_task(task),
            last_emit: None,
            sample_at: now,
            sample_bytes: task.bytes_downloaded,
        }
    }
}

fn overall_of(tasks: &HashMap<TaskId, Tracked>) -> OverallProgress {
    let mut overall = OverallProgress::default();
    for tracked in tasks.values() {
        let progress = &tracked.progress;
        if !matches!(progress.status, TaskStatus::Queued | TaskStatus::InProgress) {
            continue;
        }
        overall.active_tasks += 1;
        match progress.bytes_total {
            Some(total) if total > 0 => {
                overall.bytes_downloaded += progress.bytes_downloaded.min(total);
                overall.bytes_total += total;
            }
            _ => overall.indeterminate_tasks += 1,
        }
    }
    overall
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::task::{ContentKind, NewTask};

    fn task(downloaded: u64, total: Option<u64>, status: TaskStatus) -> DownloadTask {
        let mut task = DownloadTask::new(NewTask::new(
            "frieren",
            ContentKind::Anime,
            vec!["e1".into(), "e2".into()],
        ));
        task.bytes_downloaded = downloaded;
        task.bytes_total = total;
        task.status = status;
        task
    }

    // ============================================================
    // TASK PROGRESS
    // ============================================================

    #[test]
    fn test_fraction_is_clamped() {
        let progress = TaskProgress::from_task(&task(150, Some(100), TaskStatus::InProgress));
        assert_eq!(progress.fraction(), Some(1.0));

        let progress = TaskProgress::from_task(&task(25, Some(100), TaskStatus::InProgress));
        assert_eq!(progress.fraction(), Some(0.25));
    }

    #[test]
    fn test_unknown_total_is_indeterminate() {
        let progress = TaskProgress::from_task(&task(500, None, TaskStatus::InProgress));
        assert!(progress.is_indeterminate());
        assert_eq!(progress.fraction(), None);
    }

    #[test]
    fn test_eta_from_speed() {
        let mut progress = TaskProgress::from_task(&task(500, Some(1_500), TaskStatus::InProgress));
        progress.update_speed(100.0);
        assert_eq!(progress.eta, Some(Duration::from_secs(10)));

        progress.update_speed(0.0);
        assert_eq!(progress.eta, None);
    }

    // ============================================================
    // OVERALL PROGRESS
    // ============================================================

    #[tokio::test]
    async fn test_overall_counts_active_tasks_only() {
        let aggregator = ProgressAggregator::new(Duration::from_millis(0), 16);
        aggregator
            .seed(&[
                task(100, Some(400), TaskStatus::InProgress),
                task(0, Some(600), TaskStatus::Queued),
                task(900, Some(900), TaskStatus::Completed),
                task(10, Some(50), TaskStatus::Cancelled),
                task(70, None, TaskStatus::InProgress),
            ])
            .await;

        let overall = aggregator.overall().await;
        assert_eq!(overall.bytes_downloaded, 100);
        assert_eq!(overall.bytes_total, 1_000);
        assert_eq!(overall.active_tasks, 3);
        assert_eq!(overall.indeterminate_tasks, 1);
        assert_eq!(overall.fraction(), Some(0.1));
    }

    #[tokio::test]
    async fn test_overall_empty_queue() {
        let aggregator = ProgressAggregator::new(Duration::from_millis(0), 16);
        assert_eq!(aggregator.overall().await.fraction(), None);
    }

    // ============================================================
    // THROTTLING
    // ============================================================

    #[tokio::test]
    async fn test_observe_is_throttled() {
        let aggregator = ProgressAggregator::new(Duration::from_secs(3600), 64);
        let mut rx = aggregator.subscribe();
        let mut running = task(0, Some(1_000), TaskStatus::InProgress);

        for step in 1..=10 {
            running.bytes_downloaded = step * 100;
            aggregator.observe(&running).await;
        }

        let first = rx.try_recv().unwrap();
        assert_eq!(first.task.bytes_downloaded, 100);
        assert!(rx.try_recv().is_err());

        // Latest counters are still visible to queries
        let progress = aggregator.task_progress(&running.id).await.unwrap();
        assert_eq!(progress.bytes_downloaded, 1_000);
    }

    #[tokio::test]
    async fn test_status_change_bypasses_throttle() {
        let aggregator = ProgressAggregator::new(Duration::from_secs(3600), 64);
        let mut rx = aggregator.subscribe();
        let mut running = task(0, Some(1_000), TaskStatus::InProgress);

        aggregator.observe(&running).await;
        running.status = TaskStatus::Paused;
        aggregator.status_changed(&running).await;

        assert_eq!(rx.try_recv().unwrap().task.status, TaskStatus::InProgress);
        let paused = rx.try_recv().unwrap();
        assert_eq!(paused.task.status, TaskStatus::Paused);
        assert_eq!(paused.overall.active_tasks, 0);
    }

    #[tokio::test]
    async fn test_forget_drops_task() {
        let aggregator = ProgressAggregator::new(Duration::from_millis(0), 4);
        let queued = task(0, Some(10), TaskStatus::Queued);
        aggregator.status_changed(&queued).await;
        aggregator.forget(&queued.id).await;
        assert!(aggregator.task_progress(&queued.id).await.is_none());
        assert_eq!(aggregator.overall().await.active_tasks, 0);
    }
}
