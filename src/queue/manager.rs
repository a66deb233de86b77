//! Download queue manager
//!
//! The facade the UI and CLI talk to. It owns the scheduler and the worker
//! context, and runs a single dispatcher task that applies worker outcomes
//! and automatic retries, then refills free slots.

use crate::database::{initialize_database, DatabaseManager};
use crate::downloader::limiter::BandwidthLimiter;
use crate::downloader::progress::{OverallProgress, ProgressAggregator, ProgressUpdate, TaskProgress};
use crate::downloader::storage::{FsStorage, Storage};
use crate::downloader::worker::{Worker, WorkerConfig, WorkerContext, WorkerOutcome};
use crate::queue::events::{BroadcastSink, NotificationSink, QueueEvent, TracingSink};
use crate::queue::retry::{RetryDecision, RetryPolicy};
use crate::queue::scheduler::{Scheduler, WorkerSignals};
use crate::queue::store::TaskStore;
use crate::queue::task::{DownloadTask, NewTask, StatusSet, TaskId, TaskStatus};
use crate::source::{AnimeEpisodeFetcher, ContentFetcher, MangaChapterFetcher, SourceRouter};
use crate::utils::config::QueueSettings;
use crate::utils::error::{QueueError, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A run lease whose heartbeat is older than this belongs to a dead process
const LEASE_TTL_MS: i64 = 15_000;

/// Messages handled by the dispatcher
#[derive(Debug)]
enum Dispatch {
    WorkerExited { task_id: TaskId, outcome: WorkerOutcome },
    RetryDue { task_id: TaskId, retry_count: u32 },
    Wake,
}

/// Download queue manager with concurrent download support
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<TaskStore>,
    scheduler: Scheduler,
    retry_policy: RetryPolicy,
    workers: Arc<WorkerContext>,
    sink: Arc<dyn NotificationSink>,
    events: BroadcastSink,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
    dispatch_rx: Mutex<Option<mpsc::UnboundedReceiver<Dispatch>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    pending_retries: AtomicUsize,
    shutdown: CancellationToken,
}

impl QueueManager {
    /// Create a queue manager over injected collaborators. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(
        settings: QueueSettings,
        store: Arc<TaskStore>,
        fetcher: Arc<dyn ContentFetcher>,
        storage: Arc<dyn Storage>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let settings = settings.normalized();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        let workers = Arc::new(WorkerContext {
            store: store.clone(),
            fetcher,
            storage,
            limiter: Arc::new(BandwidthLimiter::new(settings.bandwidth_limit)),
            progress: Arc::new(ProgressAggregator::new(
                settings.progress_interval(),
                settings.event_buffer,
            )),
            config: WorkerConfig::from_settings(&settings),
        });

        Self {
            inner: Arc::new(Inner {
                scheduler: Scheduler::new(store.clone(), settings.max_concurrent),
                retry_policy: RetryPolicy::from_settings(&settings),
                store,
                workers,
                sink,
                events: BroadcastSink::new(settings.event_buffer),
                dispatch_tx,
                dispatch_rx: Mutex::new(Some(dispatch_rx)),
                dispatcher: Mutex::new(None),
                started: AtomicBool::new(false),
                pending_retries: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Open the persistent store and wire up the HTTP sources and filesystem
    /// storage described by `settings`
    pub async fn open(settings: QueueSettings) -> Result<Self> {
        let settings = settings.normalized();
        let pool = initialize_database(&settings.database_path).await?;
        let store = Arc::new(TaskStore::open(DatabaseManager::new(pool)).await?);

        let connect_timeout = settings.fetch_timeout();
        let fetcher = Arc::new(SourceRouter::new(vec![
            Arc::new(MangaChapterFetcher::new(&settings.manga_source_url, connect_timeout)?),
            Arc::new(AnimeEpisodeFetcher::new(&settings.anime_source_url, connect_timeout)?),
        ]));
        let storage = Arc::new(FsStorage::new(&settings.download_location));

        Ok(Self::new(settings, store, fetcher, storage, Arc::new(TracingSink)))
    }

    /// Recover interrupted tasks and start admitting work
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Starting queue processing");

        let recovered = inner.store.recover_interrupted().await?;
        inner
            .workers
            .progress
            .seed(&inner.store.list(StatusSet::ALL).await)
            .await;
        for task_id in &recovered {
            if let Some(task) = inner.store.get(task_id).await {
                inner.notify(&task).await;
            }
        }
        inner.scheduler.restore().await;

        if let Some(rx) = inner.dispatch_rx.lock().await.take() {
            let handle = tokio::spawn(dispatch_loop(inner.clone(), rx));
            *inner.dispatcher.lock().await = Some(handle);
        }

        inner.process_queue().await;
        Ok(())
    }

    /// Pick up tasks another process added to the database, such as
    /// `mangaqueue add` while `mangaqueue run` is downloading
    pub async fn adopt_new_tasks(&self) -> Result<Vec<TaskId>> {
        let inner = &self.inner;
        let added = inner.store.load_new().await?;
        if added.is_empty() {
            return Ok(Vec::new());
        }

        let mut adopted = Vec::with_capacity(added.len());
        for task in added {
            if task.status == TaskStatus::Queued {
                inner.scheduler.enqueue(&task).await;
            }
            info!("Adopted task {} ({})", task.id, task.status);
            inner.notify(&task).await;
            adopted.push(task.id);
        }
        inner.process_queue().await;
        Ok(adopted)
    }

    /// Claim the database for this process. Fails with `Busy` while another
    /// live process runs the queue.
    pub async fn acquire_lease(&self) -> Result<()> {
        let db = self.inner.store.database();
        let pid = std::process::id();
        let now = Utc::now().timestamp_millis();
        if db.claim_lease(pid, now, now - LEASE_TTL_MS).await? {
            debug!("Run lease taken by process {}", pid);
            return Ok(());
        }
        let holder = db.lease_holder(now - LEASE_TTL_MS).await?;
        Err(QueueError::Busy(holder.unwrap_or_default()))
    }

    /// Keep the lease alive; call well within the lease TTL
    pub async fn renew_lease(&self) -> Result<()> {
        let pid = std::process::id();
        let now = Utc::now().timestamp_millis();
        if !self.inner.store.database().renew_lease(pid, now).await? {
            warn!("Run lease was lost, claiming it again");
            self.acquire_lease().await?;
        }
        Ok(())
    }

    pub async fn release_lease(&self) -> Result<()> {
        self.inner
            .store
            .database()
            .release_lease(std::process::id())
            .await
    }

    /// Fails with `Busy` when another live process runs the queue. Its
    /// in-memory state would overwrite changes made here.
    pub async fn ensure_not_running_elsewhere(&self) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        match self
            .inner
            .store
            .database()
            .lease_holder(now - LEASE_TTL_MS)
            .await?
        {
            Some(pid) if pid != std::process::id() => Err(QueueError::Busy(pid)),
            _ => Ok(()),
        }
    }

    /// Add a task; it is admitted right away when a slot is free
    pub async fn enqueue(&self, request: NewTask) -> Result<TaskId> {
        let inner = &self.inner;
        let task_id = inner.store.create(request).await?;
        let task = inner
            .store
            .get(&task_id)
            .await
            .ok_or_else(|| QueueError::TaskNotFound(task_id.clone()))?;

        info!(
            "Added task {} to queue ({} units, priority {})",
            task_id,
            task.units.len(),
            task.priority
        );
        inner.scheduler.enqueue(&task).await;
        inner.notify(&task).await;
        inner.process_queue().await;
        Ok(task_id)
    }

    pub async fn pause(&self, task_id: &str) -> Result<DownloadTask> {
        let task = self.inner.scheduler.pause(task_id).await?;
        self.inner.notify(&task).await;
        self.inner.process_queue().await;
        Ok(task)
    }

    pub async fn resume(&self, task_id: &str) -> Result<DownloadTask> {
        let task = self.inner.scheduler.resume(task_id).await?;
        self.inner.notify(&task).await;
        self.inner.process_queue().await;
        Ok(task)
    }

    /// Resume every PAUSED task, e.g. after freeing disk space
    pub async fn resume_all(&self) -> Result<Vec<DownloadTask>> {
        let paused = self.inner.store.list(TaskStatus::Paused.into()).await;
        let mut resumed = Vec::with_capacity(paused.len());
        for task in paused {
            match self.inner.scheduler.resume(&task.id).await {
                Ok(task) => {
                    self.inner.notify(&task).await;
                    resumed.push(task);
                }
                Err(QueueError::InvalidState { .. }) | Err(QueueError::TaskNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!("Resumed {} paused tasks", resumed.len());
        self.inner.process_queue().await;
        Ok(resumed)
    }

    pub async fn cancel(&self, task_id: &str) -> Result<DownloadTask> {
        let task = self.inner.scheduler.cancel(task_id).await?;
        self.inner.notify(&task).await;
        self.inner.process_queue().await;
        Ok(task)
    }

    pub async fn retry(&self, task_id: &str) -> Result<DownloadTask> {
        let task = self.inner.scheduler.retry(task_id).await?;
        self.inner.notify(&task).await;
        self.inner.process_queue().await;
        Ok(task)
    }

    /// Purge one terminal task
    pub async fn remove(&self, task_id: &str) -> Result<DownloadTask> {
        let task = self.inner.store.delete(task_id).await?;
        self.inner.workers.progress.forget(task_id).await;
        let removed = [task.id.clone()];
        self.inner.sink.on_cleared(&removed);
        self.inner.events.on_cleared(&removed);
        info!("Removed task {}", task_id);
        Ok(task)
    }

    /// Delete every COMPLETED task
    pub async fn clear_completed(&self) -> Result<Vec<TaskId>> {
        let removed = self.inner.scheduler.clear_completed().await?;
        for task_id in &removed {
            self.inner.workers.progress.forget(task_id).await;
        }
        if !removed.is_empty() {
            self.inner.sink.on_cleared(&removed);
            self.inner.events.on_cleared(&removed);
        }
        Ok(removed)
    }

    pub async fn get(&self, task_id: &str) -> Option<DownloadTask> {
        self.inner.store.get(task_id).await
    }

    pub async fn list(&self, filter: StatusSet) -> Vec<DownloadTask> {
        self.inner.store.list(filter).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.inner.workers.progress.subscribe()
    }

    pub async fn task_progress(&self, task_id: &str) -> Option<TaskProgress> {
        self.inner.workers.progress.task_progress(task_id).await
    }

    pub async fn overall_progress(&self) -> OverallProgress {
        self.inner.workers.progress.overall().await
    }

    /// Change the shared bandwidth cap (bytes/sec, `None` = unlimited)
    pub async fn set_bandwidth_limit(&self, limit: Option<u64>) {
        self.inner.workers.limiter.set_rate(limit).await;
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.scheduler.max_concurrent()
    }

    /// True when nothing is queued, running or waiting for an automatic retry
    pub async fn is_drained(&self) -> bool {
        let inner = &self.inner;
        inner.pending_retries.load(Ordering::SeqCst) == 0
            && inner.scheduler.running_count().await == 0
            && inner.store.list(StatusSet::ACTIVE).await.is_empty()
    }

    /// Stop admitting, tell workers to stop at their next safe point and wait
    /// for them. Running tasks stay IN_PROGRESS and are recovered on the next
    /// start.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        info!("Shutting down download queue");
        inner.shutdown.cancel();
        inner.scheduler.shutdown();
        if inner.dispatch_tx.send(Dispatch::Wake).is_err() {
            debug!("Dispatcher already stopped");
        }

        let handle = inner.dispatcher.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Dispatcher task failed: {}", e);
            }
        }
    }
}

impl Inner {
    async fn notify(&self, task: &DownloadTask) {
        self.sink.on_task_changed(task);
        self.events.on_task_changed(task);
        self.workers.progress.status_changed(task).await;
    }

    /// Fill free slots with the best QUEUED tasks
    async fn process_queue(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }

        match self.scheduler.admit().await {
            Ok(admitted) => {
                for (task, signals) in admitted {
                    self.notify(&task).await;
                    self.start_download(task.id, signals);
                }
            }
            Err(e) => error!("Admission failed: {}", e),
        }
    }

    fn start_download(&self, task_id: TaskId, signals: WorkerSignals) {
        let worker = Worker::new(self.workers.clone(), task_id.clone(), signals);
        let dispatch_tx = self.dispatch_tx.clone();

        tokio::spawn(async move {
            let outcome = worker.run().await;
            debug!("Worker for task {} exited: {:?}", task_id, outcome);
            if dispatch_tx
                .send(Dispatch::WorkerExited { task_id, outcome })
                .is_err()
            {
                warn!("Dispatcher gone, worker outcome dropped");
            }
        });
    }

    /// Apply a worker's outcome. Outcomes for tasks that were paused or
    /// cancelled meanwhile are ignored.
    async fn handle_exit(&self, task_id: &str, outcome: WorkerOutcome) {
        let result = match outcome {
            WorkerOutcome::Completed => self.complete(task_id).await,
            WorkerOutcome::Failed(error) if error.is_queue_fatal() => {
                self.halt(task_id, error).await
            }
            WorkerOutcome::Failed(error) => self.fail(task_id, error).await,
            WorkerOutcome::Interrupted | WorkerOutcome::Cancelled => Ok(()),
        };
        if let Err(e) = result {
            error!("Failed to record outcome for task {}: {}", task_id, e);
        }
        self.scheduler.release(task_id).await;
    }

    async fn complete(&self, task_id: &str) -> Result<()> {
        let (changed, task) = self
            .store
            .update(task_id, |task| {
                if task.status != TaskStatus::InProgress {
                    return Ok(false);
                }
                task.transition(TaskStatus::Completed, "complete")?;
                task.last_error = None;
                Ok(true)
            })
            .await?;
        if changed {
            info!("Task {} completed successfully", task_id);
            self.notify(&task).await;
        }
        Ok(())
    }

    async fn fail(&self, task_id: &str, error: QueueError) -> Result<()> {
        let (decision, task) = self
            .store
            .update(task_id, |task| {
                if task.status != TaskStatus::InProgress {
                    return Ok(None);
                }
                let decision = self.retry_policy.decide(&error, task.retry_count);
                task.transition(TaskStatus::Failed, "fail")?;
                task.last_error = Some(error.to_string());
                task.retry_count = match decision {
                    RetryDecision::RetryAfter { retry_count, .. } => retry_count,
                    RetryDecision::GiveUp { retry_count } => retry_count,
                };
                Ok(Some(decision))
            })
            .await?;

        let Some(decision) = decision else {
            debug!("Ignoring failure of task {} ({}): {}", task_id, task.status, error);
            return Ok(());
        };
        self.notify(&task).await;

        match decision {
            RetryDecision::RetryAfter { delay, retry_count } => {
                warn!(
                    "Task {} failed, retry {}/{} in {:?}: {}",
                    task_id, retry_count, self.retry_policy.max_retries, delay, error
                );
                self.schedule_retry(task.id, retry_count, delay);
            }
            RetryDecision::GiveUp { retry_count } => {
                error!(
                    "Task {} failed after {} retries: {}",
                    task_id, retry_count, error
                );
            }
        }
        Ok(())
    }

    /// Out of disk space: pause everything instead of failing one task
    async fn halt(&self, task_id: &str, error: QueueError) -> Result<()> {
        let reason = error.to_string();
        let (changed, task) = self
            .store
            .update(task_id, |task| {
                if task.status != TaskStatus::InProgress {
                    return Ok(false);
                }
                task.transition(TaskStatus::Paused, "halt")?;
                task.last_error = Some(reason.clone());
                Ok(true)
            })
            .await?;
        if !changed {
            // Already paused by an earlier halt; its worker was only draining
            debug!("Task {} was not in progress, queue already halted", task_id);
            return Ok(());
        }
        error!("Task {} hit a queue-wide error, halting: {}", task_id, reason);
        self.notify(&task).await;

        for task in self.scheduler.pause_active().await {
            self.notify(&task).await;
        }
        self.sink.on_queue_halted(&reason);
        self.events.on_queue_halted(&reason);
        Ok(())
    }

    fn schedule_retry(&self, task_id: TaskId, retry_count: u32, delay: Duration) {
        let dispatch_tx = self.dispatch_tx.clone();
        let shutdown = self.shutdown.clone();
        self.pending_retries.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            // Always delivered so the pending count is settled
            let _ = dispatch_tx.send(Dispatch::RetryDue {
                task_id,
                retry_count,
            });
        });
    }

    async fn handle_retry_due(&self, task_id: &str, retry_count: u32) {
        self.pending_retries.fetch_sub(1, Ordering::SeqCst);
        if self.shutdown.is_cancelled() {
            return;
        }
        match self.scheduler.auto_retry(task_id, retry_count).await {
            Ok(Some(task)) => self.notify(&task).await,
            Ok(None) => {}
            Err(QueueError::TaskNotFound(_)) => debug!("Task {} removed before its retry", task_id),
            Err(e) => error!("Automatic retry of task {} failed: {}", task_id, e),
        }
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<Dispatch>) {
    loop {
        if inner.shutdown.is_cancelled() && inner.scheduler.running_count().await == 0 {
            break;
        }
        let Some(message) = rx.recv().await else {
            break;
        };

        match message {
            Dispatch::WorkerExited { task_id, outcome } => {
                inner.handle_exit(&task_id, outcome).await;
            }
            Dispatch::RetryDue {
                task_id,
                retry_count,
            } => inner.handle_retry_due(&task_id, retry_count).await,
            Dispatch::Wake => {}
        }
        inner.process_queue().await;
    }
    info!("Queue dispatcher stopped");
}
