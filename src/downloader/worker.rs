//! Executes one task end to end.
//!
//! Units are fetched strictly in order. Each unit is streamed through the
//! shared bandwidth limiter into its storage file, and `bytes_downloaded`
//! grows as chunks are confirmed written. A durable checkpoint is taken after
//! every unit (and every N bytes with byte granularity), so a pause, crash or
//! retry resumes where the last checkpoint left off.
//!
//! The worker never changes the task's status; it reports a
//! [`WorkerOutcome`] and the queue manager applies it.

use crate::downloader::limiter::BandwidthLimiter;
use crate::downloader::progress::ProgressAggregator;
use crate::downloader::storage::{unit_path, Storage, UnitSink};
use crate::queue::scheduler::WorkerSignals;
use crate::queue::store::TaskStore;
use crate::queue::task::{Checkpoint, DownloadTask, TaskId};
use crate::source::traits::{ContentFetcher, UnitRef};
use crate::utils::config::{CheckpointGranularity, QueueSettings};
use crate::utils::error::{QueueError, Result};
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// How a worker run ended
#[derive(Debug)]
pub enum WorkerOutcome {
    /// Every unit is written
    Completed,
    /// Unit attempts exhausted or a non-retryable error
    Failed(QueueError),
    /// Stopped at a safe point on a pause or shutdown signal
    Interrupted,
    /// Aborted on a cancel signal; the in-flight unit was discarded
    Cancelled,
}

/// Worker tuning
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub unit_attempts: u32,
    pub unit_retry_delay: Duration,
    pub fetch_timeout: Duration,
    pub chunk_size: usize,
    pub checkpoint: CheckpointGranularity,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_settings(&QueueSettings::default())
    }
}

impl WorkerConfig {
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            unit_attempts: settings.unit_attempts.max(1),
            unit_retry_delay: settings.unit_retry_delay(),
            fetch_timeout: settings.fetch_timeout(),
            chunk_size: settings.chunk_size.max(1),
            checkpoint: settings.checkpoint,
        }
    }
}

/// Collaborators shared by every worker
pub struct WorkerContext {
    pub store: Arc<TaskStore>,
    pub fetcher: Arc<dyn ContentFetcher>,
    pub storage: Arc<dyn Storage>,
    pub limiter: Arc<BandwidthLimiter>,
    pub progress: Arc<ProgressAggregator>,
    pub config: WorkerConfig,
}

/// What happened to one unit
#[derive(Debug, PartialEq, Eq)]
enum UnitStep {
    Finished(u64),
    Stopped,
    Cancelled,
}

/// Position within the unit being downloaded
#[derive(Debug, Default)]
struct UnitState {
    offset: u64,
    /// Full size of the unit, once known
    size: Option<u64>,
    received: bool,
    since_checkpoint: u64,
    sink_failed: bool,
}

pub struct Worker {
    ctx: Arc<WorkerContext>,
    task_id: TaskId,
    signals: WorkerSignals,
}

impl Worker {
    pub fn new(ctx: Arc<WorkerContext>, task_id: TaskId, signals: WorkerSignals) -> Self {
        Self {
            ctx,
            task_id,
            signals,
        }
    }

    pub async fn run(self) -> WorkerOutcome {
        match self.execute().await {
            Ok(outcome) => outcome,
            // Removed after a cancel
            Err(QueueError::Cancelled) | Err(QueueError::TaskNotFound(_)) => WorkerOutcome::Cancelled,
            Err(e) => WorkerOutcome::Failed(e),
        }
    }

    async fn execute(&self) -> Result<WorkerOutcome> {
        let task = self
            .ctx
            .store
            .record_progress(&self.task_id, |task| task.restore_checkpoint())
            .await?;
        info!(
            "Worker started for task {} at unit {}/{} ({} bytes)",
            task.id,
            task.checkpoint.units_completed,
            task.units.len(),
            task.bytes_downloaded
        );

        if task.bytes_total.is_none() {
            self.probe_sizes(&task).await?;
        }

        let mut offset = task.checkpoint.unit_offset;
        for index in task.checkpoint.units_completed..task.units.len() {
            if self.signals.cancel.is_cancelled() {
                return Ok(WorkerOutcome::Cancelled);
            }
            if self.signals.stop.is_cancelled() {
                debug!("Task {} stopping before unit {}", task.id, index);
                return Ok(WorkerOutcome::Interrupted);
            }

            match self.download_unit(&task, index, offset).await? {
                UnitStep::Finished(size) => self.checkpoint_unit(index, size).await?,
                UnitStep::Stopped => return Ok(WorkerOutcome::Interrupted),
                UnitStep::Cancelled => return Ok(WorkerOutcome::Cancelled),
            }
            offset = 0;
        }

        info!("Task {} downloaded all {} units", task.id, task.units.len());
        Ok(WorkerOutcome::Completed)
    }

    /// Ask the source for unit sizes up front so progress is determinate early
    async fn probe_sizes(&self, task: &DownloadTask) -> Result<()> {
        let mut resolved = Vec::new();
        for index in 0..task.units.len() {
            if task.unit_sizes.get(index).copied().flatten().is_some() {
                continue;
            }
            if self.signals.cancel.is_cancelled() || self.signals.stop.is_cancelled() {
                return Ok(());
            }

            let unit = unit_ref(task, index);
            match timeout(self.ctx.config.fetch_timeout, self.ctx.fetcher.probe_size(&unit)).await {
                Ok(Ok(Some(size))) => resolved.push((index, size)),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => debug!("Size probe failed for {} of task {}: {}", unit.unit_id, task.id, e),
                Err(_) => debug!("Size probe timed out for {} of task {}", unit.unit_id, task.id),
            }
        }

        if resolved.is_empty() {
            return Ok(());
        }
        let ((), task) = self
            .ctx
            .store
            .update(&self.task_id, |task| {
                for (index, size) in &resolved {
                    task.resolve_unit_size(*index, *size);
                }
                Ok(())
            })
            .await?;
        debug!(
            "Resolved {} unit sizes for task {} (total {:?})",
            resolved.len(),
            task.id,
            task.bytes_total
        );
        self.ctx.progress.observe(&task).await;
        Ok(())
    }

    /// Download one unit, retrying transient failures in place
    async fn download_unit(&self, task: &DownloadTask, index: usize, offset: u64) -> Result<UnitStep> {
        let config = &self.ctx.config;
        let unit = unit_ref(task, index);
        let path = unit_path(task, index);
        let mut state = UnitState {
            offset,
            size: self.known_unit_size(index).await,
            ..UnitState::default()
        };
        let mut sink: Option<Box<dyn UnitSink>> = None;
        let mut attempt = 1;

        loop {
            let result = self
                .unit_attempt(&unit, &path, &mut sink, &mut state)
                .await;

            let error = match result {
                Ok(UnitStep::Cancelled) => {
                    drop(sink.take());
                    if let Err(e) = self.ctx.storage.discard(&path).await {
                        warn!("Failed to discard partial unit {}: {}", path.display(), e);
                    }
                    return Ok(UnitStep::Cancelled);
                }
                Ok(step) => return Ok(step),
                Err(e) => e,
            };

            if state.sink_failed {
                sink = None;
                state.sink_failed = false;
            }
            if !error.is_retryable() || attempt >= config.unit_attempts {
                if let Some(mut open) = sink.take() {
                    if let Err(e) = open.flush().await {
                        debug!("Flush after failure failed for {}: {}", path.display(), e);
                    }
                }
                warn!(
                    "Unit {} of task {} failed after {} attempt(s): {}",
                    unit.unit_id, self.task_id, attempt, error
                );
                return Err(error);
            }

            warn!(
                "Unit {} of task {} failed (attempt {}/{}), resuming at byte {}: {}",
                unit.unit_id, self.task_id, attempt, config.unit_attempts, state.offset, error
            );
            tokio::select! {
                biased;
                _ = self.signals.cancel.cancelled() => {
                    drop(sink.take());
                    if let Err(e) = self.ctx.storage.discard(&path).await {
                        warn!("Failed to discard partial unit {}: {}", path.display(), e);
                    }
                    return Ok(UnitStep::Cancelled);
                }
                _ = self.signals.stop.cancelled(), if self.stop_allowed(&state) => {
                    return self.stop_in_unit(index, sink.as_mut(), &state).await;
                }
                _ = sleep(config.unit_retry_delay) => {}
            }
            attempt += 1;
        }
    }

    /// One fetch of the rest of a unit, starting at `state.offset`
    async fn unit_attempt(
        &self,
        unit: &UnitRef,
        path: &Path,
        sink: &mut Option<Box<dyn UnitSink>>,
        state: &mut UnitState,
    ) -> Result<UnitStep> {
        let config = &self.ctx.config;
        let index = unit.index;

        // Every byte is already written; a ranged fetch past the end would
        // be refused by the source
        if state.offset > 0 && state.size.is_some_and(|size| state.offset >= size) {
            debug!(
                "Unit {} of task {} already has all {} bytes",
                unit.unit_id, self.task_id, state.offset
            );
            let writer = open_sink(self.ctx.storage.as_ref(), path, sink, state).await?;
            return finish_unit(writer, state).await;
        }

        let fetch = timeout(config.fetch_timeout, self.ctx.fetcher.fetch(unit, state.offset));
        let mut stream = tokio::select! {
            biased;
            _ = self.signals.cancel.cancelled() => return Ok(UnitStep::Cancelled),
            _ = self.signals.stop.cancelled(), if self.stop_allowed(state) => {
                return self.stop_in_unit(index, sink.as_mut(), state).await;
            }
            result = fetch => result.map_err(|_| timed_out(unit))??,
        };

        let expected = stream.content_length.map(|length| state.offset + length);
        if let Some(size) = expected {
            state.size = Some(size);
            self.ctx
                .store
                .record_progress(&self.task_id, |task| {
                    if task.unit_sizes.get(index).copied().flatten() != Some(size) {
                        task.resolve_unit_size(index, size);
                    }
                })
                .await?;
        }

        let writer = open_sink(self.ctx.storage.as_ref(), path, sink, state).await?;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.signals.cancel.cancelled() => return Ok(UnitStep::Cancelled),
                _ = self.signals.stop.cancelled(), if self.stop_allowed(state) => {
                    return self.stop_in_unit(index, Some(&mut *writer), state).await;
                }
                next = timeout(config.fetch_timeout, stream.body.next()) => next,
            };
            let bytes = match next {
                Err(_) => return Err(timed_out(unit)),
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };

            for piece in bytes.chunks(config.chunk_size) {
                tokio::select! {
                    biased;
                    _ = self.signals.cancel.cancelled() => return Ok(UnitStep::Cancelled),
                    _ = self.ctx.limiter.acquire(piece.len()) => {}
                }
                if let Err(e) = writer.write(piece).await {
                    state.sink_failed = true;
                    return Err(e);
                }

                let written = piece.len() as u64;
                state.offset += written;
                state.received = true;
                state.since_checkpoint += written;

                let snapshot = self
                    .ctx
                    .store
                    .record_progress(&self.task_id, |task| task.bytes_downloaded += written)
                    .await?;
                self.ctx.progress.observe(&snapshot).await;

                if let Some(every) = config.checkpoint.byte_interval() {
                    if state.since_checkpoint >= every {
                        if let Err(e) = writer.flush().await {
                            state.sink_failed = true;
                            return Err(e);
                        }
                        self.checkpoint_partial(index, state.offset).await?;
                        state.since_checkpoint = 0;
                    }
                }
            }
        }

        if let Some(expected) = expected {
            if state.offset < expected {
                return Err(QueueError::Network(format!(
                    "connection closed after {} of {} bytes of {}",
                    state.offset, expected, unit.unit_id
                )));
            }
        }

        finish_unit(writer, state).await
    }

    /// Size of a unit as currently recorded for the task
    async fn known_unit_size(&self, index: usize) -> Option<u64> {
        let task = self.ctx.store.get(&self.task_id).await?;
        task.unit_sizes.get(index).copied().flatten()
    }

    /// Unit granularity only stops before the unit's first byte arrives;
    /// byte granularity stops at any chunk.
    fn stop_allowed(&self, state: &UnitState) -> bool {
        match self.ctx.config.checkpoint {
            CheckpointGranularity::Unit => !state.received,
            CheckpointGranularity::Bytes { .. } => true,
        }
    }

    async fn stop_in_unit(
        &self,
        index: usize,
        sink: Option<&mut Box<dyn UnitSink>>,
        state: &UnitState,
    ) -> Result<UnitStep> {
        if state.received {
            if let Some(sink) = sink {
                sink.flush().await?;
            }
            self.checkpoint_partial(index, state.offset).await?;
        }
        debug!(
            "Task {} stopped in unit {} at byte {}",
            self.task_id, index, state.offset
        );
        Ok(UnitStep::Stopped)
    }

    async fn checkpoint_unit(&self, index: usize, size: u64) -> Result<()> {
        let ((), task) = self
            .ctx
            .store
            .update(&self.task_id, |task| {
                task.resolve_unit_size(index, size);
                task.checkpoint = Checkpoint {
                    units_completed: index + 1,
                    unit_offset: 0,
                    bytes_downloaded: task.bytes_downloaded,
                };
                Ok(())
            })
            .await?;
        debug!(
            "Checkpoint for task {}: {}/{} units, {} bytes",
            task.id,
            task.checkpoint.units_completed,
            task.units.len(),
            task.checkpoint.bytes_downloaded
        );
        self.ctx.progress.observe(&task).await;
        Ok(())
    }

    async fn checkpoint_partial(&self, index: usize, offset: u64) -> Result<()> {
        let ((), task) = self
            .ctx
            .store
            .update(&self.task_id, |task| {
                task.checkpoint = Checkpoint {
                    units_completed: index,
                    unit_offset: offset,
                    bytes_downloaded: task.bytes_downloaded,
                };
                Ok(())
            })
            .await?;
        debug!(
            "Checkpoint for task {}: unit {} at byte {} ({} bytes total)",
            task.id, index, offset, task.checkpoint.bytes_downloaded
        );
        Ok(())
    }
}

fn unit_ref(task: &DownloadTask, index: usize) -> UnitRef {
    UnitRef {
        kind: task.kind,
        content_id: task.content_id.clone(),
        unit_id: task.units[index].clone(),
        index,
    }
}

async fn open_sink<'a>(
    storage: &dyn Storage,
    path: &Path,
    sink: &'a mut Option<Box<dyn UnitSink>>,
    state: &mut UnitState,
) -> Result<&'a mut Box<dyn UnitSink>> {
    if sink.is_none() {
        match storage.open(path, state.offset).await {
            Ok(opened) => *sink = Some(opened),
            Err(e) => {
                state.sink_failed = true;
                return Err(e);
            }
        }
    }
    sink.as_mut()
        .ok_or_else(|| QueueError::Io(format!("{} is not open", path.display())))
}

async fn finish_unit(writer: &mut Box<dyn UnitSink>, state: &mut UnitState) -> Result<UnitStep> {
    match writer.finish().await {
        Ok(size) => Ok(UnitStep::Finished(size)),
        Err(e) => {
            state.sink_failed = true;
            Err(e)
        }
    }
}

fn timed_out(unit: &UnitRef) -> QueueError {
    QueueError::Network(format!(
        "timed out fetching {} of {}",
        unit.unit_id, unit.content_id
    ))
}
