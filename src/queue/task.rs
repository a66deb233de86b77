//! Download task model and status state machine

use crate::utils::error::{QueueError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque task identifier
pub type TaskId = String;

/// What a task downloads. Selects the content source and file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Manga,
    Anime,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Manga => "manga",
            ContentKind::Anime => "anime",
        }
    }

    /// Extension of one stored unit (chapter archive or episode video)
    pub fn file_extension(&self) -> &'static str {
        match self {
            ContentKind::Manga => "cbz",
            ContentKind::Anime => "mp4",
        }
    }
}

impl FromStr for ContentKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manga" => Ok(ContentKind::Manga),
            "anime" => Ok(ContentKind::Anime),
            other => Err(QueueError::Validation(format!("unknown content kind: {}", other))),
        }
    }
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TaskStatus {
    #[default]
    Queued = 0,
    InProgress = 1,
    Paused = 2,
    Completed = 3,
    Failed = 4,
    Cancelled = 5,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Queued,
        TaskStatus::InProgress,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// COMPLETED, FAILED and CANCELLED
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Edges of the task state machine:
    ///
    /// ```text
    /// QUEUED      --admit-->        IN_PROGRESS
    /// IN_PROGRESS --all units ok--> COMPLETED
    /// IN_PROGRESS --error-->        FAILED
    /// QUEUED|IN_PROGRESS --pause--> PAUSED
    /// PAUSED      --resume-->       QUEUED
    /// QUEUED|IN_PROGRESS|PAUSED --cancel--> CANCELLED
    /// FAILED      --retry-->        QUEUED
    /// ```
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Queued, Paused)
                | (InProgress, Paused)
                | (Paused, Queued)
                | (Queued, Cancelled)
                | (InProgress, Cancelled)
                | (Paused, Cancelled)
                | (Failed, Queued)
        )
    }

    fn bit(&self) -> u8 {
        1 << (*self as u8)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| QueueError::Validation(format!("unknown task status: {}", s)))
    }
}

/// A set of statuses used to filter task listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSet(u8);

impl StatusSet {
    pub const ALL: StatusSet = StatusSet(0b11_1111);
    pub const NONE: StatusSet = StatusSet(0);
    /// Tasks that still count towards overall progress
    pub const ACTIVE: StatusSet = StatusSet(0b00_0011);
    pub const TERMINAL: StatusSet = StatusSet(0b11_1000);

    pub fn of(statuses: &[TaskStatus]) -> Self {
        statuses
            .iter()
            .fold(StatusSet::NONE, |set, status| set.with(*status))
    }

    pub fn with(self, status: TaskStatus) -> Self {
        StatusSet(self.0 | status.bit())
    }

    pub fn contains(&self, status: TaskStatus) -> bool {
        self.0 & status.bit() != 0
    }
}

impl Default for StatusSet {
    fn default() -> Self {
        StatusSet::ALL
    }
}

impl From<TaskStatus> for StatusSet {
    fn from(status: TaskStatus) -> Self {
        StatusSet::NONE.with(status)
    }
}

/// Durable progress snapshot; enough to resume without refetching completed units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Units fully written, counted from the front of `units`
    pub units_completed: usize,
    /// Bytes of unit `units_completed` already written
    pub unit_offset: u64,
    /// `bytes_downloaded` at the time of the checkpoint
    pub bytes_downloaded: u64,
}

/// Request to create a task
#[derive(Debug, Clone)]
pub struct NewTask {
    pub content_id: String,
    pub kind: ContentKind,
    pub title: String,
    pub units: Vec<String>,
    pub priority: i32,
}

impl NewTask {
    pub fn new(content_id: impl Into<String>, kind: ContentKind, units: Vec<String>) -> Self {
        let content_id = content_id.into();
        Self {
            title: content_id.clone(),
            content_id,
            kind,
            units,
            priority: 0,
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.content_id.trim().is_empty() {
            return Err(QueueError::Validation("content id is required".to_string()));
        }
        if self.units.is_empty() {
            return Err(QueueError::Validation(format!(
                "task for {} has no units to download",
                self.content_id
            )));
        }
        if self.units.iter().any(|unit| unit.trim().is_empty()) {
            return Err(QueueError::Validation(format!(
                "task for {} contains an empty unit id",
                self.content_id
            )));
        }
        Ok(())
    }
}

/// Download task: every selected chapter or episode of one title
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: TaskId,
    pub content_id: String,
    pub kind: ContentKind,
    pub title: String,
    /// Fetch order, fixed at creation
    pub units: Vec<String>,
    pub status: TaskStatus,
    pub bytes_downloaded: u64,
    /// Unknown until unit sizes resolve
    pub bytes_total: Option<u64>,
    /// Resolved size of each unit, parallel to `units`
    pub unit_sizes: Vec<Option<u64>>,
    pub priority: i32,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub checkpoint: Checkpoint,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadTask {
    /// Create a new download task
    pub fn new(request: NewTask) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let unit_count = request.units.len();

        Self {
            id,
            content_id: request.content_id,
            kind: request.kind,
            title: request.title,
            units: request.units,
            status: TaskStatus::Queued,
            bytes_downloaded: 0,
            bytes_total: None,
            unit_sizes: vec![None; unit_count],
            priority: request.priority,
            retry_count: 0,
            last_error: None,
            checkpoint: Checkpoint::default(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, rejecting edges the state machine does not have
    pub fn transition(&mut self, next: TaskStatus, action: &'static str) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(QueueError::InvalidState {
                id: self.id.clone(),
                status: self.status.to_string(),
                action,
            });
        }
        self.status = next;
        if next == TaskStatus::Completed {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record the size of one unit and refresh the total estimate
    pub fn resolve_unit_size(&mut self, index: usize, size: u64) {
        if self.unit_sizes.len() != self.units.len() {
            self.unit_sizes.resize(self.units.len(), None);
        }
        if let Some(slot) = self.unit_sizes.get_mut(index) {
            *slot = Some(size);
        }
        self.bytes_total = estimate_total(&self.unit_sizes);
    }

    /// Roll the live counters back to the last durable checkpoint
    pub fn restore_checkpoint(&mut self) {
        self.bytes_downloaded = self.checkpoint.bytes_downloaded;
    }

    pub fn units_remaining(&self) -> usize {
        self.units.len().saturating_sub(self.checkpoint.units_completed)
    }
}

/// Exact total when every unit size is known, otherwise extrapolated from the
/// mean of the known sizes. `None` until at least one size resolves.
pub fn estimate_total(sizes: &[Option<u64>]) -> Option<u64> {
    let known: Vec<u64> = sizes.iter().flatten().copied().collect();
    if known.is_empty() {
        return None;
    }
    let known_sum: u64 = known.iter().sum();
    let unknown = (sizes.len() - known.len()) as u64;
    let mean = known_sum / known.len() as u64;
    Some(known_sum + mean * unknown)
}
