//! Shared fakes for the queue integration tests: a scripted content source,
//! in-memory storage and a recording notification sink.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use mangaqueue::downloader::{Storage, UnitSink};
use mangaqueue::queue::task::ContentKind;
use mangaqueue::{
    ByteStream, ContentFetcher, DownloadTask, NotificationSink, QueueError, QueueManager,
    QueueSettings, TaskId, TaskStatus, TaskStore, UnitRef,
};
use mangaqueue::database::{initialize_database, DatabaseManager};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

pub type FetchResult = mangaqueue::Result<ByteStream>;

/// Byte at `offset` of every unit; lets tests verify resumed files
pub fn pattern_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

pub fn unit_bytes(size: u64) -> Vec<u8> {
    (0..size).map(pattern_byte).collect()
}

/// How a scripted fetch misbehaves
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail before any byte with a network error
    Network,
    /// The unit no longer exists
    NotFound,
    /// Stream this many bytes, then drop the connection
    BreakAfter(u64),
    /// Stream this many bytes, then go silent
    StallAfter(u64),
}

#[derive(Default)]
struct Script {
    sizes: HashMap<String, u64>,
    /// key -> (fault, remaining uses; None = forever)
    faults: HashMap<String, (Fault, Option<u32>)>,
    held: HashSet<String>,
    fetches: Vec<(String, u64)>,
}

/// Content source driven by the test.
///
/// Keys are either a content id (every unit of it) or `content/unit`.
pub struct ScriptedFetcher {
    script: Mutex<Script>,
    released: Notify,
    default_size: u64,
    chunk: usize,
    chunk_delay: Duration,
    advertise_sizes: AtomicBool,
    strict_ranges: AtomicBool,
}

impl ScriptedFetcher {
    pub fn new(default_size: u64) -> Self {
        Self {
            script: Mutex::new(Script::default()),
            released: Notify::new(),
            default_size,
            chunk: 256,
            chunk_delay: Duration::ZERO,
            advertise_sizes: AtomicBool::new(true),
            strict_ranges: AtomicBool::new(false),
        }
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn advertise_sizes(&self, advertise: bool) {
        self.advertise_sizes.store(advertise, Ordering::SeqCst);
    }

    /// Refuse ranges starting at or past the end of a unit, like an HTTP
    /// server answering 416
    pub fn strict_ranges(&self, strict: bool) {
        self.strict_ranges.store(strict, Ordering::SeqCst);
    }

    pub fn set_size(&self, key: &str, size: u64) {
        self.script.lock().unwrap().sizes.insert(key.to_string(), size);
    }

    pub fn fault(&self, key: &str, fault: Fault, times: Option<u32>) {
        self.script
            .lock()
            .unwrap()
            .faults
            .insert(key.to_string(), (fault, times));
    }

    pub fn clear_faults(&self) {
        self.script.lock().unwrap().faults.clear();
    }

    /// Block fetches for `key` before their first byte
    pub fn hold(&self, key: &str) {
        self.script.lock().unwrap().held.insert(key.to_string());
    }

    pub fn release(&self, key: &str) {
        self.script.lock().unwrap().held.remove(key);
        self.released.notify_waiters();
    }

    pub fn release_all(&self) {
        self.script.lock().unwrap().held.clear();
        self.released.notify_waiters();
    }

    /// Offsets requested for one unit, in call order
    pub fn fetch_offsets(&self, content_id: &str, unit_id: &str) -> Vec<u64> {
        let key = format!("{}/{}", content_id, unit_id);
        self.script
            .lock()
            .unwrap()
            .fetches
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, offset)| *offset)
            .collect()
    }

    pub fn fetch_count(&self) -> usize {
        self.script.lock().unwrap().fetches.len()
    }

    fn size_of(&self, unit: &UnitRef) -> u64 {
        let script = self.script.lock().unwrap();
        script
            .sizes
            .get(&unit_key(unit))
            .or_else(|| script.sizes.get(&unit.content_id))
            .copied()
            .unwrap_or(self.default_size)
    }

    fn is_held(&self, unit: &UnitRef) -> bool {
        let script = self.script.lock().unwrap();
        script.held.contains(&unit_key(unit)) || script.held.contains(&unit.content_id)
    }

    fn take_fault(&self, unit: &UnitRef) -> Option<Fault> {
        let mut script = self.script.lock().unwrap();
        let key = if script.faults.contains_key(&unit_key(unit)) {
            unit_key(unit)
        } else if script.faults.contains_key(&unit.content_id) {
            unit.content_id.clone()
        } else {
            return None;
        };

        let (fault, remaining) = script.faults.get_mut(&key)?;
        let fault = fault.clone();
        match remaining {
            Some(0) => return None,
            Some(n) => *n -= 1,
            None => {}
        }
        Some(fault)
    }
}

fn unit_key(unit: &UnitRef) -> String {
    format!("{}/{}", unit.content_id, unit.unit_id)
}

#[async_trait]
impl ContentFetcher for ScriptedFetcher {
    fn id(&self) -> &'static str {
        "scripted"
    }

    fn supports(&self, _kind: ContentKind) -> bool {
        true
    }

    async fn probe_size(&self, unit: &UnitRef) -> mangaqueue::Result<Option<u64>> {
        if self.advertise_sizes.load(Ordering::SeqCst) {
            Ok(Some(self.size_of(unit)))
        } else {
            Ok(None)
        }
    }

    async fn fetch(&self, unit: &UnitRef, offset: u64) -> FetchResult {
        self.script
            .lock()
            .unwrap()
            .fetches
            .push((unit_key(unit), offset));

        loop {
            let released = self.released.notified();
            if !self.is_held(unit) {
                break;
            }
            released.await;
        }

        let size = self.size_of(unit);
        if offset > 0 && offset >= size && self.strict_ranges.load(Ordering::SeqCst) {
            return Err(QueueError::Validation(format!(
                "416 Range Not Satisfiable: {} has {} bytes, asked from {}",
                unit.unit_id, size, offset
            )));
        }
        let mut end = size;
        let mut broken = false;
        let mut stalled = false;
        match self.take_fault(unit) {
            Some(Fault::Network) => {
                return Err(QueueError::Network(format!("connection reset fetching {}", unit.unit_id)))
            }
            Some(Fault::NotFound) => {
                return Err(QueueError::NotFound(format!("{} was removed", unit.unit_id)))
            }
            Some(Fault::BreakAfter(bytes)) => {
                end = (offset + bytes).min(size);
                broken = true;
            }
            Some(Fault::StallAfter(bytes)) => {
                end = (offset + bytes).min(size);
                stalled = true;
            }
            None => {}
        }

        let chunk = self.chunk as u64;
        let delay = self.chunk_delay;
        let chunks: Vec<(u64, u64)> = (offset..end)
            .step_by(self.chunk)
            .map(|start| (start, (start + chunk).min(end)))
            .collect();

        let body = stream::iter(chunks)
            .then(move |(start, stop)| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(Bytes::from((start..stop).map(pattern_byte).collect::<Vec<u8>>()))
            })
            .chain(stream::iter(broken.then(|| {
                Err(QueueError::Network("connection dropped".to_string()))
            })))
            .chain(if stalled {
                stream::pending().boxed()
            } else {
                stream::empty().boxed()
            })
            .boxed();

        Ok(ByteStream::new(Some(size - offset), body))
    }
}

/// Storage kept in memory; can simulate a full disk
#[derive(Default)]
pub struct MemoryStorage {
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
    disk_full: Arc<AtomicBool>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_disk_full(&self, full: bool) {
        self.disk_full.store(full, Ordering::SeqCst);
    }

    pub fn file(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().unwrap().len()
    }
}

struct MemorySink {
    path: PathBuf,
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
    disk_full: Arc<AtomicBool>,
}

#[async_trait]
impl UnitSink for MemorySink {
    async fn write(&mut self, chunk: &[u8]) -> mangaqueue::Result<()> {
        if self.disk_full.load(Ordering::SeqCst) {
            return Err(QueueError::DiskFull("no space left on device".to_string()));
        }
        self.files
            .lock()
            .unwrap()
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(chunk);
        Ok(())
    }

    async fn flush(&mut self) -> mangaqueue::Result<()> {
        Ok(())
    }

    async fn finish(&mut self) -> mangaqueue::Result<u64> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(&self.path)
            .map(|data| data.len() as u64)
            .unwrap_or(0))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn open(&self, path: &Path, offset: u64) -> mangaqueue::Result<Box<dyn UnitSink>> {
        self.files
            .lock()
            .unwrap()
            .entry(path.to_path_buf())
            .or_default()
            .truncate(offset as usize);
        Ok(Box::new(MemorySink {
            path: path.to_path_buf(),
            files: self.files.clone(),
            disk_full: self.disk_full.clone(),
        }))
    }

    async fn discard(&self, path: &Path) -> mangaqueue::Result<()> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }
}

/// Records every notification in order
#[derive(Default)]
pub struct RecordingSink {
    changes: Mutex<Vec<DownloadTask>>,
    halts: Mutex<Vec<String>>,
    cleared: Mutex<Vec<TaskId>>,
}

impl RecordingSink {
    pub fn statuses(&self, task_id: &str) -> Vec<TaskStatus> {
        self.changes
            .lock()
            .unwrap()
            .iter()
            .filter(|task| task.id == task_id)
            .map(|task| task.status)
            .collect()
    }

    pub fn changes(&self, task_id: &str) -> Vec<DownloadTask> {
        self.changes
            .lock()
            .unwrap()
            .iter()
            .filter(|task| task.id == task_id)
            .cloned()
            .collect()
    }

    /// Task ids in the order they were admitted
    pub fn admissions(&self) -> Vec<TaskId> {
        self.changes
            .lock()
            .unwrap()
            .iter()
            .filter(|task| task.status == TaskStatus::InProgress)
            .map(|task| task.id.clone())
            .collect()
    }

    pub fn halts(&self) -> Vec<String> {
        self.halts.lock().unwrap().clone()
    }

    pub fn cleared(&self) -> Vec<TaskId> {
        self.cleared.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn on_task_changed(&self, task: &DownloadTask) {
        self.changes.lock().unwrap().push(task.clone());
    }

    fn on_queue_halted(&self, reason: &str) {
        self.halts.lock().unwrap().push(reason.to_string());
    }

    fn on_cleared(&self, task_ids: &[TaskId]) {
        self.cleared.lock().unwrap().extend_from_slice(task_ids);
    }
}

/// Settings tuned for fast tests
pub fn test_settings(dir: &Path, max_concurrent: usize) -> QueueSettings {
    QueueSettings {
        download_location: dir.join("downloads"),
        database_path: dir.join("queue.db"),
        max_concurrent,
        max_retries: 3,
        unit_attempts: 1,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 40,
        unit_retry_delay_ms: 5,
        fetch_timeout_secs: 5,
        progress_interval_ms: 0,
        ..QueueSettings::default()
    }
}

pub async fn open_store(path: &Path) -> Arc<TaskStore> {
    let pool = initialize_database(path).await.expect("open database");
    Arc::new(TaskStore::open(DatabaseManager::new(pool)).await.expect("open store"))
}

/// A manager over fakes, with handles to each fake
pub struct Harness {
    pub manager: QueueManager,
    pub store: Arc<TaskStore>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub storage: Arc<MemoryStorage>,
    pub sink: Arc<RecordingSink>,
    pub settings: QueueSettings,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new(max_concurrent: usize) -> Self {
        Self::with(max_concurrent, |_| {}, ScriptedFetcher::new(1_000)).await
    }

    pub async fn with(
        max_concurrent: usize,
        configure: impl FnOnce(&mut QueueSettings),
        fetcher: ScriptedFetcher,
    ) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut settings = test_settings(dir.path(), max_concurrent);
        configure(&mut settings);
        Self::over(dir, settings, Arc::new(fetcher), Arc::new(MemoryStorage::new())).await
    }

    /// Build on an existing directory (for restart tests)
    pub async fn over(
        dir: TempDir,
        settings: QueueSettings,
        fetcher: Arc<ScriptedFetcher>,
        storage: Arc<MemoryStorage>,
    ) -> Self {
        let store = open_store(&settings.database_path).await;
        let sink = Arc::new(RecordingSink::default());
        let manager = QueueManager::new(
            settings.clone(),
            store.clone(),
            fetcher.clone(),
            storage.clone(),
            sink.clone(),
        );
        Self {
            manager,
            store,
            fetcher,
            storage,
            sink,
            settings,
            dir,
        }
    }

    pub async fn status(&self, task_id: &str) -> TaskStatus {
        self.manager.get(task_id).await.expect("task exists").status
    }

    pub async fn wait_for_status(&self, task_id: &str, status: TaskStatus) -> DownloadTask {
        wait_until(&format!("task {} to be {}", task_id, status), || async {
            self.status(task_id).await == status
        })
        .await;
        self.manager.get(task_id).await.expect("task exists")
    }
}

/// Poll `check` until it holds; panics after five seconds
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
