//! Where downloaded units end up

use crate::queue::task::DownloadTask;
use crate::source::traits::ByteStream;
use crate::utils::error::{QueueError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::debug;

/// An open unit file
#[async_trait]
pub trait UnitSink: Send {
    /// Append a chunk. `Ok` means the bytes are accepted and count as written.
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;

    /// Make everything written so far durable
    async fn flush(&mut self) -> Result<()>;

    /// Flush and close; returns the unit's size on disk
    async fn finish(&mut self) -> Result<u64>;
}

/// Destination for unit bytes.
///
/// Paths are relative to the storage root. Failures are `DiskFull` (halts the
/// queue) or `Io` (retryable).
#[async_trait]
pub trait Storage: Send + Sync {
    /// Open `path` for writing, keeping the first `offset` bytes and dropping
    /// anything after them
    async fn open(&self, path: &Path, offset: u64) -> Result<Box<dyn UnitSink>>;

    /// Remove a partially written unit
    async fn discard(&self, path: &Path) -> Result<()>;

    /// Write a whole stream to `path`, returning the bytes written
    async fn write(&self, path: &Path, mut stream: ByteStream) -> Result<u64> {
        let mut sink = self.open(path, 0).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.body.next().await {
            let chunk = chunk?;
            sink.write(&chunk).await?;
            written += chunk.len() as u64;
        }
        sink.finish().await?;
        Ok(written)
    }
}

/// Relative path of one unit: `{content}/{index:04}-{unit}.{ext}`
pub fn unit_path(task: &DownloadTask, index: usize) -> PathBuf {
    let unit = task.units.get(index).map(String::as_str).unwrap_or_default();
    PathBuf::from(sanitize_component(&task.content_id)).join(format!(
        "{:04}-{}.{}",
        index + 1,
        sanitize_component(unit),
        task.kind.file_extension()
    ))
}

/// Make an id safe to use as a single path component on every platform
pub fn sanitize_component(name: &str) -> String {
    const INVALID: [char; 10] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|', '\0'];

    let mut sanitized: String = name
        .replace("..", "")
        .chars()
        .map(|c| if INVALID.contains(&c) || c.is_control() { '_' } else { c })
        .collect();
    sanitized = sanitized
        .trim()
        .trim_start_matches('.')
        .trim_end_matches(['.', ' '])
        .to_string();
    while sanitized.contains("__") {
        sanitized = sanitized.replace("__", "_");
    }

    if sanitized.is_empty() {
        "untitled".to_string()
    } else {
        sanitized
    }
}

/// Filesystem storage rooted at the download location
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(QueueError::Validation(format!(
                "storage path escapes download location: {}",
                path.display()
            )));
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn open(&self, path: &Path, offset: u64) -> Result<Box<dyn UnitSink>> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await.map_err(QueueError::from_io)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&full)
            .await
            .map_err(QueueError::from_io)?;
        file.set_len(offset).await.map_err(QueueError::from_io)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(QueueError::from_io)?;

        debug!("Opened {} at offset {}", full.display(), offset);
        Ok(Box::new(FsSink {
            file: BufWriter::new(file),
            size: offset,
        }))
    }

    async fn discard(&self, path: &Path) -> Result<()> {
        let full = self.resolve(path)?;
        match fs::remove_file(&full).await {
            Ok(()) => {
                debug!("Discarded partial unit {}", full.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(QueueError::from_io(e)),
        }
    }
}

struct FsSink {
    file: BufWriter<File>,
    size: u64,
}

#[async_trait]
impl UnitSink for FsSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await.map_err(QueueError::from_io)?;
        self.size += chunk.len() as u64;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.file.flush().await.map_err(QueueError::from_io)?;
        self.file
            .get_ref()
            .sync_data()
            .await
            .map_err(QueueError::from_io)
    }

    async fn finish(&mut self) -> Result<u64> {
        self.flush().await?;
        Ok(self.size)
    }
}
