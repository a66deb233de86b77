use crate::queue::task::ContentKind;
use crate::utils::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};

/// One chapter or episode to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRef {
    pub kind: ContentKind,
    pub content_id: String,
    pub unit_id: String,
    /// Position within the task's unit list
    pub index: usize,
}

/// Body of one unit, as a stream of chunks
pub struct ByteStream {
    /// Bytes the stream will yield, when the source reports it
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl ByteStream {
    pub fn new(content_length: Option<u64>, body: BoxStream<'static, Result<Bytes>>) -> Self {
        Self {
            content_length,
            body,
        }
    }

    /// Stream over chunks already in memory
    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        let length = chunks.iter().map(|c| c.len() as u64).sum();
        Self::new(Some(length), stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("content_length", &self.content_length)
            .finish()
    }
}

/// Core trait for all content sources
///
/// This trait isolates the queue from how a given kind of content is fetched
/// (a manga site's chapter archives, an anime host's episode files, ...).
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Returns a unique identifier for this source (e.g., "manga-http")
    fn id(&self) -> &'static str;

    /// Checks if this source can fetch the given kind of content
    fn supports(&self, kind: ContentKind) -> bool;

    /// Size of a unit without downloading it, when the source can tell
    async fn probe_size(&self, _unit: &UnitRef) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Open the unit's bytes starting at `offset`.
    ///
    /// Fails with `Network` (retryable) or `NotFound`/`Validation` (not retryable).
    async fn fetch(&self, unit: &UnitRef, offset: u64) -> Result<ByteStream>;
}
