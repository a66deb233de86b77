//! Shared HTTP plumbing for content sources

use crate::source::traits::ByteStream;
use crate::utils::error::{QueueError, Result};
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;
use tracing::debug;

/// HTTP client bound to one source's base URL
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    base_url: Url,
}

impl HttpSource {
    /// Build a client. Only connecting is bounded here: body reads are bounded
    /// per chunk by the worker, so long transfers are not cut off.
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| QueueError::Validation(format!("invalid source url {}: {}", base_url, e)))?;
        let client = Client::builder()
            .user_agent(concat!("mangaqueue/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| QueueError::Network(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client, base_url })
    }

    /// Base URL with `segments` appended as escaped path segments
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| QueueError::Validation(format!("source url {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// HEAD request for the body length
    pub async fn probe(&self, url: Url) -> Result<Option<u64>> {
        let response = self.client.head(url).send().await?.error_for_status()?;
        Ok(response.content_length())
    }

    /// GET starting at `offset`. Servers that ignore the range get their
    /// leading bytes skipped locally.
    pub async fn get(&self, url: Url, offset: u64) -> Result<ByteStream> {
        let mut request = self.client.get(url.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await?;
        if offset > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            // Nothing left past `offset`
            debug!("GET {} -> 416 at offset {}, nothing left to fetch", url, offset);
            return Ok(ByteStream::from_chunks(Vec::new()));
        }
        let response = response.error_for_status()?;
        let honoured_range = response.status() == StatusCode::PARTIAL_CONTENT;
        let skip = if offset > 0 && !honoured_range { offset } else { 0 };
        let content_length = response
            .content_length()
            .map(|length| length.saturating_sub(skip));

        debug!(
            "GET {} -> {} (offset {}, length {:?})",
            url,
            response.status(),
            offset,
            content_length
        );

        let mut remaining = skip;
        let body = response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(QueueError::from).map(|mut bytes: Bytes| {
                    if remaining > 0 {
                        let cut = remaining.min(bytes.len() as u64) as usize;
                        remaining -= cut as u64;
                        bytes = bytes.split_off(cut);
                    }
                    bytes
                })
            })
            .boxed();

        Ok(ByteStream::new(content_length, body))
    }
}
