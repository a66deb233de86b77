use crate::queue::task::ContentKind;
use crate::source::traits::{ByteStream, ContentFetcher, UnitRef};
use crate::utils::error::{QueueError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// The source registry
///
/// Holds one source per content kind and routes each unit to the first
/// source whose `supports(kind)` matches.
pub struct SourceRouter {
    sources: Vec<Arc<dyn ContentFetcher>>,
}

impl SourceRouter {
    pub fn new(sources: Vec<Arc<dyn ContentFetcher>>) -> Self {
        Self { sources }
    }

    /// Find the source for a given kind
    fn find_source(&self, kind: ContentKind) -> Result<&Arc<dyn ContentFetcher>> {
        let source = self
            .sources
            .iter()
            .find(|source| source.supports(kind))
            .ok_or_else(|| {
                QueueError::Validation(format!("no source configured for {}", kind.as_str()))
            })?;
        debug!("Routing {} to source: {}", kind.as_str(), source.id());
        Ok(source)
    }
}

#[async_trait]
impl ContentFetcher for SourceRouter {
    fn id(&self) -> &'static str {
        "router"
    }

    fn supports(&self, kind: ContentKind) -> bool {
        self.sources.iter().any(|source| source.supports(kind))
    }

    async fn probe_size(&self, unit: &UnitRef) -> Result<Option<u64>> {
        self.find_source(unit.kind)?.probe_size(unit).await
    }

    async fn fetch(&self, unit: &UnitRef, offset: u64) -> Result<ByteStream> {
        self.find_source(unit.kind)?.fetch(unit, offset).await
    }
}
