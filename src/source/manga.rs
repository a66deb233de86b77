//! Manga chapter source: one CBZ archive per chapter

use crate::queue::task::ContentKind;
use crate::source::http::HttpSource;
use crate::source::traits::{ByteStream, ContentFetcher, UnitRef};
use crate::utils::error::Result;
use async_trait::async_trait;
use std::time::Duration;

pub struct MangaChapterFetcher {
    http: HttpSource,
}

impl MangaChapterFetcher {
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpSource::new(base_url, connect_timeout)?,
        })
    }

    fn archive_url(&self, unit: &UnitRef) -> Result<reqwest::Url> {
        self.http.endpoint(&[
            "manga",
            &unit.content_id,
            "chapters",
            &unit.unit_id,
            "archive",
        ])
    }
}

#[async_trait]
impl ContentFetcher for MangaChapterFetcher {
    fn id(&self) -> &'static str {
        "manga-http"
    }

    fn supports(&self, kind: ContentKind) -> bool {
        kind == ContentKind::Manga
    }

    async fn probe_size(&self, unit: &UnitRef) -> Result<Option<u64>> {
        self.http.probe(self.archive_url(unit)?).await
    }

    async fn fetch(&self, unit: &UnitRef, offset: u64) -> Result<ByteStream> {
        self.http.get(self.archive_url(unit)?, offset).await
    }
}
