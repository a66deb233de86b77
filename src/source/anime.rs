//! Anime episode source: one video file per episode

use crate::queue::task::ContentKind;
use crate::source::http::HttpSource;
use crate::source::traits::{ByteStream, ContentFetcher, UnitRef};
use crate::utils::error::Result;
use async_trait::async_trait;
use std::time::Duration;

pub struct AnimeEpisodeFetcher {
    http: HttpSource,
}

impl AnimeEpisodeFetcher {
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpSource::new(base_url, connect_timeout)?,
        })
    }

    fn video_url(&self, unit: &UnitRef) -> Result<reqwest::Url> {
        self.http.endpoint(&[
            "anime",
            &unit.content_id,
            "episodes",
            &unit.unit_id,
            "video",
        ])
    }
}

#[async_trait]
impl ContentFetcher for AnimeEpisodeFetcher {
    fn id(&self) -> &'static str {
        "anime-http"
    }

    fn supports(&self, kind: ContentKind) -> bool {
        kind == ContentKind::Anime
    }

    async fn probe_size(&self, unit: &UnitRef) -> Result<Option<u64>> {
        self.http.probe(self.video_url(unit)?).await
    }

    async fn fetch(&self, unit: &UnitRef, offset: u64) -> Result<ByteStream> {
        self.http.get(self.video_url(unit)?, offset).await
    }
}
