pub mod anime;
pub mod http;
pub mod manga;
pub mod router;
pub mod traits;

pub use crate::queue::task::ContentKind;
pub use anime::AnimeEpisodeFetcher;
pub use manga::MangaChapterFetcher;
pub use router::SourceRouter;
pub use traits::{ByteStream, ContentFetcher, UnitRef};
