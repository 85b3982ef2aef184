pub mod info;
pub mod ytdlp;

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::media::{MediaItem, MediaRequest};

pub use ytdlp::YtDlpFetcher;

pub trait Fetcher: Send + Sync {
    /// Expand a request into items, in source listing order.
    ///
    /// Only the listing is read here; nothing is downloaded. A single-video
    /// URL yields exactly one item.
    fn resolve(&self, request: &MediaRequest) -> Result<Vec<MediaItem>>;

    /// Download one item's stream into `dir`, returning the local file.
    fn fetch(&self, item: &mut MediaItem, dir: &Path, request: &MediaRequest) -> Result<PathBuf>;
}
