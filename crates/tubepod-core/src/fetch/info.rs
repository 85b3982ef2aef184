use serde::Deserialize;
use url::Url;

use crate::media::MediaItem;
use crate::naming::{clean_channel_name, split_artist_title};

/// The subset of yt-dlp's info dict we use. Flat playlist listings reuse the
/// same shape for their entries (with far fewer fields populated).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoInfo {
    #[serde(rename = "_type")]
    pub kind: Option<String>,
    pub id: Option<String>,
    pub title: Option<String>,
    pub url: Option<String>,
    pub webpage_url: Option<String>,
    pub ie_key: Option<String>,
    pub uploader: Option<String>,
    pub channel: Option<String>,
    pub artist: Option<String>,
    pub track: Option<String>,
    pub album: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub thumbnails: Option<Vec<Thumbnail>>,
    pub entries: Option<Vec<Option<VideoInfo>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Thumbnail {
    pub url: Option<String>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub preference: Option<i64>,
}

impl VideoInfo {
    pub fn is_playlist(&self) -> bool {
        self.kind.as_deref() == Some("playlist") || self.entries.is_some()
    }

    /// URL a single entry can be downloaded from.
    pub fn page_url(&self) -> Option<String> {
        let http = |u: &Option<String>| u.clone().filter(|s| s.starts_with("http"));
        http(&self.webpage_url).or_else(|| http(&self.url)).or_else(|| {
            let id = self.id.as_deref().filter(|s| !s.is_empty())?;
            match self.ie_key.as_deref() {
                None | Some("Youtube") => Some(format!("https://www.youtube.com/watch?v={}", id)),
                Some(_) => None,
            }
        })
    }
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Build the work list from a listing, preserving listing order.
///
/// Null playlist entries are kept as empty items so they still produce a
/// (failed) result.
pub fn items_from_listing(info: &VideoInfo, request_url: &str) -> Vec<MediaItem> {
    if !info.is_playlist() {
        let mut item = MediaItem::new(
            0,
            info.id.clone().unwrap_or_default(),
            info.page_url().unwrap_or_else(|| request_url.to_string()),
            String::new(),
        );
        apply_info(&mut item, info);
        return vec![item];
    }

    let playlist_title = non_empty(&info.title).map(str::to_string);
    info.entries
        .iter()
        .flatten()
        .enumerate()
        .map(|(index, entry)| {
            let mut item = MediaItem::new(index, "", "", "");
            item.playlist_title = playlist_title.clone();
            item.track_number = Some(index as u32 + 1);
            if let Some(entry) = entry {
                item.id = entry.id.clone().unwrap_or_default();
                item.url = entry.page_url().unwrap_or_default();
                apply_info(&mut item, entry);
            }
            item
        })
        .collect()
}

/// Fold extractor metadata into an item. Safe to call again with fuller info.
pub fn apply_info(item: &mut MediaItem, info: &VideoInfo) {
    if item.id.is_empty() {
        if let Some(id) = non_empty(&info.id) {
            item.id = id.to_string();
        }
    }
    if item.url.is_empty() {
        if let Some(url) = info.page_url() {
            item.url = url;
        }
    }

    let raw_title = non_empty(&info.title).unwrap_or("");
    let (artist, title) = match (non_empty(&info.artist), non_empty(&info.track)) {
        (Some(artist), Some(track)) => (artist.to_string(), track.to_string()),
        _ => match split_artist_title(raw_title) {
            Some(pair) => pair,
            None => {
                let artist = non_empty(&info.artist)
                    .map(str::to_string)
                    .or_else(|| non_empty(&info.uploader).map(clean_channel_name))
                    .or_else(|| non_empty(&info.channel).map(clean_channel_name))
                    .unwrap_or_default();
                (artist, raw_title.to_string())
            }
        },
    };
    if !title.is_empty() {
        item.title = title;
    }
    if !artist.is_empty() {
        item.artist = artist;
    }

    item.album = non_empty(&info.album)
        .map(str::to_string)
        .or_else(|| item.playlist_title.clone())
        .unwrap_or_else(|| item.artist.clone());

    if let Some(d) = info.duration.filter(|d| d.is_finite() && *d >= 0.0) {
        item.duration = Some(d.round() as u64);
    }
    if let Some(thumb) = best_thumbnail(info) {
        item.artwork_url = Some(thumb);
    }
}

fn is_embeddable_image(url: &str) -> bool {
    let path = Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    mime_guess::from_path(path)
        .first()
        .is_some_and(|m| m == mime_guess::mime::IMAGE_JPEG || m == mime_guess::mime::IMAGE_PNG)
}

/// Largest JPEG/PNG thumbnail; iPods cannot show WebP covers.
pub fn best_thumbnail(info: &VideoInfo) -> Option<String> {
    let best = info
        .thumbnails
        .iter()
        .flatten()
        .filter_map(|t| t.url.as_deref().map(|u| (t, u)))
        .filter(|(_, u)| is_embeddable_image(u))
        .max_by_key(|(t, _)| {
            (
                t.width.unwrap_or(0) * t.height.unwrap_or(0),
                t.preference.unwrap_or(i64::MIN),
            )
        })
        .map(|(_, u)| u.to_string());
    best.or_else(|| non_empty(&info.thumbnail).map(str::to_string))
}
