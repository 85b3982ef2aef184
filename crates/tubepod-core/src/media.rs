use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::tag::{Artwork, TrackMetadata};

/// Bitrates (kbps) the converter is allowed to target.
pub const SUPPORTED_QUALITIES: [u32; 4] = [128, 192, 256, 320];

pub const DEFAULT_QUALITY: u32 = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// AAC in an MPEG-4 container
    #[default]
    M4a,
    /// MPEG-1 Layer III
    Mp3,
}

impl AudioFormat {
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::M4a => "m4a",
            AudioFormat::Mp3 => "mp3",
        }
    }

    /// ffmpeg encoder name
    pub fn codec(self) -> &'static str {
        match self {
            AudioFormat::M4a => "aac",
            AudioFormat::Mp3 => "libmp3lame",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Video frame size. Only sizes the iPod nano can play are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const SUPPORTED: [Resolution; 3] = [
        Resolution { width: 640, height: 480 },
        Resolution { width: 480, height: 360 },
        Resolution { width: 320, height: 240 },
    ];
}

impl Default for Resolution {
    fn default() -> Self {
        Resolution::SUPPORTED[0]
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got `{}`", s))?;
        let parsed = Resolution {
            width: w.parse().map_err(|_| format!("invalid width in `{}`", s))?,
            height: h.parse().map_err(|_| format!("invalid height in `{}`", s))?,
        };
        if Resolution::SUPPORTED.contains(&parsed) {
            Ok(parsed)
        } else {
            Err(format!(
                "unsupported resolution {} (supported: 640x480, 480x360, 320x240)",
                parsed
            ))
        }
    }
}

impl TryFrom<String> for Resolution {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.to_string()
    }
}

/// What the user asked for. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct MediaRequest {
    url: String,
    format: AudioFormat,
    quality: u32,
    video: bool,
    resolution: Resolution,
}

impl MediaRequest {
    pub fn new(
        url: &str,
        format: AudioFormat,
        quality: u32,
        video: bool,
        resolution: Resolution,
    ) -> Result<Self> {
        let url = url.trim();
        let parsed = Url::parse(url)
            .map_err(|e| Error::InvalidRequest(format!("`{}` is not a valid URL: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(Error::InvalidRequest(format!(
                "`{}` is not an http(s) URL",
                url
            )));
        }
        if !SUPPORTED_QUALITIES.contains(&quality) {
            return Err(Error::InvalidRequest(format!(
                "unsupported quality {} kbps (supported: 128, 192, 256, 320)",
                quality
            )));
        }
        Ok(Self {
            url: url.to_string(),
            format,
            quality,
            video,
            resolution,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn quality(&self) -> u32 {
        self.quality
    }

    pub fn video(&self) -> bool {
        self.video
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Output container extension; video always goes into mp4.
    pub fn extension(&self) -> &'static str {
        if self.video {
            "mp4"
        } else {
            self.format.extension()
        }
    }

    pub fn is_playlist(&self) -> bool {
        is_playlist_url(&self.url)
    }
}

/// A URL carrying a non-empty `list=` parameter is treated as a playlist.
pub fn is_playlist_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if parsed.path() == "/playlist" {
        return true;
    }
    parsed
        .query_pairs()
        .any(|(k, v)| k == "list" && !v.is_empty())
}

/// One resolved unit of work, enriched as it moves through the stages.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MediaItem {
    /// Position in the source listing (0-based)
    pub index: usize,
    /// Extractor id (YouTube video id)
    pub id: String,
    /// URL the fetcher downloads from
    pub url: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub track_number: Option<u32>,
    pub playlist_title: Option<String>,
    /// Duration in seconds
    pub duration: Option<u64>,
    pub artwork_url: Option<String>,
    pub download_path: Option<PathBuf>,
    pub converted_path: Option<PathBuf>,
    pub tags_attempted: bool,
}

impl MediaItem {
    pub fn new(index: usize, id: impl Into<String>, url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            index,
            id: id.into(),
            url: url.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    /// Title for logs and summaries; falls back to the id, then the URL.
    pub fn display_name(&self) -> &str {
        if !self.title.is_empty() {
            &self.title
        } else if !self.id.is_empty() {
            &self.id
        } else {
            &self.url
        }
    }

    /// Transfer requires a converted file and an attempted tag write.
    pub fn ready_for_transfer(&self) -> bool {
        self.tags_attempted
            && self
                .converted_path
                .as_ref()
                .is_some_and(|p| !p.as_os_str().is_empty())
    }

    pub fn track_metadata(&self, embed_artwork: bool) -> TrackMetadata {
        let artist = if self.artist.is_empty() {
            "Unknown Artist".to_string()
        } else {
            self.artist.clone()
        };
        let album = if self.album.is_empty() {
            artist.clone()
        } else {
            self.album.clone()
        };
        TrackMetadata {
            title: self.display_name().to_string(),
            artist,
            album,
            track_number: self.track_number,
            artwork: if embed_artwork {
                self.artwork_url.clone().map(Artwork::Url)
            } else {
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation() {
        let ok = MediaRequest::new(
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            AudioFormat::M4a,
            256,
            false,
            Resolution::default(),
        )
        .unwrap();
        assert_eq!(ok.extension(), "m4a");
        assert!(!ok.is_playlist());

        let bad_quality = MediaRequest::new(
            "https://www.youtube.com/watch?v=x",
            AudioFormat::M4a,
            100,
            false,
            Resolution::default(),
        );
        assert!(matches!(bad_quality, Err(Error::InvalidRequest(_))));

        let bad_scheme = MediaRequest::new(
            "ftp://example.com/video",
            AudioFormat::Mp3,
            128,
            false,
            Resolution::default(),
        );
        assert!(matches!(bad_scheme, Err(Error::InvalidRequest(_))));
        assert!(MediaRequest::new("not a url", AudioFormat::Mp3, 128, false, Resolution::default()).is_err());
    }

    #[test]
    fn test_video_uses_mp4() {
        let req = MediaRequest::new(
            "https://youtu.be/dQw4w9WgXcQ",
            AudioFormat::Mp3,
            192,
            true,
            Resolution::default(),
        )
        .unwrap();
        assert_eq!(req.extension(), "mp4");
    }

    #[test]
    fn test_playlist_detection() {
        assert!(is_playlist_url("https://www.youtube.com/playlist?list=PL123"));
        assert!(is_playlist_url("https://www.youtube.com/watch?v=abc&list=PL123"));
        assert!(!is_playlist_url("https://www.youtube.com/watch?v=abc"));
        assert!(!is_playlist_url("https://www.youtube.com/watch?v=abc&list="));
        assert!(!is_playlist_url("garbage"));
    }

    #[test]
    fn test_resolution_parse() {
        assert_eq!("480x360".parse::<Resolution>().unwrap(), Resolution { width: 480, height: 360 });
        assert!("1920x1080".parse::<Resolution>().is_err());
        assert!("640by480".parse::<Resolution>().is_err());
        assert_eq!(Resolution::default().to_string(), "640x480");
    }

    #[test]
    fn test_ready_for_transfer() {
        let mut item = MediaItem::new(0, "abc", "https://youtu.be/abc", "Song");
        assert!(!item.ready_for_transfer());
        item.converted_path = Some(PathBuf::from("/tmp/x/Song.m4a"));
        assert!(!item.ready_for_transfer());
        item.tags_attempted = true;
        assert!(item.ready_for_transfer());
        item.converted_path = Some(PathBuf::new());
        assert!(!item.ready_for_transfer());
    }

    #[test]
    fn test_track_metadata_fallbacks() {
        let mut item = MediaItem::new(0, "abc", "https://youtu.be/abc", "Song");
        item.artwork_url = Some("https://i.ytimg.com/vi/abc/hqdefault.jpg".into());
        let meta = item.track_metadata(false);
        assert_eq!(meta.artist, "Unknown Artist");
        assert_eq!(meta.album, "Unknown Artist");
        assert!(meta.artwork.is_none());

        item.artist = "Band".into();
        let meta = item.track_metadata(true);
        assert_eq!(meta.album, "Band");
        assert!(matches!(meta.artwork, Some(Artwork::Url(_))));
    }
}
