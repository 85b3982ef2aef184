use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use super::info::{apply_info, items_from_listing, VideoInfo};
use super::Fetcher;
use crate::error::{Error, Result};
use crate::media::{MediaItem, MediaRequest};
use crate::tools::{Tool, ToolOutput};

/// Stem used when an item has no extractor id.
const FALLBACK_STEM: &str = "source";

/// Extensions yt-dlp leaves behind for unfinished work.
const INCOMPLETE_EXTENSIONS: [&str; 4] = ["part", "ytdl", "temp", "tmp"];

static UNAVAILABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(private video|video unavailable|this video is not available|has been removed|account associated with this video has been terminated|is not a valid url|unsupported url|incomplete youtube id|http error 404|sign in to confirm|members-only|not available in your country|does not exist|playlist type is unviewable)",
    )
    .unwrap()
});

static NETWORK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(unable to download (webpage|api page)|getaddrinfo failed|name or service not known|temporary failure in name resolution|nodename nor servname|connection refused|connection reset|network is unreachable|timed out|http error 5\d\d|http error 429|remote end closed connection|ssl: )",
    )
    .unwrap()
});

/// Drives the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    tool: Tool,
}

impl YtDlpFetcher {
    pub fn new(tool: Tool) -> Self {
        Self { tool }
    }

    pub fn locate(configured: Option<&Path>) -> Result<Self> {
        Ok(Self::new(Tool::locate("yt-dlp", configured)?))
    }

    pub fn tool(&self) -> &Tool {
        &self.tool
    }

    fn invoke(&self, args: Vec<String>) -> Result<ToolOutput> {
        let out = self.tool.run(&args).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ToolNotFound(self.tool.path().display().to_string())
            } else {
                Error::Io(e)
            }
        })?;
        if out.success {
            Ok(out)
        } else {
            Err(classify_failure(&out))
        }
    }
}

impl Fetcher for YtDlpFetcher {
    fn resolve(&self, request: &MediaRequest) -> Result<Vec<MediaItem>> {
        let out = self.invoke(resolve_args(request))?;
        let info: VideoInfo = serde_json::from_str(out.stdout.trim())
            .map_err(|e| Error::Resolution(format!("unexpected yt-dlp output: {}", e)))?;
        let items = items_from_listing(&info, request.url());
        if info.is_playlist() {
            info!(
                "Playlist \"{}\" lists {} item(s)",
                info.title.as_deref().unwrap_or(""),
                items.len()
            );
        } else {
            debug!("Resolved single video {}", request.url());
        }
        Ok(items)
    }

    fn fetch(&self, item: &mut MediaItem, dir: &Path, request: &MediaRequest) -> Result<PathBuf> {
        if item.url.is_empty() {
            return Err(Error::Resolution(format!(
                "playlist entry {} is unavailable",
                item.index + 1
            )));
        }
        let stem = download_stem(item);
        let out = self.invoke(download_args(&item.url, dir, &stem, request))?;

        // --print-json emits one JSON object per downloaded video.
        if let Some(info) = out
            .stdout
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str::<VideoInfo>(line.trim()).ok())
        {
            apply_info(item, &info);
        }

        let path = find_download(dir, &stem)?;
        debug!("Downloaded {} to {}", item.display_name(), path.display());
        Ok(path)
    }
}

/// Listing only: entries of a playlist are not probed individually.
pub fn resolve_args(request: &MediaRequest) -> Vec<String> {
    let playlist_flag = if request.is_playlist() {
        "--yes-playlist"
    } else {
        "--no-playlist"
    };
    vec![
        "--flat-playlist".into(),
        "--dump-single-json".into(),
        "--no-warnings".into(),
        playlist_flag.into(),
        request.url().into(),
    ]
}

/// Format selector: best audio, or best video capped at the target height.
pub fn format_selector(request: &MediaRequest) -> String {
    if request.video() {
        let h = request.resolution().height;
        format!("bestvideo[height<={h}]+bestaudio/best[height<={h}]")
    } else {
        "bestaudio/best".to_string()
    }
}

pub fn download_args(url: &str, dir: &Path, stem: &str, request: &MediaRequest) -> Vec<String> {
    let template = dir.join(format!("{}.%(ext)s", stem));
    vec![
        "-f".into(),
        format_selector(request),
        "--no-playlist".into(),
        "--no-progress".into(),
        "--no-warnings".into(),
        "--print-json".into(),
        "-o".into(),
        template.to_string_lossy().into_owned(),
        url.into(),
    ]
}

fn download_stem(item: &MediaItem) -> String {
    let safe = item
        .id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if item.id.is_empty() || !safe {
        FALLBACK_STEM.to_string()
    } else {
        item.id.clone()
    }
}

/// Locate the finished file yt-dlp wrote for `stem`, ignoring partial downloads.
fn find_download(dir: &Path, stem: &str) -> Result<PathBuf> {
    let mut best: Option<(u64, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        if path.file_stem().and_then(|s| s.to_str()) != Some(stem) {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if INCOMPLETE_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }
        let size = entry.metadata()?.len();
        if best.as_ref().map_or(true, |(s, _)| size > *s) {
            best = Some((size, path));
        }
    }
    best.map(|(_, p)| p).ok_or_else(|| {
        Error::Resolution(format!(
            "yt-dlp finished but no file named {}.* appeared in {}",
            stem,
            dir.display()
        ))
    })
}

/// Map a failed yt-dlp run to Network or Resolution.
pub fn classify_failure(out: &ToolOutput) -> Error {
    let detail = out
        .stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with("ERROR:"))
        .map(|l| l.trim_start_matches("ERROR:").trim().to_string())
        .unwrap_or_else(|| out.stderr_tail(3));
    let detail = if detail.is_empty() {
        format!("yt-dlp exited with status {:?}", out.code)
    } else {
        detail
    };

    if UNAVAILABLE_RE.is_match(&out.stderr) {
        Error::Resolution(detail)
    } else if NETWORK_RE.is_match(&out.stderr) {
        Error::Network(detail)
    } else {
        Error::Resolution(detail)
    }
}
