use regex::Regex;
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

const MAX_NAME_CHARS: usize = 100;
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// "Artist - Title", "Artist: Title", "Artist | Title", tried in that order.
static TITLE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"^(.+?)\s+[-\u{2013}\u{2014}]\s+(.+)$").unwrap(),
        Regex::new(r"^(.+?):\s+(.+)$").unwrap(),
        Regex::new(r"^(.+?)\s*\|\s*(.+)$").unwrap(),
    ]
});

/// Split a video title into (artist, title) if it follows a common pattern.
pub fn split_artist_title(video_title: &str) -> Option<(String, String)> {
    let trimmed = video_title.trim();
    for re in TITLE_PATTERNS.iter() {
        if let Some(caps) = re.captures(trimmed) {
            let artist = caps[1].trim();
            let title = caps[2].trim();
            if !artist.is_empty() && !title.is_empty() {
                return Some((artist.to_string(), title.to_string()));
            }
        }
    }
    None
}

/// Auto-generated YouTube Music channels are named "<Artist> - Topic".
pub fn clean_channel_name(name: &str) -> String {
    name.trim()
        .strip_suffix(" - Topic")
        .unwrap_or(name.trim())
        .trim()
        .to_string()
}

/// Make a single path component safe for FAT-formatted devices.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .nfc()
        .map(|c| {
            if INVALID_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    // a leading dot hides the file on the device
    let mut cleaned = replaced.trim().trim_matches('.').trim().to_string();

    if cleaned.chars().count() > MAX_NAME_CHARS {
        let kept: String = cleaned.chars().take(MAX_NAME_CHARS - 3).collect();
        cleaned = format!("{}...", kept.trim_end());
    }

    if cleaned.is_empty() {
        return "untitled".to_string();
    }
    cleaned
}

/// `name.ext` for n == 0, otherwise `name(n).ext`.
pub fn numbered_name(stem: &str, ext: &str, n: u32) -> String {
    match (n, ext.is_empty()) {
        (0, true) => stem.to_string(),
        (0, false) => format!("{}.{}", stem, ext),
        (_, true) => format!("{}({})", stem, n),
        (_, false) => format!("{}({}).{}", stem, n, ext),
    }
}
