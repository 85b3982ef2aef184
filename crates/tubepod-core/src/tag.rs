//! Tag writing and reading through lofty.
//!
//! MP4 containers (m4a/mp4/m4v/aac) get an `ilst` atom, MP3 files get ID3v2.
//! Artwork is best-effort: a thumbnail that cannot be fetched or decoded is
//! logged and skipped, the text fields are still written.

use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use lofty::config::WriteOptions;
use lofty::picture::{Picture, PictureType};
use lofty::prelude::*;
use lofty::probe::Probe;
use lofty::tag::{Tag, TagType};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const ARTWORK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artwork {
    Bytes(Vec<u8>),
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub track_number: Option<u32>,
    pub artwork: Option<Artwork>,
}

/// Writes a metadata record into a converted file, in place.
pub trait Tagger: Send + Sync {
    fn write_tags(&self, path: &Path, metadata: &TrackMetadata) -> Result<()>;
}

pub struct LoftyTagger {
    client: Option<reqwest::blocking::Client>,
}

impl Default for LoftyTagger {
    fn default() -> Self {
        Self::new()
    }
}

impl LoftyTagger {
    pub fn new() -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(ARTWORK_TIMEOUT)
            .user_agent(concat!("tubepod/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| warn!("artwork downloads disabled: {}", e))
            .ok();
        Self { client }
    }

    /// Tagger that never touches the network; URL artwork is skipped.
    pub fn offline() -> Self {
        Self { client: None }
    }

    fn artwork_bytes(&self, artwork: &Artwork) -> Option<Vec<u8>> {
        match artwork {
            Artwork::Bytes(bytes) => Some(bytes.clone()),
            Artwork::Url(url) => {
                let client = self.client.as_ref()?;
                debug!("Fetching artwork {}", url);
                let fetched = client
                    .get(url)
                    .send()
                    .and_then(|r| r.error_for_status())
                    .and_then(|r| r.bytes());
                match fetched {
                    Ok(bytes) => Some(bytes.to_vec()),
                    Err(e) => {
                        warn!("Failed to download artwork {}: {}", url, e);
                        None
                    }
                }
            }
        }
    }
}

impl Tagger for LoftyTagger {
    fn write_tags(&self, path: &Path, metadata: &TrackMetadata) -> Result<()> {
        let tag_type = tag_type_for(path)?;
        let tag_err = |message: String| Error::TagWrite {
            path: path.to_path_buf(),
            message,
        };

        // Make sure the file parses before we start rewriting it.
        Probe::open(path)
            .and_then(|p| p.read())
            .map_err(|e| tag_err(e.to_string()))?;

        let mut tag = Tag::new(tag_type);
        tag.set_title(metadata.title.clone());
        tag.set_artist(metadata.artist.clone());
        tag.set_album(metadata.album.clone());
        if let Some(n) = metadata.track_number {
            tag.set_track(n);
        }

        if let Some(artwork) = &metadata.artwork {
            if let Some(bytes) = self.artwork_bytes(artwork) {
                match Picture::from_reader(&mut Cursor::new(bytes)) {
                    Ok(mut picture) => {
                        picture.set_pic_type(PictureType::CoverFront);
                        tag.push_picture(picture);
                    }
                    Err(e) => warn!("Skipping artwork for {}: {}", path.display(), e),
                }
            }
        }

        tag.save_to_path(path, WriteOptions::default())
            .map_err(|e| tag_err(e.to_string()))?;
        debug!("Tagged {}", path.display());
        Ok(())
    }
}

/// Read back the fields written by [`Tagger::write_tags`].
pub fn read_tags(path: &Path) -> Result<TrackMetadata> {
    let read_err = |message: String| Error::TagRead {
        path: path.to_path_buf(),
        message,
    };
    let tagged_file = Probe::open(path)
        .and_then(|p| p.read())
        .map_err(|e| read_err(e.to_string()))?;
    let tag = tagged_file
        .primary_tag()
        .or_else(|| tagged_file.first_tag())
        .ok_or_else(|| read_err("file has no tags".to_string()))?;

    Ok(TrackMetadata {
        title: tag.title().map(|s| s.to_string()).unwrap_or_default(),
        artist: tag.artist().map(|s| s.to_string()).unwrap_or_default(),
        album: tag.album().map(|s| s.to_string()).unwrap_or_default(),
        track_number: tag.track(),
        artwork: tag
            .pictures()
            .first()
            .map(|p| Artwork::Bytes(p.data().to_vec())),
    })
}

fn tag_type_for(path: &Path) -> Result<TagType> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "m4a" | "mp4" | "m4v" | "aac" => Ok(TagType::Mp4Ilst),
        "mp3" => Ok(TagType::Id3v2),
        _ => Err(Error::TagWrite {
            path: path.to_path_buf(),
            message: format!("unsupported file format `{}`", ext),
        }),
    }
}
