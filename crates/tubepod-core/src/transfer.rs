use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::device::{disk_space, MUSIC_DIR};
use crate::error::{Error, Result};
use crate::media::MediaItem;
use crate::naming::{numbered_name, sanitize_filename};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    /// Files directly under the destination root
    #[default]
    Flat,
    /// `Music/<artist>/<album>/` under the destination root
    ArtistAlbum,
}

pub trait Transporter: Send + Sync {
    /// Copy `source` for `item` under the destination root, returning where it landed.
    fn transfer(&self, source: &Path, item: &MediaItem) -> Result<PathBuf>;
}

pub struct FsTransporter {
    root: PathBuf,
    layout: Layout,
    verify: bool,
    reserve: u64,
    /// Names handed out but possibly not yet on disk.
    claimed: Mutex<HashSet<PathBuf>>,
}

impl FsTransporter {
    pub fn new(root: impl Into<PathBuf>, layout: Layout) -> Self {
        Self {
            root: root.into(),
            layout,
            verify: false,
            reserve: 0,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// Compare SHA-256 of source and copy before committing.
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Bytes that must stay free on the device after the copy.
    pub fn with_reserve(mut self, reserve: u64) -> Self {
        self.reserve = reserve;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn destination_dir(&self, item: &MediaItem) -> PathBuf {
        match self.layout {
            Layout::Flat => self.root.clone(),
            Layout::ArtistAlbum => {
                let meta = item.track_metadata(false);
                self.root
                    .join(MUSIC_DIR)
                    .join(sanitize_filename(&meta.artist))
                    .join(sanitize_filename(&meta.album))
            }
        }
    }

    /// Album layout keeps playlist order with a `NN - ` prefix.
    pub fn destination_name(&self, file_name: &str, item: &MediaItem) -> String {
        match (self.layout, item.track_number) {
            (Layout::ArtistAlbum, Some(n)) if item.playlist_title.is_some() => {
                format!("{:02} - {}", n, file_name)
            }
            _ => file_name.to_string(),
        }
    }

    fn ensure_within_root(&self, path: &Path) -> Result<()> {
        let inside = path
            .strip_prefix(&self.root)
            .map(|rel| rel.components().all(|c| matches!(c, Component::Normal(_))))
            .unwrap_or(false);
        if inside {
            Ok(())
        } else {
            Err(Error::transfer(path, "destination escapes the device root"))
        }
    }

    fn check_writable(dir: &Path) -> Result<()> {
        tempfile::Builder::new()
            .prefix(".tubepod-probe")
            .tempfile_in(dir)
            .map(drop)
            .map_err(|e| Error::transfer(dir, format!("destination is not writable: {}", e)))
    }

    fn check_space(&self, dir: &Path, size: u64) -> Result<()> {
        let Some(space) = disk_space(dir).map_err(|e| Error::transfer(dir, e.to_string()))? else {
            return Ok(());
        };
        let needed = size.saturating_add(self.reserve);
        if space.available < needed {
            return Err(Error::transfer(
                dir,
                format!(
                    "insufficient space: need {} bytes, {} available",
                    needed, space.available
                ),
            ));
        }
        Ok(())
    }

    /// Pick the destination name, treating an identical file as already there.
    fn claim(&self, dir: &Path, file_name: &str, source: &Path, size: u64) -> Result<Claim> {
        let as_path = Path::new(file_name);
        let stem = as_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("file");
        let ext = as_path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let mut source_hash: Option<String> = None;
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        let mut n = 0;
        loop {
            let candidate = dir.join(numbered_name(stem, ext, n));
            n += 1;
            if claimed.contains(&candidate) {
                continue;
            }
            match fs::metadata(&candidate) {
                Ok(meta) if meta.is_file() && meta.len() == size => {
                    let expected = match &source_hash {
                        Some(h) => h.clone(),
                        None => {
                            let h = sha256_file(source)
                                .map_err(|e| Error::transfer(source, e.to_string()))?;
                            source_hash = Some(h.clone());
                            h
                        }
                    };
                    match sha256_file(&candidate) {
                        Ok(existing) if existing == expected => {
                            return Ok(Claim::Existing(candidate))
                        }
                        _ => continue,
                    }
                }
                Ok(_) => continue,
                Err(_) => {
                    claimed.insert(candidate.clone());
                    return Ok(Claim::Fresh(candidate));
                }
            }
        }
    }

    fn release(&self, path: &Path) {
        self.claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }

    fn copy_into_place(&self, source: &Path, dest: &Path) -> Result<()> {
        let file_name = dest
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file");
        let part = PartFile::new(dest.with_file_name(format!(".{}.part", file_name)));
        let fail = |e: io::Error| Error::transfer(dest, e.to_string());

        let source_meta = fs::metadata(source).map_err(fail)?;
        {
            let mut reader = File::open(source).map_err(fail)?;
            let mut writer = BufWriter::new(File::create(part.path()).map_err(fail)?);
            io::copy(&mut reader, &mut writer).map_err(fail)?;
            let file = writer.into_inner().map_err(|e| fail(e.into_error()))?;
            file.sync_all().map_err(fail)?;
        }

        if self.verify {
            let expected = sha256_file(source).map_err(fail)?;
            let actual = sha256_file(part.path()).map_err(fail)?;
            if expected != actual {
                return Err(Error::transfer(dest, "checksum mismatch after copy"));
            }
            debug!("Verified {} ({})", dest.display(), actual);
        }

        let mtime = filetime::FileTime::from_last_modification_time(&source_meta);
        filetime::set_file_mtime(part.path(), mtime).ok();

        fs::rename(part.path(), dest).map_err(fail)?;
        part.commit();
        Ok(())
    }
}

impl Transporter for FsTransporter {
    fn transfer(&self, source: &Path, item: &MediaItem) -> Result<PathBuf> {
        if !item.ready_for_transfer() {
            return Err(Error::transfer(
                source,
                "item has not been converted and tagged",
            ));
        }
        if !self.root.is_dir() {
            return Err(Error::transfer(&self.root, "destination root does not exist"));
        }
        let size = fs::metadata(source)
            .map_err(|e| Error::transfer(source, e.to_string()))?
            .len();
        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| self.destination_name(n, item))
            .ok_or_else(|| Error::transfer(source, "source has no file name"))?;

        let dir = self.destination_dir(item);
        self.ensure_within_root(&dir.join(&file_name))?;
        fs::create_dir_all(&dir).map_err(|e| Error::transfer(&dir, e.to_string()))?;
        Self::check_writable(&dir)?;
        self.check_space(&dir, size)?;

        let dest = match self.claim(&dir, &file_name, source, size)? {
            Claim::Fresh(dest) => dest,
            Claim::Existing(existing) => {
                info!("{} already on device, skipping copy", existing.display());
                return Ok(existing);
            }
        };

        let result = self.copy_into_place(source, &dest);
        self.release(&dest);
        result?;
        debug!("Copied {} -> {}", source.display(), dest.display());
        Ok(dest)
    }
}

enum Claim {
    Fresh(PathBuf),
    Existing(PathBuf),
}

/// Removes the partial file on drop unless committed.
struct PartFile {
    path: PathBuf,
    committed: bool,
}

impl PartFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut file = File::open(path)?;
    io::copy(&mut file, &mut hasher)?;
    hasher.flush()?;
    Ok(hex::encode(hasher.finalize()))
}
