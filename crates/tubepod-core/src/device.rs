use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};

/// Directory the artist/album layout writes under.
pub const MUSIC_DIR: &str = "Music";

const MUSIC_EXTENSIONS: [&str; 4] = ["m4a", "mp3", "aac", "mp4"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskSpace {
    pub total: u64,
    pub available: u64,
}

/// Filesystem capacity for `path`; `None` where the platform offers no query.
pub fn disk_space(path: &Path) -> std::io::Result<Option<DiskSpace>> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is NUL-terminated and outlives the call; stat is only
        // read after statvfs reports success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            let frsize = stat.f_frsize as u64;
            Ok(Some(DiskSpace {
                total: (stat.f_blocks as u64).saturating_mul(frsize),
                available: (stat.f_bavail as u64).saturating_mul(frsize),
            }))
        }
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(None)
    }
}

pub fn is_music_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| MUSIC_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Snapshot of the destination, logged at the start of a run.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub root: PathBuf,
    pub space: Option<DiskSpace>,
    pub has_music_dir: bool,
    pub music_files: usize,
}

impl DeviceInfo {
    pub fn probe(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::transfer(root, "destination root is not a directory"));
        }
        let space = disk_space(root).map_err(|e| Error::transfer(root, e.to_string()))?;
        let music_dir = root.join(MUSIC_DIR);
        let has_music_dir = music_dir.is_dir();

        let mut music_files = count_music_files(root, false);
        if has_music_dir {
            music_files += count_music_files(&music_dir, true);
        }

        Ok(Self {
            root: root.to_path_buf(),
            space,
            has_music_dir,
            music_files,
        })
    }
}

fn count_music_files(dir: &Path, recursive: bool) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            match entry.file_type() {
                Ok(t) if t.is_dir() && recursive => count_music_files(&path, true),
                Ok(t) if t.is_file() && is_music_file(&path) => 1,
                _ => 0,
            }
        })
        .sum()
}

fn gib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root.display())?;
        if let Some(space) = self.space {
            write!(
                f,
                ": {:.1} GiB free of {:.1} GiB",
                gib(space.available),
                gib(space.total)
            )?;
        }
        write!(f, ", {} music file(s)", self.music_files)
    }
}
