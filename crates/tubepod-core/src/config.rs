//! Persistent settings in a TOML file.
//!
//! Lookup order for every option is: command-line flag, then this file, then
//! the built-in default. A missing default file is not an error; a file that
//! does not parse is.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::media::{AudioFormat, Resolution, DEFAULT_QUALITY, SUPPORTED_QUALITIES};
use crate::transfer::Layout;

pub const CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub general: GeneralSettings,
    pub video: VideoSettings,
    pub metadata: MetadataSettings,
    pub transfer: TransferSettings,
    pub advanced: AdvancedSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneralSettings {
    pub format: AudioFormat,
    pub quality: u32,
    pub layout: Layout,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            quality: DEFAULT_QUALITY,
            layout: Layout::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VideoSettings {
    pub enabled: bool,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetadataSettings {
    pub embed_artwork: bool,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self { embed_artwork: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferSettings {
    pub verify: bool,
    /// Bytes to leave free on the device
    pub reserve_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdvancedSettings {
    pub work_dir: Option<PathBuf>,
    pub jobs: usize,
    pub retries: u32,
    pub ytdlp_path: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            work_dir: None,
            jobs: 1,
            retries: 0,
            ytdlp_path: None,
            ffmpeg_path: None,
        }
    }
}

impl Settings {
    /// `<config dir>/tubepod/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tubepod").join(CONFIG_FILENAME))
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// An explicitly named file must exist; the default one is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(Error::Config(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let settings = Self::from_toml_str(&text).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(settings)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(text).map_err(|e| Error::Config(e.message().to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_QUALITIES.contains(&self.general.quality) {
            return Err(Error::Config(format!(
                "general.quality = {} is not one of 128, 192, 256, 320",
                self.general.quality
            )));
        }
        if self.advanced.jobs == 0 {
            return Err(Error::Config("advanced.jobs must be at least 1".into()));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }
}
