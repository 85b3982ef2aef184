use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::media::{MediaItem, MediaRequest};
use crate::naming::{numbered_name, sanitize_filename};
use crate::tools::Tool;

const VIDEO_BITRATE: &str = "1500k";

pub trait Converter: Send + Sync {
    /// Transcode `input` into `output_dir`, returning the new file.
    fn convert(
        &self,
        input: &Path,
        output_dir: &Path,
        request: &MediaRequest,
        item: &MediaItem,
    ) -> Result<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct FfmpegConverter {
    tool: Tool,
    delete_source: bool,
}

impl FfmpegConverter {
    pub fn new(tool: Tool) -> Self {
        Self {
            tool,
            delete_source: false,
        }
    }

    /// Find ffmpeg and make sure it actually runs.
    pub fn locate(configured: Option<&Path>) -> Result<Self> {
        let tool = Tool::locate("ffmpeg", configured)?;
        match tool.run(["-hide_banner", "-version"]) {
            Ok(out) if out.success => Ok(Self::new(tool)),
            _ => Err(Error::ToolNotFound(format!(
                "ffmpeg at {} does not run",
                tool.path().display()
            ))),
        }
    }

    pub fn with_delete_source(mut self, delete_source: bool) -> Self {
        self.delete_source = delete_source;
        self
    }
}

/// Target path for an item: `<sanitized title>.<ext>`, never the input itself.
pub fn output_path(input: &Path, output_dir: &Path, request: &MediaRequest, item: &MediaItem) -> PathBuf {
    let stem = sanitize_filename(item.display_name());
    let ext = request.extension();
    let mut n = 0;
    loop {
        let candidate = output_dir.join(numbered_name(&stem, ext, n));
        if candidate != input {
            return candidate;
        }
        n += 1;
    }
}

pub fn build_args(input: &Path, output: &Path, request: &MediaRequest) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-nostdin".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-i".into(),
        input.to_string_lossy().into_owned(),
        "-map_metadata".into(),
        "-1".into(),
    ];
    let bitrate = format!("{}k", request.quality());

    if request.video() {
        let res = request.resolution();
        let scale = format!("scale={}:{}", res.width, res.height);
        args.extend(
            [
                "-c:v",
                "libx264",
                "-profile:v",
                "baseline",
                "-level",
                "3.0",
                "-vf",
                scale.as_str(),
                "-b:v",
                VIDEO_BITRATE,
                "-pix_fmt",
                "yuv420p",
                "-c:a",
                "aac",
                "-b:a",
                bitrate.as_str(),
                "-ac",
                "2",
                "-movflags",
                "+faststart",
            ]
            .map(String::from),
        );
    } else {
        args.extend(["-vn", "-c:a", request.format().codec(), "-b:a", bitrate.as_str()].map(String::from));
    }

    args.push(output.to_string_lossy().into_owned());
    args
}

impl Converter for FfmpegConverter {
    fn convert(
        &self,
        input: &Path,
        output_dir: &Path,
        request: &MediaRequest,
        item: &MediaItem,
    ) -> Result<PathBuf> {
        if !input.is_file() {
            return Err(Error::Conversion(format!(
                "input {} does not exist",
                input.display()
            )));
        }
        let output = output_path(input, output_dir, request, item);
        let out = self
            .tool
            .run(build_args(input, &output, request))
            .map_err(|e| Error::Conversion(format!("cannot start {}: {}", self.tool.path().display(), e)))?;

        if !out.success {
            // Don't leave a truncated output behind.
            let _ = std::fs::remove_file(&output);
            let tail = out.stderr_tail(5);
            return Err(Error::Conversion(if tail.is_empty() {
                format!("ffmpeg exited with status {:?}", out.code)
            } else {
                tail
            }));
        }
        if !output.is_file() {
            return Err(Error::Conversion(format!(
                "ffmpeg produced no output at {}",
                output.display()
            )));
        }

        if self.delete_source {
            if let Err(e) = std::fs::remove_file(input) {
                warn!("Could not delete {}: {}", input.display(), e);
            }
        }
        debug!("Converted {} -> {}", input.display(), output.display());
        Ok(output)
    }
}
