use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{Error, Result};

/// An external executable resolved to an absolute path.
#[derive(Debug, Clone)]
pub struct Tool {
    name: &'static str,
    path: PathBuf,
}

/// Captured result of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub code: Option<i32>,
}

impl ToolOutput {
    /// Last `lines` non-empty lines of stderr, for error messages.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let kept: Vec<&str> = self
            .stderr
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let start = kept.len().saturating_sub(lines);
        kept[start..].join("\n")
    }
}

impl Tool {
    pub fn new(name: &'static str, path: PathBuf) -> Self {
        Self { name, path }
    }

    /// Resolve `name`, preferring an explicitly configured path.
    ///
    /// A configured value may be a full path or a bare program name; both
    /// go through `which` so the result is always an existing executable.
    pub fn locate(name: &'static str, configured: Option<&Path>) -> Result<Self> {
        let wanted: &OsStr = configured.map(Path::as_os_str).unwrap_or(OsStr::new(name));
        let path = which::which(wanted).map_err(|_| {
            Error::ToolNotFound(match configured {
                Some(p) => format!("{} (configured as {})", name, p.display()),
                None => name.to_string(),
            })
        })?;
        debug!("Using {} at {}", name, path.display());
        Ok(Self::new(name, path))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run to completion with stdout/stderr captured and stdin closed.
    pub fn run<I, S>(&self, args: I) -> std::io::Result<ToolOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.path);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!("Running {:?}", cmd);

        let output = cmd.output()?;
        Ok(ToolOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}
