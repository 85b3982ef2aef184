use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stage an item was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Resolve,
    Fetch,
    Convert,
    Tag,
    Transfer,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Resolve => "resolve",
            Stage::Fetch => "fetch",
            Stage::Convert => "convert",
            Stage::Tag => "tag",
            Stage::Transfer => "transfer",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// The source could not be reached (DNS, connection, timeout, 5xx).
    #[error("network error: {0}")]
    Network(String),

    /// The URL does not point at retrievable media (private, removed, invalid id).
    #[error("cannot resolve media: {0}")]
    Resolution(String),

    /// Transcoder exited non-zero or could not be started.
    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("cannot write tags to {}: {message}", path.display())]
    TagWrite { path: PathBuf, message: String },

    #[error("cannot read tags from {}: {message}", path.display())]
    TagRead { path: PathBuf, message: String },

    /// Destination I/O: no space, unwritable, outside the device root.
    #[error("transfer to {} failed: {message}", path.display())]
    Transfer { path: PathBuf, message: String },

    #[error("required tool `{0}` not found on PATH")]
    ToolNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serializable discriminant of [`Error`], recorded in per-item results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Resolution,
    Conversion,
    TagWrite,
    TagRead,
    Transfer,
    ToolNotFound,
    Config,
    InvalidRequest,
    Cancelled,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Network(_) => ErrorKind::Network,
            Error::Resolution(_) => ErrorKind::Resolution,
            Error::Conversion(_) => ErrorKind::Conversion,
            Error::TagWrite { .. } => ErrorKind::TagWrite,
            Error::TagRead { .. } => ErrorKind::TagRead,
            Error::Transfer { .. } => ErrorKind::Transfer,
            Error::ToolNotFound(_) => ErrorKind::ToolNotFound,
            Error::Config(_) => ErrorKind::Config,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Only network failures are worth re-running a stage for.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    /// Errors that make the whole run impossible, as opposed to failing one item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ToolNotFound(_) | Error::Config(_) | Error::InvalidRequest(_)
        )
    }

    pub(crate) fn transfer(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::Transfer {
            path: path.into(),
            message: message.into(),
        }
    }
}
