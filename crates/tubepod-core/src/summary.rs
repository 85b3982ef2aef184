use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, ErrorKind, Stage};
use crate::media::MediaItem;

/// Outcome for one item.
#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    pub index: usize,
    pub id: String,
    pub title: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl TransferResult {
    pub fn succeeded(item: &MediaItem, destination: PathBuf, elapsed_ms: u64) -> Self {
        Self {
            index: item.index,
            id: item.id.clone(),
            title: item.display_name().to_string(),
            success: true,
            destination: Some(destination),
            failed_stage: None,
            error_kind: None,
            error: None,
            elapsed_ms,
        }
    }

    pub fn failed(item: &MediaItem, stage: Stage, error: &Error, elapsed_ms: u64) -> Self {
        Self {
            index: item.index,
            id: item.id.clone(),
            title: item.display_name().to_string(),
            success: false,
            destination: None,
            failed_stage: Some(stage),
            error_kind: Some(error.kind()),
            error: Some(error.to_string()),
            elapsed_ms,
        }
    }
}

impl fmt::Display for TransferResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.success {
            write!(f, "ok      {}", self.title)?;
            if let Some(dest) = &self.destination {
                write!(f, " -> {}", dest.display())?;
            }
            Ok(())
        } else {
            write!(
                f,
                "FAILED  {} ({}: {})",
                self.title,
                self.failed_stage.map(Stage::as_str).unwrap_or("?"),
                self.error.as_deref().unwrap_or("unknown error")
            )
        }
    }
}

/// Everything a run produced, results in listing order.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub url: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<TransferResult>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }

    /// 0 when every item made it to the device, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.all_succeeded() {
            0
        } else {
            1
        }
    }

    pub fn write_report(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in &self.results {
            writeln!(f, "{}", r)?;
        }
        let secs = (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        write!(
            f,
            "{} item(s): {} transferred, {} failed in {:.1}s",
            self.results.len(),
            self.succeeded(),
            self.failed(),
            secs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn summary() -> RunSummary {
        let a = MediaItem::new(0, "aaa", "https://youtu.be/aaa", "First");
        let b = MediaItem::new(1, "bbb", "https://youtu.be/bbb", "");
        let now = Utc::now();
        RunSummary {
            url: "https://www.youtube.com/playlist?list=PL1".into(),
            started_at: now,
            finished_at: now,
            results: vec![
                TransferResult::succeeded(&a, PathBuf::from("/mnt/ipod/First.m4a"), 10),
                TransferResult::failed(&b, Stage::Fetch, &Error::Resolution("Private video".into()), 3),
            ],
        }
    }

    #[test]
    fn test_counts_and_exit_code() {
        let s = summary();
        assert_eq!(s.succeeded(), 1);
        assert_eq!(s.failed(), 1);
        assert_eq!(s.exit_code(), 1);

        let mut ok = summary();
        ok.results.truncate(1);
        assert_eq!(ok.exit_code(), 0);
    }

    #[test]
    fn test_display_lines() {
        let text = summary().to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ok      First -> /mnt/ipod/First.m4a");
        assert_eq!(lines[1], "FAILED  bbb (fetch: cannot resolve media: Private video)");
        assert!(lines[2].starts_with("2 item(s): 1 transferred, 1 failed"));
    }

    #[test]
    fn test_write_report() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reports").join("run.json");
        summary().write_report(&path).unwrap();

        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["results"][1]["failed_stage"], "fetch");
        assert_eq!(value["results"][1]["error_kind"], "resolution");
        assert!(value["results"][0].get("error").is_none());
    }
}
