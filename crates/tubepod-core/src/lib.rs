pub mod cancel;
pub mod config;
pub mod convert;
pub mod device;
pub mod error;
pub mod fetch;
pub mod media;
pub mod naming;
pub mod pipeline;
pub mod summary;
pub mod tag;
pub mod tools;
pub mod transfer;

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub use cancel::CancellationToken;
pub use config::Settings;
pub use convert::{Converter, FfmpegConverter};
pub use device::DeviceInfo;
pub use error::{Error, ErrorKind, Result, Stage};
pub use fetch::{Fetcher, YtDlpFetcher};
pub use media::{AudioFormat, MediaItem, MediaRequest, Resolution};
pub use pipeline::{run, run_with_control, PipelineOptions, RunControl, Stages};
pub use summary::{RunSummary, TransferResult};
pub use tag::{LoftyTagger, Tagger, TrackMetadata};
pub use transfer::{FsTransporter, Layout, Transporter};

/// Type alias for progress callback
pub type ProgressCallback = dyn Fn(&str, u64, u64, &str) + Send + Sync;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Throttled progress reporter: emits at most every 200ms or on completion.
pub struct ThrottledProgress<'a> {
    inner: &'a ProgressCallback,
    last_emit: Mutex<Instant>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(inner: &'a ProgressCallback) -> Self {
        let start = Instant::now()
            .checked_sub(Duration::from_secs(1))
            .unwrap_or_else(Instant::now);
        Self {
            inner,
            last_emit: Mutex::new(start),
        }
    }

    pub fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        let is_done = current + 1 >= total;
        if !is_done {
            let mut last = self.last_emit.lock().unwrap_or_else(|e| e.into_inner());
            if last.elapsed() < PROGRESS_INTERVAL {
                return;
            }
            *last = Instant::now();
        }
        (self.inner)(stage, current, total, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_throttled_progress() {
        let calls = std::sync::Arc::new(AtomicU64::new(0));
        let cb_calls = calls.clone();
        let cb = move |_: &str, _: u64, _: u64, _: &str| {
            cb_calls.fetch_add(1, Ordering::SeqCst);
        };
        let tp = ThrottledProgress::new(&cb);
        for i in 0..100 {
            tp.report("items", i, 100, "");
        }
        // First report and the final one always go through.
        let n = calls.load(Ordering::SeqCst);
        assert!(n >= 2 && n < 100, "{} calls", n);
    }
}
