use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::convert::Converter;
use crate::error::{Error, Result, Stage};
use crate::fetch::Fetcher;
use crate::media::{MediaItem, MediaRequest};
use crate::summary::{RunSummary, TransferResult};
use crate::tag::Tagger;
use crate::transfer::Transporter;
use crate::{ProgressCallback, ThrottledProgress};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(8);

/// The four stage implementations a run uses.
#[derive(Clone, Copy)]
pub struct Stages<'a> {
    pub fetcher: &'a dyn Fetcher,
    pub converter: &'a dyn Converter,
    pub tagger: &'a dyn Tagger,
    pub transporter: &'a dyn Transporter,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Parent of the per-item scratch directories.
    pub work_dir: PathBuf,
    /// Items processed at once.
    pub jobs: usize,
    /// Extra attempts for a stage that failed with a network error.
    pub retries: u32,
    /// First retry delay; doubles per attempt.
    pub retry_delay: Duration,
    pub embed_artwork: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("tubepod"),
            jobs: 1,
            retries: 0,
            retry_delay: Duration::from_millis(500),
            embed_artwork: true,
        }
    }
}

/// Control options for a run (cancellation).
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub cancel_token: Option<CancellationToken>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    fn check(&self) -> Result<()> {
        match &self.cancel_token {
            Some(token) => token.check(),
            None => Ok(()),
        }
    }
}

/// Run the whole pipeline for one request.
pub fn run(
    request: &MediaRequest,
    stages: Stages<'_>,
    options: &PipelineOptions,
    progress: &ProgressCallback,
) -> anyhow::Result<RunSummary> {
    run_with_control(request, stages, options, &RunControl::default(), progress)
}

/// Run the whole pipeline with cancellation support.
///
/// Item failures end up in the summary; only problems that make the run
/// itself impossible (missing tools, unusable work dir) are returned as `Err`.
pub fn run_with_control(
    request: &MediaRequest,
    stages: Stages<'_>,
    options: &PipelineOptions,
    control: &RunControl,
    progress: &ProgressCallback,
) -> anyhow::Result<RunSummary> {
    let started_at = Utc::now();
    let tp = ThrottledProgress::new(progress);
    control.check()?;

    std::fs::create_dir_all(&options.work_dir)
        .with_context(|| format!("cannot create work dir {}", options.work_dir.display()))?;

    tp.report("resolve", 0, 1, request.url());
    let resolve_start = Instant::now();
    let items = match retrying(options, || stages.fetcher.resolve(request)) {
        Ok(items) => items,
        Err(e) if e.is_fatal() => {
            return Err(e).with_context(|| format!("cannot resolve {}", request.url()));
        }
        Err(e) => {
            warn!("Cannot resolve {}: {}", request.url(), e);
            let item = MediaItem::new(0, "", request.url(), "");
            return Ok(RunSummary {
                url: request.url().to_string(),
                started_at,
                finished_at: Utc::now(),
                results: vec![TransferResult::failed(
                    &item,
                    Stage::Resolve,
                    &e,
                    resolve_start.elapsed().as_millis() as u64,
                )],
            });
        }
    };
    tp.report("resolve", 1, 1, request.url());

    let total = items.len() as u64;
    if items.is_empty() {
        warn!("{} lists no items", request.url());
    } else {
        info!("Processing {} item(s) from {}", total, request.url());
    }

    let done = AtomicU64::new(0);
    let process = |item: MediaItem| -> TransferResult {
        let result = process_item(item, request, stages, options, control);
        let current = done.fetch_add(1, Ordering::Relaxed);
        tp.report("items", current, total, &result.title);
        result
    };

    let results: Vec<TransferResult> = if options.jobs <= 1 {
        items.into_iter().map(process).collect()
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.jobs)
            .build()
            .context("cannot start worker threads")?;
        // Indexed collect keeps listing order.
        pool.install(|| items.into_par_iter().map(process).collect())
    };

    Ok(RunSummary {
        url: request.url().to_string(),
        started_at,
        finished_at: Utc::now(),
        results,
    })
}

fn process_item(
    mut item: MediaItem,
    request: &MediaRequest,
    stages: Stages<'_>,
    options: &PipelineOptions,
    control: &RunControl,
) -> TransferResult {
    let start = Instant::now();
    let outcome = run_stages(&mut item, request, stages, options, control);
    let elapsed_ms = start.elapsed().as_millis() as u64;
    match outcome {
        Ok(dest) => {
            info!("Transferred {} -> {}", item.display_name(), dest.display());
            TransferResult::succeeded(&item, dest, elapsed_ms)
        }
        Err((stage, e)) => {
            warn!("{} failed during {}: {}", item.display_name(), stage, e);
            TransferResult::failed(&item, stage, &e, elapsed_ms)
        }
    }
}

fn run_stages(
    item: &mut MediaItem,
    request: &MediaRequest,
    stages: Stages<'_>,
    options: &PipelineOptions,
    control: &RunControl,
) -> std::result::Result<PathBuf, (Stage, Error)> {
    let at = |stage: Stage| move |e: Error| (stage, e);

    control.check().map_err(at(Stage::Fetch))?;
    // Removed on drop, including unwinding.
    let scratch = tempfile::Builder::new()
        .prefix("item-")
        .tempdir_in(&options.work_dir)
        .map_err(|e| (Stage::Fetch, Error::Io(e)))?;
    let dir: &Path = scratch.path();

    debug!("Fetching {} into {}", item.display_name(), dir.display());
    let downloaded = retrying(options, || stages.fetcher.fetch(item, dir, request))
        .map_err(at(Stage::Fetch))?;
    item.download_path = Some(downloaded.clone());

    control.check().map_err(at(Stage::Convert))?;
    debug!("Converting {}", item.display_name());
    let converted = stages
        .converter
        .convert(&downloaded, dir, request, item)
        .map_err(at(Stage::Convert))?;
    item.converted_path = Some(converted.clone());

    control.check().map_err(at(Stage::Tag))?;
    let metadata = item.track_metadata(options.embed_artwork);
    let tagged = stages.tagger.write_tags(&converted, &metadata);
    item.tags_attempted = true;
    tagged.map_err(at(Stage::Tag))?;

    control.check().map_err(at(Stage::Transfer))?;
    let dest = stages
        .transporter
        .transfer(&converted, item)
        .map_err(at(Stage::Transfer))?;

    if let Err(e) = scratch.close() {
        warn!("Could not remove scratch dir: {}", e);
    }
    Ok(dest)
}

/// Re-run `op` on network errors, up to `options.retries` extra times.
fn retrying<T>(options: &PipelineOptions, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if e.is_retryable() && attempt < options.retries => {
                attempt += 1;
                let delay = options
                    .retry_delay
                    .saturating_mul(1 << (attempt - 1).min(16))
                    .min(MAX_RETRY_DELAY);
                warn!("{} (retry {}/{} in {:?})", e, attempt, options.retries, delay);
                std::thread::sleep(delay);
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::media::{AudioFormat, Resolution};
    use crate::tag::TrackMetadata;
    use crate::transfer::{FsTransporter, Layout};
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Clone, Copy, PartialEq)]
    enum Entry {
        Ok,
        Private,
        FlakyOnce,
        BadStream,
    }

    struct FakeFetcher {
        entries: Vec<(&'static str, &'static str, Entry)>,
        resolve_error: Option<fn() -> Error>,
        flaky_failures: AtomicU32,
    }

    impl FakeFetcher {
        fn new(entries: Vec<(&'static str, &'static str, Entry)>) -> Self {
            Self {
                entries,
                resolve_error: None,
                flaky_failures: AtomicU32::new(0),
            }
        }
    }

    impl Fetcher for FakeFetcher {
        fn resolve(&self, _request: &MediaRequest) -> Result<Vec<MediaItem>> {
            if let Some(make) = self.resolve_error {
                return Err(make());
            }
            Ok(self
                .entries
                .iter()
                .enumerate()
                .map(|(i, (id, title, _))| {
                    let mut item = MediaItem::new(i, *id, format!("https://youtu.be/{}", id), *title);
                    item.artist = "Band".into();
                    item.track_number = Some(i as u32 + 1);
                    item
                })
                .collect())
        }

        fn fetch(&self, item: &mut MediaItem, dir: &Path, _request: &MediaRequest) -> Result<PathBuf> {
            let (_, _, behavior) = self.entries[item.index];
            match behavior {
                Entry::Private => return Err(Error::Resolution("Private video".into())),
                Entry::FlakyOnce if self.flaky_failures.fetch_add(1, Ordering::SeqCst) == 0 => {
                    return Err(Error::Network("connection reset".into()))
                }
                _ => {}
            }
            let path = dir.join(format!("{}.webm", item.id));
            std::fs::write(&path, format!("stream of {}", item.id))?;
            Ok(path)
        }
    }

    struct FakeConverter;

    impl Converter for FakeConverter {
        fn convert(&self, input: &Path, output_dir: &Path, request: &MediaRequest, item: &MediaItem) -> Result<PathBuf> {
            let bytes = std::fs::read(input)?;
            if bytes.ends_with(b"bad") {
                return Err(Error::Conversion("Invalid data found when processing input".into()));
            }
            let out = crate::convert::output_path(input, output_dir, request, item);
            std::fs::write(&out, bytes)?;
            Ok(out)
        }
    }

    #[derive(Default)]
    struct RecordingTagger {
        seen: Mutex<Vec<TrackMetadata>>,
    }

    impl Tagger for RecordingTagger {
        fn write_tags(&self, _path: &Path, metadata: &TrackMetadata) -> Result<()> {
            self.seen.lock().unwrap().push(metadata.clone());
            Ok(())
        }
    }

    fn request(url: &str) -> MediaRequest {
        MediaRequest::new(url, AudioFormat::M4a, 256, false, Resolution::default()).unwrap()
    }

    fn options(work: &Path) -> PipelineOptions {
        PipelineOptions {
            work_dir: work.to_path_buf(),
            retry_delay: Duration::ZERO,
            ..PipelineOptions::default()
        }
    }

    fn noop(_: &str, _: u64, _: u64, _: &str) {}

    struct Harness {
        work: tempfile::TempDir,
        device: tempfile::TempDir,
        tagger: RecordingTagger,
        transporter: FsTransporter,
    }

    impl Harness {
        fn new() -> Self {
            let device = tempdir().unwrap();
            let transporter = FsTransporter::new(device.path(), Layout::Flat);
            Self {
                work: tempdir().unwrap(),
                device,
                tagger: RecordingTagger::default(),
                transporter,
            }
        }

        fn stages<'a>(&'a self, fetcher: &'a FakeFetcher) -> Stages<'a> {
            Stages {
                fetcher,
                converter: &FakeConverter,
                tagger: &self.tagger,
                transporter: &self.transporter,
            }
        }

        fn scratch_left(&self) -> usize {
            std::fs::read_dir(self.work.path()).unwrap().count()
        }
    }

    #[test]
    fn test_single_video() {
        let h = Harness::new();
        let fetcher = FakeFetcher::new(vec![("dQw4w9WgXcQ", "Never Gonna Give You Up", Entry::Ok)]);
        let summary = run(
            &request("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            h.stages(&fetcher),
            &options(h.work.path()),
            &noop,
        )
        .unwrap();

        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.exit_code(), 0);
        let dest = h.device.path().join("Never Gonna Give You Up.m4a");
        assert_eq!(summary.results[0].destination.as_deref(), Some(dest.as_path()));
        assert!(dest.exists());
        assert_eq!(h.tagger.seen.lock().unwrap()[0].title, "Never Gonna Give You Up");
        assert_eq!(h.scratch_left(), 0);
    }

    #[test]
    fn test_playlist_with_private_entry() {
        let h = Harness::new();
        let fetcher = FakeFetcher::new(vec![
            ("aaa", "One", Entry::Ok),
            ("bbb", "[Private video]", Entry::Private),
            ("ccc", "Three", Entry::Ok),
        ]);
        let summary = run(
            &request("https://www.youtube.com/playlist?list=PL1"),
            h.stages(&fetcher),
            &options(h.work.path()),
            &noop,
        )
        .unwrap();

        assert_eq!(summary.results.len(), 3);
        assert_eq!(
            summary.results.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["aaa", "bbb", "ccc"]
        );
        assert_eq!(summary.succeeded(), 2);
        let failed = &summary.results[1];
        assert_eq!(failed.failed_stage, Some(Stage::Fetch));
        assert_eq!(failed.error_kind, Some(ErrorKind::Resolution));
        assert_ne!(summary.exit_code(), 0);
        assert_eq!(h.scratch_left(), 0);
    }

    #[test]
    fn test_conversion_error_does_not_stop_later_items() {
        let h = Harness::new();
        let fetcher = FakeFetcher::new(vec![
            ("aaa", "One", Entry::Ok),
            ("bad", "Two", Entry::BadStream),
            ("ccc", "Three", Entry::Ok),
        ]);
        let summary = run(
            &request("https://www.youtube.com/playlist?list=PL1"),
            h.stages(&fetcher),
            &options(h.work.path()),
            &noop,
        )
        .unwrap();

        assert_eq!(summary.results[1].failed_stage, Some(Stage::Convert));
        assert_eq!(summary.results[1].error_kind, Some(ErrorKind::Conversion));
        assert!(summary.results[2].success);
        assert!(h.device.path().join("Three.m4a").exists());
        assert!(!h.device.path().join("Two.m4a").exists());
        assert_eq!(h.scratch_left(), 0);
    }

    #[test]
    fn test_resolve_failure_yields_one_result() {
        let h = Harness::new();
        let mut fetcher = FakeFetcher::new(vec![]);
        fetcher.resolve_error = Some(|| Error::Resolution("Video unavailable".into()));
        let summary = run(
            &request("https://www.youtube.com/watch?v=gone"),
            h.stages(&fetcher),
            &options(h.work.path()),
            &noop,
        )
        .unwrap();

        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.results[0].failed_stage, Some(Stage::Resolve));
        assert_eq!(summary.results[0].title, "https://www.youtube.com/watch?v=gone");
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn test_missing_tool_is_fatal() {
        let h = Harness::new();
        let mut fetcher = FakeFetcher::new(vec![]);
        fetcher.resolve_error = Some(|| Error::ToolNotFound("yt-dlp".into()));
        let err = run(
            &request("https://www.youtube.com/watch?v=x"),
            h.stages(&fetcher),
            &options(h.work.path()),
            &noop,
        )
        .unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ToolNotFound(_))));
    }

    #[test]
    fn test_parallel_keeps_listing_order() {
        let h = Harness::new();
        let fetcher = FakeFetcher::new(vec![
            ("a1", "Alpha", Entry::Ok),
            ("b2", "Bravo", Entry::Ok),
            ("c3", "Charlie", Entry::Private),
            ("d4", "Delta", Entry::Ok),
            ("e5", "Echo", Entry::Ok),
            ("f6", "Foxtrot", Entry::Ok),
        ]);
        let opts = PipelineOptions {
            jobs: 3,
            ..options(h.work.path())
        };
        let summary = run(
            &request("https://www.youtube.com/playlist?list=PL1"),
            h.stages(&fetcher),
            &opts,
            &noop,
        )
        .unwrap();

        assert_eq!(
            summary.results.iter().map(|r| r.index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4, 5]
        );
        assert_eq!(summary.succeeded(), 5);
        assert_eq!(h.scratch_left(), 0);
    }

    #[test]
    fn test_network_errors_are_retried() {
        let h = Harness::new();
        let fetcher = FakeFetcher::new(vec![("aaa", "One", Entry::FlakyOnce)]);
        let req = request("https://www.youtube.com/watch?v=aaa");

        let summary = run(&req, h.stages(&fetcher), &options(h.work.path()), &noop).unwrap();
        assert_eq!(summary.results[0].error_kind, Some(ErrorKind::Network));

        let fetcher = FakeFetcher::new(vec![("aaa", "One", Entry::FlakyOnce)]);
        let opts = PipelineOptions {
            retries: 1,
            ..options(h.work.path())
        };
        let summary = run(&req, h.stages(&fetcher), &opts, &noop).unwrap();
        assert!(summary.results[0].success);
    }

    #[derive(Default)]
    struct UnreachableDevice {
        calls: AtomicU32,
    }

    impl Transporter for UnreachableDevice {
        fn transfer(&self, _source: &Path, _item: &MediaItem) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Network("share went away".into()))
        }
    }

    #[test]
    fn test_transfer_is_attempted_once() {
        let h = Harness::new();
        let fetcher = FakeFetcher::new(vec![("aaa", "One", Entry::Ok)]);
        let device = UnreachableDevice::default();
        let stages = Stages {
            transporter: &device,
            ..h.stages(&fetcher)
        };
        let opts = PipelineOptions {
            retries: 3,
            ..options(h.work.path())
        };
        let summary = run(&request("https://www.youtube.com/watch?v=aaa"), stages, &opts, &noop).unwrap();

        assert_eq!(device.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.results[0].failed_stage, Some(Stage::Transfer));
        assert_eq!(h.scratch_left(), 0);
    }

    #[test]
    fn test_cancellation_fails_remaining_items() {
        let h = Harness::new();
        let fetcher = FakeFetcher::new(vec![
            ("aaa", "One", Entry::Ok),
            ("bbb", "Two", Entry::Ok),
            ("ccc", "Three", Entry::Ok),
        ]);
        let token = CancellationToken::new();
        let trigger = token.clone();
        let progress = move |stage: &str, _: u64, _: u64, _: &str| {
            if stage == "items" {
                trigger.cancel();
            }
        };
        let summary = run_with_control(
            &request("https://www.youtube.com/playlist?list=PL1"),
            h.stages(&fetcher),
            &options(h.work.path()),
            &RunControl::new().with_cancel_token(token),
            &progress,
        )
        .unwrap();

        assert!(summary.results[0].success);
        assert!(summary.results[1..]
            .iter()
            .all(|r| r.error_kind == Some(ErrorKind::Cancelled)));
        assert_eq!(h.scratch_left(), 0);
    }
}
