use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tubepod_core::{
    AudioFormat, CancellationToken, DeviceInfo, FfmpegConverter, FsTransporter, Layout, LoftyTagger,
    MediaRequest, PipelineOptions, Resolution, RunControl, Settings, Stages, YtDlpFetcher,
};

#[derive(Parser, Debug)]
#[command(
    name = "tubepod",
    version,
    about = "Download YouTube audio or video, convert it for the iPod and copy it onto the device"
)]
struct Cli {
    /// Video or playlist URL
    #[arg(short, long)]
    url: String,

    /// Device mount point; files are copied under it
    #[arg(short, long)]
    output_dir: PathBuf,

    /// Audio format
    #[arg(short, long, value_enum)]
    format: Option<AudioFormat>,

    /// Audio bitrate in kbps (128, 192, 256, 320)
    #[arg(short, long)]
    quality: Option<u32>,

    /// Download and convert video (mp4) instead of audio only
    #[arg(long)]
    video: bool,

    /// Video frame size (640x480, 480x360, 320x240)
    #[arg(short, long)]
    resolution: Option<Resolution>,

    /// Destination layout on the device
    #[arg(long, value_enum)]
    layout: Option<Layout>,

    /// Playlist items processed at once
    #[arg(long)]
    jobs: Option<usize>,

    /// Retries for stages that fail with a network error
    #[arg(long)]
    retries: Option<u32>,

    /// Don't embed thumbnails as cover art
    #[arg(long)]
    no_artwork: bool,

    /// Verify every copy with SHA-256
    #[arg(long)]
    verify: bool,

    /// Scratch directory for downloads and conversions
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Config file (default: <config dir>/tubepod/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective settings back to the config file
    #[arg(long)]
    save_config: bool,

    /// Write a JSON run report to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "tubepod=debug,tubepod_core=debug"
    } else {
        "tubepod=info,tubepod_core=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

/// Fold explicit flags over the loaded settings.
fn apply_overrides(cli: &Cli, settings: &mut Settings) -> anyhow::Result<()> {
    if let Some(format) = cli.format {
        settings.general.format = format;
    }
    if let Some(quality) = cli.quality {
        settings.general.quality = quality;
    }
    if let Some(layout) = cli.layout {
        settings.general.layout = layout;
    }
    if cli.video {
        settings.video.enabled = true;
    }
    if let Some(resolution) = cli.resolution {
        settings.video.resolution = resolution;
    }
    if cli.no_artwork {
        settings.metadata.embed_artwork = false;
    }
    if cli.verify {
        settings.transfer.verify = true;
    }
    if let Some(jobs) = cli.jobs {
        if jobs == 0 {
            bail!("--jobs must be at least 1");
        }
        settings.advanced.jobs = jobs;
    }
    if let Some(retries) = cli.retries {
        settings.advanced.retries = retries;
    }
    if let Some(dir) = &cli.work_dir {
        settings.advanced.work_dir = Some(dir.clone());
    }
    Ok(())
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{bar:40}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb
}

fn run(cli: Cli) -> anyhow::Result<u8> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    apply_overrides(&cli, &mut settings)?;
    settings.validate()?;

    if cli.save_config {
        let path = cli
            .config
            .clone()
            .or_else(Settings::default_path)
            .context("no config directory on this platform; pass --config")?;
        settings.save(&path)?;
        info!("Saved settings to {}", path.display());
    }

    let request = MediaRequest::new(
        &cli.url,
        settings.general.format,
        settings.general.quality,
        settings.video.enabled,
        settings.video.resolution,
    )?;

    let device = DeviceInfo::probe(&cli.output_dir)
        .with_context(|| format!("cannot use {} as destination", cli.output_dir.display()))?;
    info!("Device {}", device);

    let fetcher = YtDlpFetcher::locate(settings.advanced.ytdlp_path.as_deref())?;
    let converter =
        FfmpegConverter::locate(settings.advanced.ffmpeg_path.as_deref())?.with_delete_source(true);
    let tagger = LoftyTagger::new();
    let transporter = FsTransporter::new(&cli.output_dir, settings.general.layout)
        .with_verify(settings.transfer.verify)
        .with_reserve(settings.transfer.reserve_bytes);

    let defaults = PipelineOptions::default();
    let options = PipelineOptions {
        work_dir: settings.advanced.work_dir.clone().unwrap_or(defaults.work_dir),
        jobs: settings.advanced.jobs,
        retries: settings.advanced.retries,
        embed_artwork: settings.metadata.embed_artwork,
        ..PipelineOptions::default()
    };

    let token = CancellationToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nCancelling; items already in progress will finish.");
        handler_token.cancel();
    })
    .context("cannot install Ctrl-C handler")?;

    let pb = progress_bar();
    let bar = pb.clone();
    let progress = move |stage: &str, current: u64, total: u64, message: &str| match stage {
        "resolve" => bar.set_message(format!("resolving {}", message)),
        _ => {
            bar.set_length(total);
            bar.set_position(current + 1);
            bar.set_message(message.to_string());
        }
    };

    let stages = Stages {
        fetcher: &fetcher,
        converter: &converter,
        tagger: &tagger,
        transporter: &transporter,
    };
    let summary = tubepod_core::run_with_control(
        &request,
        stages,
        &options,
        &RunControl::new().with_cancel_token(token),
        &progress,
    )?;
    pb.finish_and_clear();

    println!("{}", summary);
    if let Some(path) = &cli.report {
        match summary.write_report(path) {
            Ok(()) => info!("Report written to {}", path.display()),
            Err(e) => error!("Cannot write report {}: {:#}", path.display(), e),
        }
    }
    Ok(summary.exit_code())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut full = vec!["tubepod", "--url", "https://youtu.be/x", "--output-dir", "/mnt/ipod"];
        full.extend_from_slice(args);
        Cli::try_parse_from(full).unwrap()
    }

    #[test]
    fn test_flags_override_config() {
        let mut settings = Settings::from_toml_str(
            "[general]\nformat = \"mp3\"\nquality = 128\n[advanced]\njobs = 4\n",
        )
        .unwrap();
        let cli = parse(&["-q", "320", "--video", "-r", "320x240", "--no-artwork"]);
        apply_overrides(&cli, &mut settings).unwrap();

        assert_eq!(settings.general.format, AudioFormat::Mp3);
        assert_eq!(settings.general.quality, 320);
        assert!(settings.video.enabled);
        assert_eq!(settings.video.resolution, Resolution { width: 320, height: 240 });
        assert!(!settings.metadata.embed_artwork);
        assert_eq!(settings.advanced.jobs, 4);
    }

    #[test]
    fn test_defaults_without_flags() {
        let mut settings = Settings::default();
        apply_overrides(&parse(&[]), &mut settings).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut settings = Settings::default();
        assert!(apply_overrides(&parse(&["--jobs", "0"]), &mut settings).is_err());
        assert!(Cli::try_parse_from(["tubepod", "-u", "x", "-o", "y", "-f", "ogg"]).is_err());
        assert!(Cli::try_parse_from(["tubepod", "-u", "x", "-o", "y", "-r", "1920x1080"]).is_err());
        assert!(Cli::try_parse_from(["tubepod", "--output-dir", "y"]).is_err());
    }

    #[test]
    fn test_layout_flag() {
        let mut settings = Settings::default();
        apply_overrides(&parse(&["--layout", "artist-album"]), &mut settings).unwrap();
        assert_eq!(settings.general.layout, Layout::ArtistAlbum);
    }
}
