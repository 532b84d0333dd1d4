//! timelapsed - timelapse capture daemon
//!
//! This daemon:
//! 1. Takes the single-instance lock
//! 2. Loads (or creates) the config file
//! 3. Establishes the video-source session; failure here is fatal
//! 4. Captures frames on the configured cadence inside the work window
//! 5. Assembles the day's video after the cutoff
//! 6. Hot-reloads the config file while running
//!
//! `timelapsed set ...` edits the config file of a running (or stopped)
//! daemon instead.

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use timelapse_kernel::capture::CaptureLimits;
use timelapse_kernel::config::DEFAULT_CONFIG_PATH;
use timelapse_kernel::instance::DEFAULT_LOCK_FILE;
use timelapse_kernel::logging::DEFAULT_RETAIN_DAYS;
use timelapse_kernel::storage::DEFAULT_CAPTURE_ROOT;
use timelapse_kernel::ui::{StatusConsole, Ui};
use timelapse_kernel::{
    open_source, status, CaptureStore, ConfigPatch, ConfigStore, ConfigWatcher, FfmpegBackend,
    FrameCapture, InstanceLock, LogConfig, LogService, RecordingBackend, Scheduler, Session,
    TimeOfDay, VideoAssembler, VideoBackend,
};

const STATUS_POLL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, env = "TIMELAPSE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Root directory for per-date frame folders.
    #[arg(long, default_value = DEFAULT_CAPTURE_ROOT)]
    capture_dir: PathBuf,
    /// Single-instance lock file.
    #[arg(long, default_value = DEFAULT_LOCK_FILE)]
    lock_file: PathBuf,
    /// Log to this file (rotated daily) instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Days of rotated logs to keep.
    #[arg(long, default_value_t = DEFAULT_RETAIN_DAYS)]
    log_retain_days: u32,
    /// UI mode for stderr status (auto|plain|pretty|json)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
    /// ffmpeg executable used for video assembly.
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: PathBuf,
    /// Do not encode videos; only record what would have been encoded.
    #[arg(long)]
    dry_run_video: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the capture daemon (default).
    Run,
    /// Change config values and exit.
    Set(SetArgs),
}

#[derive(clap::Args, Debug)]
struct SetArgs {
    /// Video-source address (stub://... or http(s)://...).
    #[arg(long)]
    source: Option<String>,
    /// Work window start, HH:MM.
    #[arg(long)]
    work_start: Option<TimeOfDay>,
    /// Work window end, HH:MM.
    #[arg(long)]
    work_end: Option<TimeOfDay>,
    /// Capture interval in seconds (fractional allowed).
    #[arg(long)]
    interval: Option<f64>,
    /// Video cutoff, HH:MM.
    #[arg(long)]
    cutoff: Option<TimeOfDay>,
    /// Output video frame rate.
    #[arg(long)]
    frame_rate: Option<u32>,
    /// Delete frames after the video is written (true|false).
    #[arg(long)]
    delete_frames: Option<bool>,
    /// JPEG quality (75-100).
    #[arg(long)]
    quality: Option<u8>,
    /// Preventive session reload period in minutes, 0 disables.
    #[arg(long)]
    reload_minutes: Option<u32>,
}

impl SetArgs {
    fn into_patch(self) -> Result<ConfigPatch> {
        let capture_interval = match self.interval {
            Some(secs) => Some(
                Duration::try_from_secs_f64(secs)
                    .map_err(|_| anyhow!("invalid capture interval {}", secs))?,
            ),
            None => None,
        };
        Ok(ConfigPatch {
            source_address: self.source,
            work_start: self.work_start,
            work_end: self.work_end,
            capture_interval,
            video_cutoff: self.cutoff,
            frame_rate: self.frame_rate,
            delete_frames_after_video: self.delete_frames,
            image_quality: self.quality,
            session_reload_minutes: self.reload_minutes,
        })
    }
}

fn main() -> Result<()> {
    let mut args = Args::parse();
    let logs = LogService::init(&LogConfig {
        file: args.log_file.clone(),
        retain_days: args.log_retain_days,
        ..LogConfig::default()
    })?;

    let result = match args.command.take() {
        Some(Command::Set(set)) => set_config(&args.config, set),
        Some(Command::Run) | None => run(&args),
    };
    if let Err(err) = &result {
        log::error!("{:#}", err);
    }
    logs.shutdown();
    result
}

fn set_config(path: &Path, set: SetArgs) -> Result<()> {
    let patch = set.into_patch()?;
    if patch.is_empty() {
        return Err(anyhow!("nothing to change; see `timelapsed set --help`"));
    }
    let mut store = ConfigStore::open(path)?;
    let config = store.update(&patch)?;
    println!(
        "{}: window {}-{}, cutoff {}, every {:?}, {} fps, quality {}, delete frames {}",
        path.display(),
        config.work_start,
        config.work_end,
        config.video_cutoff,
        config.capture_interval,
        config.frame_rate,
        config.image_quality,
        config.delete_frames_after_video
    );
    Ok(())
}

fn run(args: &Args) -> Result<()> {
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let _lock = InstanceLock::acquire(&args.lock_file)?;
    let (status_tx, status_rx) = status::channel();
    let store = ConfigStore::open(&args.config)?.with_status(status_tx.clone());
    let config = store.current().clone();

    let session = {
        let _stage = ui.stage("Open video session");
        let source = open_source(&config.source_address)?;
        Session::establish(source, &config.source_address)?
    };

    let captures = CaptureStore::new(&args.capture_dir);
    let backend: Box<dyn VideoBackend> = if args.dry_run_video {
        Box::new(RecordingBackend::new())
    } else {
        Box::new(FfmpegBackend::new(&args.ffmpeg))
    };
    let (updates_tx, updates_rx) = mpsc::channel();
    let watcher = ConfigWatcher::new(store, updates_tx).spawn()?;

    let scheduler = Scheduler::new(
        config,
        session,
        FrameCapture::new(captures.clone(), CaptureLimits::default()),
        VideoAssembler::new(captures, backend, status_tx.clone()),
        status_tx,
        updates_rx,
        Local::now().date_naive(),
    );

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!(
        "timelapsed running. capturing into {}, config {}",
        args.capture_dir.display(),
        args.config.display()
    );
    let worker = std::thread::Builder::new()
        .name("scheduler".into())
        .spawn(move || scheduler.run(stop_rx))
        .context("spawn scheduler thread")?;

    let mut console = StatusConsole::new(&ui);
    while !worker.is_finished() {
        console.pump(&status_rx);
        std::thread::sleep(STATUS_POLL);
    }
    console.pump(&status_rx);
    console.finish();

    log::info!("shutdown signal received, stopping...");
    watcher.stop()?;
    worker
        .join()
        .map_err(|_| anyhow!("scheduler thread panicked"))??;
    Ok(())
}
