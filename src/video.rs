//! Daily video assembly.
//!
//! `VideoAssembler::encode` turns one date's accepted frames into a single
//! video artifact. The pixel pipeline is behind [`VideoBackend`]; the
//! production backend pipes raw RGB frames into an `ffmpeg` child process.

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use image::imageops::FilterType;
use image::RgbImage;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::status::{StatusEvent, StatusSender};
use crate::storage::CaptureStore;

/// Upper bound on `video_progress` events per job.
const PROGRESS_EVENTS_PER_JOB: usize = 100;

/// Receives frames of one video, in order.
pub trait VideoSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()>;

    /// Flush and close the artifact.
    fn finish(self: Box<Self>) -> Result<()>;
}

pub trait VideoBackend: Send {
    fn name(&self) -> &'static str;

    fn open(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        frame_rate: u32,
    ) -> Result<Box<dyn VideoSink>>;
}

// -------------------- ffmpeg --------------------

/// Encodes through an external `ffmpeg` (H.264, yuv420p).
#[derive(Clone, Debug)]
pub struct FfmpegBackend {
    program: PathBuf,
}

impl FfmpegBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

fn ffmpeg_args(path: &Path, width: u32, height: u32, frame_rate: u32) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgb24".into(),
        "-s".into(),
        format!("{}x{}", width, height),
        "-r".into(),
        frame_rate.to_string(),
        "-i".into(),
        "pipe:0".into(),
        // yuv420p needs even dimensions
        "-vf".into(),
        "pad=ceil(iw/2)*2:ceil(ih/2)*2".into(),
        "-c:v".into(),
        "libx264".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        path.to_string_lossy().into_owned(),
    ]
}

impl VideoBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn open(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        frame_rate: u32,
    ) -> Result<Box<dyn VideoSink>> {
        let mut child = Command::new(&self.program)
            .args(ffmpeg_args(path, width, height, frame_rate))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn {}", self.program.display()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdin not captured"))?;
        log::debug!(
            "ffmpeg pid {} encoding {} ({}x{} @ {} fps)",
            child.id(),
            path.display(),
            width,
            height,
            frame_rate
        );
        Ok(Box::new(FfmpegSink {
            child: Some(child),
            stdin: Some(stdin),
            path: path.to_path_buf(),
        }))
    }
}

/// A running ffmpeg. Killed on drop unless `finish` reaped it.
struct FfmpegSink {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    path: PathBuf,
}

impl VideoSink for FfmpegSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg input already closed"))?;
        stdin
            .write_all(frame.as_raw())
            .context("ffmpeg stdin closed")
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        drop(self.stdin.take());
        let mut child = self
            .child
            .take()
            .ok_or_else(|| anyhow!("ffmpeg already reaped"))?;
        let status = child.wait().context("wait for ffmpeg")?;
        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            bail!(
                "ffmpeg failed for {} ({}): {}",
                self.path.display(),
                status,
                stderr.trim()
            );
        }
        Ok(())
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            log::warn!("killing unfinished ffmpeg for {}", self.path.display());
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

// -------------------- recording backend --------------------

/// One finished video as seen by [`RecordingBackend`].
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedVideo {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub frame_sizes: Vec<(u32, u32)>,
}

/// Keeps frame geometry in memory and leaves an empty placeholder file at the
/// output path. Used for dry runs and tests.
#[derive(Clone, Debug, Default)]
pub struct RecordingBackend {
    videos: Arc<Mutex<Vec<RecordedVideo>>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn videos(&self) -> Vec<RecordedVideo> {
        self.videos
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl VideoBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn open(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        frame_rate: u32,
    ) -> Result<Box<dyn VideoSink>> {
        Ok(Box::new(RecordingSink {
            videos: self.videos.clone(),
            video: RecordedVideo {
                path: path.to_path_buf(),
                width,
                height,
                frame_rate,
                frame_sizes: Vec::new(),
            },
        }))
    }
}

struct RecordingSink {
    videos: Arc<Mutex<Vec<RecordedVideo>>>,
    video: RecordedVideo,
}

impl VideoSink for RecordingSink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        self.video.frame_sizes.push(frame.dimensions());
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        std::fs::write(&self.video.path, b"")
            .with_context(|| format!("write {}", self.video.path.display()))?;
        self.videos
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(self.video);
        Ok(())
    }
}

// -------------------- assembler --------------------

#[derive(Clone, Debug, PartialEq)]
pub enum VideoOutcome {
    /// Nothing captured for the date; nothing written.
    NoFrames,
    Encoded {
        path: PathBuf,
        frames: usize,
        deleted: usize,
    },
}

pub struct VideoAssembler {
    store: CaptureStore,
    backend: Box<dyn VideoBackend>,
    status: StatusSender,
}

impl VideoAssembler {
    pub fn new(store: CaptureStore, backend: Box<dyn VideoBackend>, status: StatusSender) -> Self {
        Self {
            store,
            backend,
            status,
        }
    }

    /// Encode every accepted frame of `date`, oldest first.
    pub fn encode(&self, date: NaiveDate, config: &Config) -> Result<VideoOutcome> {
        let frames = self.store.list_frames(date)?;
        if frames.is_empty() {
            log::info!("no frames captured on {}, skipping video", date);
            self.status.emit(StatusEvent::NoFrames {
                date: date.format("%Y-%m-%d").to_string(),
            });
            return Ok(VideoOutcome::NoFrames);
        }

        self.status.emit(StatusEvent::VideoPrepare);
        let total = frames.len();
        let (width, height) = frames
            .iter()
            .find_map(|path| image::image_dimensions(path).ok())
            .ok_or_else(|| anyhow!("none of the {} frames of {} is readable", total, date))?;
        let output = self
            .store
            .video_path(date, config.delete_frames_after_video)?;
        log::info!(
            "encoding {} frames of {} into {} via {} ({}x{} @ {} fps)",
            total,
            date,
            output.display(),
            self.backend.name(),
            width,
            height,
            config.frame_rate
        );

        self.status.emit(StatusEvent::VideoStart {
            total_frames: total,
        });
        let mut sink = self
            .backend
            .open(&output, width, height, config.frame_rate)?;
        let step = total.div_ceil(PROGRESS_EVENTS_PER_JOB).max(1);
        let mut written = 0usize;
        for (index, path) in frames.iter().enumerate() {
            match image::open(path) {
                Ok(frame) => {
                    let mut frame = frame.into_rgb8();
                    if frame.dimensions() != (width, height) {
                        frame = image::imageops::resize(&frame, width, height, FilterType::Triangle);
                    }
                    sink.write_frame(&frame)?;
                    written += 1;
                }
                Err(err) => log::warn!("skipping unreadable frame {}: {}", path.display(), err),
            }
            let done = index + 1;
            if done % step == 0 || done == total {
                self.status.emit(StatusEvent::VideoProgress { done, total });
            }
        }
        sink.finish()?;

        let name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let summary = format!("{} frames -> {}", written, name);
        log::info!("video done: {}", summary);
        self.status.emit(StatusEvent::VideoDone { summary });

        let deleted = if config.delete_frames_after_video {
            self.delete_frames(&frames)
        } else {
            0
        };
        self.status.emit(StatusEvent::DeleteDone { count: deleted });

        Ok(VideoOutcome::Encoded {
            path: output,
            frames: written,
            deleted,
        })
    }

    fn delete_frames(&self, frames: &[PathBuf]) -> usize {
        let mut deleted = 0;
        for path in frames {
            match std::fs::remove_file(path) {
                Ok(()) => deleted += 1,
                Err(err) => log::warn!("cannot delete frame {}: {}", path.display(), err),
            }
        }
        log::info!("deleted {} of {} frames", deleted, frames.len());
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{self, StatusReceiver};
    use chrono::{NaiveDateTime, NaiveTime};
    use image::Rgb;
    use tempfile::TempDir;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn at_second(n: u32) -> NaiveDateTime {
        day().and_time(NaiveTime::from_num_seconds_from_midnight_opt(8 * 3600 + n, 0).unwrap())
    }

    fn write_frame(store: &CaptureStore, n: u32, width: u32, height: u32) -> PathBuf {
        store.ensure_date_dir(day()).unwrap();
        let path = store.frame_path(at_second(n));
        RgbImage::from_pixel(width, height, Rgb([40, 80, 120]))
            .save(&path)
            .unwrap();
        path
    }

    fn setup() -> (TempDir, CaptureStore, RecordingBackend, VideoAssembler, StatusReceiver) {
        let dir = TempDir::new().unwrap();
        let store = CaptureStore::new(dir.path());
        let backend = RecordingBackend::new();
        let (tx, rx) = status::channel();
        let assembler = VideoAssembler::new(store.clone(), Box::new(backend.clone()), tx);
        (dir, store, backend, assembler, rx)
    }

    #[test]
    fn empty_day_writes_nothing_and_reports_once() {
        let (_dir, store, backend, assembler, rx) = setup();
        let outcome = assembler.encode(day(), &Config::default()).unwrap();
        assert_eq!(outcome, VideoOutcome::NoFrames);
        assert_eq!(
            rx.drain(),
            vec![StatusEvent::NoFrames {
                date: "2026-10-19".to_string()
            }]
        );
        assert!(backend.videos().is_empty());
        assert!(!store.date_dir(day()).exists());
    }

    #[test]
    fn frames_are_encoded_in_order_at_first_frame_size() {
        let (_dir, store, backend, assembler, rx) = setup();
        write_frame(&store, 0, 64, 48);
        write_frame(&store, 15, 32, 24);
        write_frame(&store, 30, 64, 48);

        let outcome = assembler.encode(day(), &Config::default()).unwrap();
        let path = store.date_dir(day()).join("video-20261019.mp4");
        assert_eq!(
            outcome,
            VideoOutcome::Encoded {
                path: path.clone(),
                frames: 3,
                deleted: 0
            }
        );

        let videos = backend.videos();
        assert_eq!(videos.len(), 1);
        assert_eq!(videos[0].path, path);
        assert_eq!(videos[0].frame_rate, 60);
        assert_eq!(videos[0].frame_sizes, vec![(64, 48); 3]);

        let events = rx.drain();
        let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "video_prepare",
                "video_start",
                "video_progress",
                "video_progress",
                "video_progress",
                "video_done",
                "delete_done"
            ]
        );
        assert!(events.contains(&StatusEvent::VideoDone {
            summary: "3 frames -> video-20261019.mp4".to_string()
        }));
        assert_eq!(events.last(), Some(&StatusEvent::DeleteDone { count: 0 }));
        assert_eq!(store.count_frames(day()), 3);
    }

    #[test]
    fn progress_is_throttled_for_long_days() {
        for (total, expected) in [(3, 3), (199, 100), (250, 84)] {
            let (_dir, store, _backend, assembler, rx) = setup();
            for n in 0..total {
                write_frame(&store, n, 8, 8);
            }
            assembler.encode(day(), &Config::default()).unwrap();
            let progress: Vec<_> = rx
                .drain()
                .into_iter()
                .filter_map(|e| match e {
                    StatusEvent::VideoProgress { done, .. } => Some(done),
                    _ => None,
                })
                .collect();
            assert_eq!(progress.len(), expected, "{} frames", total);
            assert!(progress.len() <= PROGRESS_EVENTS_PER_JOB);
            assert_eq!(progress.last(), Some(&(total as usize)));
        }
    }

    #[test]
    fn unreadable_frames_are_skipped() {
        let (_dir, store, backend, assembler, _rx) = setup();
        write_frame(&store, 0, 16, 16);
        std::fs::write(store.frame_path(at_second(1)), b"not a jpeg").unwrap();
        write_frame(&store, 2, 16, 16);

        let outcome = assembler.encode(day(), &Config::default()).unwrap();
        assert!(matches!(outcome, VideoOutcome::Encoded { frames: 2, .. }));
        assert_eq!(backend.videos()[0].frame_sizes.len(), 2);
    }

    #[test]
    fn deletion_removes_frames_and_suffixes_reencodes() {
        let (_dir, store, _backend, assembler, rx) = setup();
        let config = Config {
            delete_frames_after_video: true,
            ..Config::default()
        };
        write_frame(&store, 0, 16, 16);
        write_frame(&store, 1, 16, 16);
        assembler.encode(day(), &config).unwrap();
        assert_eq!(store.count_frames(day()), 0);
        assert_eq!(rx.drain().last(), Some(&StatusEvent::DeleteDone { count: 2 }));

        write_frame(&store, 60, 16, 16);
        let outcome = assembler.encode(day(), &config).unwrap();
        let VideoOutcome::Encoded { path, deleted, .. } = outcome else {
            panic!("expected a second video");
        };
        assert!(path.ends_with("video-20261019_1.mp4"));
        assert_eq!(deleted, 1);
    }

    #[test]
    fn ffmpeg_is_fed_raw_rgb_and_encodes_h264() {
        let args = ffmpeg_args(Path::new("/tmp/out.mp4"), 1148, 1080, 60);
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -pix_fmt rgb24 -s 1148x1080 -r 60 -i pipe:0"));
        assert!(joined.contains("-c:v libx264 -pix_fmt yuv420p"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));
    }
}
