//! Frame acquisition and validation.
//!
//! Each stage returns `Result<_, Rejection>`; the first rejection ends the
//! attempt. A rejected attempt leaves no file behind and triggers one session
//! reload. An attempt never replaces or removes a frame it did not write
//! itself. Callers only see `true` (frame stored) or `false` (no frame this
//! tick).
//!
//! Stages, in order:
//! 1. widget geometry: too narrow means the page is not really loaded
//! 2. raw still from the source
//! 3. decode to RGB8
//! 4. frame width
//! 5. black-grid test
//! 6. side-panel crop
//! 7. JPEG encode + minimum artifact size

use chrono::NaiveDateTime;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::ingest::VideoSource;
use crate::session::Session;
use crate::storage::CaptureStore;

pub const MIN_FRAME_WIDTH: u32 = 132;
pub const SIDE_PANEL_MARGIN: u32 = 66;
pub const MIN_ARTIFACT_BYTES: u64 = 100 * 1024;
pub const BLACK_SAMPLE_STRIDE: u32 = 10;

/// Fixed thresholds of the validation chain.
#[derive(Clone, Copy, Debug)]
pub struct CaptureLimits {
    pub min_width: u32,
    pub side_margin: u32,
    pub min_artifact_bytes: u64,
    pub black_stride: u32,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            min_width: MIN_FRAME_WIDTH,
            side_margin: SIDE_PANEL_MARGIN,
            min_artifact_bytes: MIN_ARTIFACT_BYTES,
            black_stride: BLACK_SAMPLE_STRIDE,
        }
    }
}

/// Why an attempt produced no frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Rejection {
    WidgetTooSmall { width: f64, height: f64 },
    SourceUnavailable(String),
    Undecodable(String),
    FrameTooNarrow { width: u32 },
    BlackFrame,
    ArtifactTooSmall { bytes: u64 },
    Storage(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::WidgetTooSmall { width, height } => {
                write!(f, "widget too small ({}x{})", width, height)
            }
            Rejection::SourceUnavailable(msg) => write!(f, "source unavailable: {}", msg),
            Rejection::Undecodable(msg) => write!(f, "undecodable frame: {}", msg),
            Rejection::FrameTooNarrow { width } => write!(f, "narrow frame (w={})", width),
            Rejection::BlackFrame => write!(f, "black frame"),
            Rejection::ArtifactTooSmall { bytes } => {
                write!(f, "placeholder artifact ({} bytes)", bytes)
            }
            Rejection::Storage(msg) => write!(f, "storage error: {}", msg),
        }
    }
}

/// A persisted frame that passed every stage.
#[derive(Clone, Debug, PartialEq)]
pub struct CapturedFrame {
    pub path: PathBuf,
    pub captured_at: NaiveDateTime,
    pub width: u32,
    pub height: u32,
    pub bytes: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    Accepted(CapturedFrame),
    Rejected(Rejection),
}

/// True when every pixel on a `stride` grid is exactly black.
///
/// A coarse heuristic for a blank session, not an exhaustive scan.
pub fn is_black(image: &RgbImage, stride: u32) -> bool {
    let stride = stride.max(1) as usize;
    for x in (0..image.width()).step_by(stride) {
        for y in (0..image.height()).step_by(stride) {
            if image.get_pixel(x, y).0 != [0, 0, 0] {
                return false;
            }
        }
    }
    true
}

/// Remove `margin` pixels from both the left and right edge.
pub fn crop_side_panels(image: &RgbImage, margin: u32) -> Result<RgbImage, Rejection> {
    let width = image.width();
    if width <= margin.saturating_mul(2) {
        return Err(Rejection::FrameTooNarrow { width });
    }
    Ok(image::imageops::crop_imm(image, margin, 0, width - 2 * margin, image.height()).to_image())
}

/// Sets `created` as soon as the file exists, so a failed encode can still be
/// cleaned up by the caller.
fn write_jpeg(
    image: &RgbImage,
    path: &Path,
    quality: u8,
    created: &mut bool,
) -> anyhow::Result<u64> {
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    *created = true;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, quality).encode_image(image)?;
    writer.flush()?;
    drop(writer);
    Ok(std::fs::metadata(path)?.len())
}

pub struct FrameCapture {
    store: CaptureStore,
    limits: CaptureLimits,
    last_frame: Option<PathBuf>,
}

impl FrameCapture {
    pub fn new(store: CaptureStore, limits: CaptureLimits) -> Self {
        Self {
            store,
            limits,
            last_frame: None,
        }
    }

    pub fn store(&self) -> &CaptureStore {
        &self.store
    }

    pub fn last_frame(&self) -> Option<&Path> {
        self.last_frame.as_deref()
    }

    /// One capture tick: acquire, validate, persist; reload the session on
    /// any rejection.
    pub fn capture(&mut self, session: &mut Session, config: &Config, now: NaiveDateTime) -> bool {
        match self.attempt(session.source_mut(), config.image_quality, now) {
            Verdict::Accepted(frame) => {
                log::debug!(
                    "frame stored: {} ({}x{}, {} bytes)",
                    frame.path.display(),
                    frame.width,
                    frame.height,
                    frame.bytes
                );
                true
            }
            Verdict::Rejected(reason) => {
                log::warn!("frame rejected: {} -> reloading session", reason);
                session.reload(&config.source_address);
                false
            }
        }
    }

    /// Run the validation chain without any recovery.
    pub fn attempt(
        &mut self,
        source: &mut dyn VideoSource,
        quality: u8,
        now: NaiveDateTime,
    ) -> Verdict {
        let path = self.store.next_frame_path(now);
        let mut created = false;
        match self.run_stages(source, quality, &path, now, &mut created) {
            Ok(frame) => {
                self.last_frame = Some(frame.path.clone());
                Verdict::Accepted(frame)
            }
            Err(reason) => {
                if created {
                    if let Err(err) = std::fs::remove_file(&path) {
                        log::warn!("cannot remove rejected frame {}: {}", path.display(), err);
                    }
                }
                Verdict::Rejected(reason)
            }
        }
    }

    fn run_stages(
        &self,
        source: &mut dyn VideoSource,
        quality: u8,
        path: &Path,
        now: NaiveDateTime,
        created: &mut bool,
    ) -> Result<CapturedFrame, Rejection> {
        let rect = source
            .widget_rect()
            .map_err(|e| Rejection::SourceUnavailable(format!("{:#}", e)))?;
        if rect.width < self.limits.min_width as f64 {
            return Err(Rejection::WidgetTooSmall {
                width: rect.width,
                height: rect.height,
            });
        }

        let raw = source
            .raw_frame()
            .map_err(|e| Rejection::SourceUnavailable(format!("{:#}", e)))?;
        let image = image::load_from_memory(&raw)
            .map_err(|e| Rejection::Undecodable(e.to_string()))?
            .into_rgb8();

        if image.width() < self.limits.min_width {
            return Err(Rejection::FrameTooNarrow {
                width: image.width(),
            });
        }
        if is_black(&image, self.limits.black_stride) {
            return Err(Rejection::BlackFrame);
        }
        let cropped = crop_side_panels(&image, self.limits.side_margin)?;

        self.store
            .ensure_date_dir(now.date())
            .map_err(|e| Rejection::Storage(format!("{:#}", e)))?;
        let bytes = write_jpeg(&cropped, path, quality, created)
            .map_err(|e| Rejection::Storage(format!("{:#}", e)))?;
        if bytes < self.limits.min_artifact_bytes {
            return Err(Rejection::ArtifactTooSmall { bytes });
        }

        Ok(CapturedFrame {
            path: path.to_path_buf(),
            captured_at: now,
            width: cropped.width(),
            height: cropped.height(),
            bytes,
        })
    }
}
