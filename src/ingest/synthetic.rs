//! Synthetic widget source (`stub://`).
//!
//! Produces noisy PNG stills so the whole capture path can run without a
//! remote player. A script of [`SyntheticFrame`] values can be queued to
//! reproduce source failures (black feed, narrow widget, unreachable player);
//! once the script runs out the source falls back to normal pattern frames.

use anyhow::{anyhow, Context, Result};
use image::{ImageFormat, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{backend_kind, SourceKind, VideoSource, WidgetRect};

const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;

/// What the next `raw_frame` call returns.
#[derive(Clone, Debug, PartialEq)]
pub enum SyntheticFrame {
    Pattern { width: u32, height: u32 },
    Black { width: u32, height: u32 },
    Unavailable,
}

/// Counters shared with whoever created the source, so they stay readable
/// after the source is boxed into a session.
#[derive(Clone, Debug, Default)]
pub struct SyntheticStats {
    navigations: Arc<AtomicU64>,
    frames_served: Arc<AtomicU64>,
    shutdowns: Arc<AtomicU64>,
}

impl SyntheticStats {
    pub fn navigations(&self) -> u64 {
        self.navigations.load(Ordering::SeqCst)
    }

    pub fn frames_served(&self) -> u64 {
        self.frames_served.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> u64 {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

pub struct SyntheticSource {
    width: u32,
    height: u32,
    widget: WidgetRect,
    script: VecDeque<SyntheticFrame>,
    embed: Option<String>,
    blank_embed: bool,
    stats: SyntheticStats,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            widget: WidgetRect {
                width: DEFAULT_WIDTH as f64,
                height: DEFAULT_HEIGHT as f64,
            },
            script: VecDeque::new(),
            embed: None,
            blank_embed: false,
            stats: SyntheticStats::default(),
        }
    }

    /// Size of generated pattern frames.
    pub fn with_frame_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Geometry reported for the widget element.
    pub fn with_widget(mut self, width: f64, height: f64) -> Self {
        self.widget = WidgetRect { width, height };
        self
    }

    pub fn with_script(mut self, frames: impl IntoIterator<Item = SyntheticFrame>) -> Self {
        self.script.extend(frames);
        self
    }

    /// Navigations land on a page whose player frame points nowhere.
    pub fn with_blank_embed(mut self) -> Self {
        self.blank_embed = true;
        self
    }

    pub fn stats(&self) -> SyntheticStats {
        self.stats.clone()
    }

    fn render(&self, frame: &SyntheticFrame) -> Result<Vec<u8>> {
        let image = match *frame {
            SyntheticFrame::Pattern { width, height } => {
                let mut rng = StdRng::seed_from_u64(self.stats.frames_served());
                RgbImage::from_fn(width, height, |x, y| {
                    let noise: u8 = rng.gen();
                    Rgb([
                        (x % 256) as u8 ^ noise,
                        (y % 256) as u8,
                        noise.wrapping_add((x + y) as u8),
                    ])
                })
            }
            SyntheticFrame::Black { width, height } => RgbImage::new(width, height),
            SyntheticFrame::Unavailable => {
                return Err(anyhow!("synthetic player is not rendering"));
            }
        };
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .context("encode synthetic frame")?;
        Ok(out.into_inner())
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoSource for SyntheticSource {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn navigate(&mut self, address: &str) -> Result<()> {
        self.stats.navigations.fetch_add(1, Ordering::SeqCst);
        if backend_kind(address) != Some(SourceKind::Synthetic) {
            self.embed = None;
            return Err(anyhow!("synthetic source cannot load {}", address));
        }
        self.embed = if self.blank_embed {
            Some("about:blank".to_string())
        } else {
            Some(format!("{}/embed", address.trim_end_matches('/')))
        };
        log::debug!("SyntheticSource: navigated to {}", address);
        Ok(())
    }

    fn embed_source(&self) -> Option<&str> {
        self.embed.as_deref()
    }

    fn widget_rect(&mut self) -> Result<WidgetRect> {
        if self.embed.is_none() {
            return Err(anyhow!("synthetic source not navigated"));
        }
        Ok(self.widget)
    }

    fn raw_frame(&mut self) -> Result<Vec<u8>> {
        if self.embed.is_none() {
            return Err(anyhow!("synthetic source not navigated"));
        }
        let frame = self.script.pop_front().unwrap_or(SyntheticFrame::Pattern {
            width: self.width,
            height: self.height,
        });
        let bytes = self.render(&frame)?;
        self.stats.frames_served.fetch_add(1, Ordering::SeqCst);
        Ok(bytes)
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.embed.take().is_some() {
            self.stats.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_script_then_pattern_frames() -> Result<()> {
        let mut source = SyntheticSource::new()
            .with_frame_size(64, 48)
            .with_script([SyntheticFrame::Black { width: 10, height: 10 }, SyntheticFrame::Unavailable]);
        source.navigate("stub://widget")?;

        let black = image::load_from_memory(&source.raw_frame()?)?;
        assert_eq!((black.width(), black.height()), (10, 10));
        assert!(source.raw_frame().is_err());
        let pattern = image::load_from_memory(&source.raw_frame()?)?;
        assert_eq!((pattern.width(), pattern.height()), (64, 48));
        assert_eq!(source.stats().frames_served(), 2);
        Ok(())
    }

    #[test]
    fn refuses_frames_before_navigation() {
        let mut source = SyntheticSource::new();
        assert!(source.raw_frame().is_err());
        assert!(source.widget_rect().is_err());
    }

    #[test]
    fn refuses_non_stub_addresses() {
        let mut source = SyntheticSource::new();
        assert!(source.navigate("http://127.0.0.1:9/player").is_err());
        assert_eq!(source.embed_source(), None);
        assert!(source.raw_frame().is_err());
    }

    #[test]
    fn shutdown_is_idempotent() -> Result<()> {
        let mut source = SyntheticSource::new();
        let stats = source.stats();
        source.navigate("stub://widget")?;
        source.shutdown()?;
        source.shutdown()?;
        assert_eq!(stats.shutdowns(), 1);
        assert_eq!(source.embed_source(), None);
        Ok(())
    }
}
