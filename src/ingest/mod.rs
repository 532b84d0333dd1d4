//! Video-source sessions.
//!
//! A `VideoSource` is the live connection to the remote player widget. It
//! knows how to navigate to the widget page, report the widget geometry and
//! hand back one encoded still image. It does not validate or persist frames;
//! that is the capture pipeline's job.
//!
//! Backends are selected by address scheme:
//! - `stub://...` synthetic frames (tests, dry runs)
//! - `http(s)://...` widget page fetched over HTTP (feature: source-http)

use anyhow::{anyhow, Result};

#[cfg(feature = "source-http")]
pub mod http;
pub mod synthetic;

#[cfg(feature = "source-http")]
pub use http::{HttpSourceConfig, HttpWidgetSource};
pub use synthetic::{SyntheticFrame, SyntheticSource};

/// On-screen rectangle of the player widget, in CSS pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WidgetRect {
    pub width: f64,
    pub height: f64,
}

/// Live connection to the remote widget.
pub trait VideoSource: Send {
    /// Backend identifier for logs.
    fn name(&self) -> &'static str;

    /// Load (or re-load) the widget page at `address`, forcing a refresh, and
    /// wait a bounded time for the player container and embedded frame.
    fn navigate(&mut self, address: &str) -> Result<()>;

    /// Source address of the embedded player frame after the last navigation.
    fn embed_source(&self) -> Option<&str>;

    fn widget_rect(&mut self) -> Result<WidgetRect>;

    /// One encoded still image (PNG/JPEG bytes) of the player.
    fn raw_frame(&mut self) -> Result<Vec<u8>>;

    /// Drop the session and anything it spawned. Must be safe to call twice.
    fn shutdown(&mut self) -> Result<()>;
}

/// Page state a capture strategy works from.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WidgetPage {
    pub address: String,
    pub embed_src: Option<String>,
    pub poster: Option<String>,
    pub rect: Option<WidgetRect>,
}

/// One way of turning the widget into a still image.
pub trait CaptureStrategy: Send {
    fn name(&self) -> &'static str;

    fn produce_raw_frame(&mut self, page: &WidgetPage) -> Result<Vec<u8>>;
}

/// Try each strategy in order; the first success wins.
pub fn first_success(
    strategies: &mut [Box<dyn CaptureStrategy>],
    page: &WidgetPage,
) -> Result<Vec<u8>> {
    let mut failures = Vec::new();
    for strategy in strategies.iter_mut() {
        match strategy.produce_raw_frame(page) {
            Ok(bytes) => return Ok(bytes),
            Err(err) => {
                log::debug!("capture strategy {} failed: {:#}", strategy.name(), err);
                failures.push(format!("{}: {:#}", strategy.name(), err));
            }
        }
    }
    if failures.is_empty() {
        return Err(anyhow!("no capture strategies configured"));
    }
    Err(anyhow!("all capture strategies failed ({})", failures.join("; ")))
}

/// An embedded frame source that actually points somewhere.
pub fn is_usable_embed(src: Option<&str>) -> bool {
    match src.map(str::trim) {
        None | Some("") => false,
        Some(src) => !src.starts_with("about:blank"),
    }
}

/// Open the backend matching `address`'s scheme. The session is not
/// navigated yet.
pub fn open_source(address: &str) -> Result<Box<dyn VideoSource>> {
    match backend_kind(address) {
        Some(SourceKind::Synthetic) => Ok(Box::new(SyntheticSource::new())),
        #[cfg(feature = "source-http")]
        Some(SourceKind::Http) => Ok(Box::new(HttpWidgetSource::new(HttpSourceConfig::default()))),
        #[cfg(not(feature = "source-http"))]
        Some(SourceKind::Http) => Err(anyhow!("http sources require the source-http feature")),
        None => Err(anyhow!(
            "unsupported source address '{}'; expected stub:// or http(s)://",
            address
        )),
    }
}

/// Backend family an address is served by.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Synthetic,
    Http,
}

pub fn backend_kind(address: &str) -> Option<SourceKind> {
    if address.starts_with("stub://") {
        Some(SourceKind::Synthetic)
    } else if address.starts_with("http://") || address.starts_with("https://") {
        Some(SourceKind::Http)
    } else {
        None
    }
}
