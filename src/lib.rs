//! Timelapse capture kernel.
//!
//! Pulls still frames from a remote live-video widget on a fixed cadence
//! during a daily work window, validates and stores them per date, and
//! assembles each day's frames into a video once the cutoff time has passed.
//!
//! # Module Structure
//!
//! - `config`: typed, validated config and the TOML-backed store
//! - `ingest`: video-source backends (`stub://`, `http(s)://`)
//! - `session`: session establishment and recovery
//! - `capture`: frame validation chain (`Verdict` / `Rejection`)
//! - `storage`: per-date frame and video layout
//! - `video`: daily video assembly and encoder backends
//! - `scheduler`: WORK/OFF state machine and the capture loop
//! - `watcher`: debounced config hot-reload
//! - `status`: one-directional status channel
//! - `instance`, `logging`, `ui`: process plumbing
//!
//! # Threads
//!
//! The scheduler thread owns the live `Config`, `CaptureState` and the
//! session. The watcher thread owns the `ConfigStore` and hands snapshots
//! over an mpsc queue. Status flows the other way over the status channel
//! to the main thread.

pub mod capture;
pub mod config;
pub mod ingest;
pub mod instance;
pub mod logging;
pub mod scheduler;
pub mod session;
pub mod status;
pub mod storage;
pub mod ui;
pub mod video;
pub mod watcher;

pub use capture::{CaptureLimits, CapturedFrame, FrameCapture, Rejection, Verdict};
pub use config::{Config, ConfigPatch, ConfigStore, TimeOfDay};
pub use ingest::{open_source, SyntheticFrame, SyntheticSource, VideoSource, WidgetRect};
pub use instance::InstanceLock;
pub use logging::{LogConfig, LogService};
pub use scheduler::{CaptureState, Mode, Scheduler};
pub use session::Session;
pub use status::{LastFrame, StatusEvent, StatusReceiver, StatusSender};
pub use storage::CaptureStore;
pub use video::{FfmpegBackend, RecordingBackend, VideoAssembler, VideoBackend, VideoOutcome};
pub use watcher::{ConfigWatcher, Debouncer, WatcherHandle};
