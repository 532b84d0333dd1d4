//! Capture scheduler.
//!
//! `CaptureState::step` is the pure state machine: given the config and the
//! wall-clock time it updates the state and returns what should happen this
//! tick. `Scheduler` owns the session, the capture pipeline and the video
//! assembler and carries those actions out. It is the only writer of both
//! the live `Config` and `CaptureState`.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use std::sync::mpsc::{Receiver, RecvTimeoutError};

use crate::capture::FrameCapture;
use crate::config::{Config, TimeOfDay};
use crate::ingest::{backend_kind, open_source, VideoSource};
use crate::session::Session;
use crate::status::{LastFrame, StatusEvent, StatusSender};
use crate::video::VideoAssembler;

/// Format of the "stopped until" marker.
pub const NEXT_START_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Work,
    Off,
}

/// `Work` iff `work_start <= minutes(time) < work_end`.
pub fn mode_at(config: &Config, time: NaiveTime) -> Mode {
    if config.in_work_window(time) {
        Mode::Work
    } else {
        Mode::Off
    }
}

/// Next time the work window opens, strictly after `now`'s minute.
pub fn next_start(config: &Config, now: NaiveDateTime) -> NaiveDateTime {
    let today = now.date().and_time(config.work_start.to_naive_time());
    if TimeOfDay::of(now.time()) < config.work_start {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

/// Capture progress through today's window, minute resolution.
pub fn capture_progress(config: &Config, now: NaiveDateTime) -> StatusEvent {
    let start = config.work_start.minutes() as f64;
    let end = config.work_end.minutes() as f64;
    let current = TimeOfDay::of(now.time()).minutes();
    let percent = if end > start {
        ((current as f64 - start) / (end - start) * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    };
    let remaining = config.work_end.minutes().saturating_sub(current);
    StatusEvent::CaptureProgress {
        percent,
        current_time: now.format("%H:%M").to_string(),
        remaining_time: format!("{:02}:{:02}", remaining / 60, remaining % 60),
    }
}

/// What a tick asks the scheduler to do, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    EnterWork,
    EnterOff { next_start: NaiveDateTime },
    ReloadSession,
    Capture,
    EncodeVideo(NaiveDate),
}

#[derive(Clone, Debug, PartialEq)]
pub struct CaptureState {
    /// `None` until the first tick, so that tick always acts as a transition.
    pub mode: Option<Mode>,
    pub session_start: Option<NaiveDateTime>,
    pub video_date: NaiveDate,
    pub video_triggered: bool,
    pub last_preventive_reload: Option<NaiveDateTime>,
}

impl CaptureState {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            mode: None,
            session_start: None,
            video_date: today,
            video_triggered: false,
            last_preventive_reload: None,
        }
    }

    /// Allow another video job for the current date.
    pub fn reset_video_trigger(&mut self) {
        self.video_triggered = false;
    }

    /// Restart the preventive reload period at the next work tick.
    pub fn rearm_preventive_reload(&mut self) {
        self.last_preventive_reload = None;
    }

    pub fn step(&mut self, config: &Config, now: NaiveDateTime) -> Vec<Action> {
        let mut actions = Vec::new();
        let date = now.date();
        if date != self.video_date {
            log::info!("new capture date {}, video trigger reset", date);
            self.video_date = date;
            self.video_triggered = false;
        }

        let mode = mode_at(config, now.time());
        if self.mode != Some(mode) {
            match mode {
                Mode::Work => {
                    self.session_start = Some(now);
                    self.last_preventive_reload = Some(now);
                    actions.push(Action::EnterWork);
                }
                Mode::Off => {
                    self.session_start = None;
                    actions.push(Action::EnterOff {
                        next_start: next_start(config, now),
                    });
                }
            }
            self.mode = Some(mode);
        }

        match mode {
            Mode::Work => {
                if let Some(period) = config.session_reload_interval() {
                    let last = *self.last_preventive_reload.get_or_insert(now);
                    let due = (now - last).to_std().map(|e| e >= period).unwrap_or(false);
                    if due {
                        self.last_preventive_reload = Some(now);
                        actions.push(Action::ReloadSession);
                    }
                }
                actions.push(Action::Capture);
            }
            Mode::Off => {
                if !self.video_triggered && TimeOfDay::of(now.time()) >= config.video_cutoff {
                    self.video_triggered = true;
                    actions.push(Action::EncodeVideo(date));
                }
            }
        }
        actions
    }
}

/// Builds the source for an address when a config change moves the session
/// to another backend. [`open_source`] unless replaced for tests.
pub type SourceFactory = Box<dyn Fn(&str) -> Result<Box<dyn VideoSource>> + Send>;

pub struct Scheduler {
    config: Config,
    state: CaptureState,
    session: Session,
    capture: FrameCapture,
    assembler: VideoAssembler,
    status: StatusSender,
    updates: Receiver<Config>,
    open_source: SourceFactory,
}

impl Scheduler {
    pub fn new(
        config: Config,
        session: Session,
        capture: FrameCapture,
        assembler: VideoAssembler,
        status: StatusSender,
        updates: Receiver<Config>,
        today: NaiveDate,
    ) -> Self {
        Self {
            config,
            state: CaptureState::new(today),
            session,
            capture,
            assembler,
            status,
            updates,
            open_source: Box::new(open_source),
        }
    }

    pub fn with_source_factory(mut self, factory: SourceFactory) -> Self {
        self.open_source = factory;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Tick on the local clock every `capture_interval` until `stop` fires or
    /// its sender is dropped. The session is released on every exit path.
    pub fn run(mut self, stop: Receiver<()>) -> Result<()> {
        log::info!(
            "scheduler running: window {}-{}, cutoff {}, every {:?}",
            self.config.work_start,
            self.config.work_end,
            self.config.video_cutoff,
            self.config.capture_interval
        );
        loop {
            self.tick(Local::now().naive_local());
            match stop.recv_timeout(self.config.capture_interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        log::info!("scheduler stopping");
        self.session.close();
        Ok(())
    }

    pub fn tick(&mut self, now: NaiveDateTime) {
        self.apply_pending_update();
        for action in self.state.step(&self.config, now) {
            match action {
                Action::EnterWork => {
                    log::info!("capture started at {}", now.format("%Y-%m-%d %H:%M:%S"));
                    self.emit_status(now.date());
                }
                Action::EnterOff { next_start } => {
                    let next = next_start.format(NEXT_START_FORMAT).to_string();
                    log::info!("capture stopped, next start {}", next);
                    self.status.emit(StatusEvent::Status {
                        frame_count: self.capture.store().count_frames(now.date()),
                        last: LastFrame::StoppedUntil(next),
                    });
                    self.status.emit(StatusEvent::idle_progress());
                }
                Action::ReloadSession => {
                    log::info!("preventive session reload");
                    self.session.reload(&self.config.source_address);
                }
                Action::Capture => {
                    if self.capture.capture(&mut self.session, &self.config, now) {
                        self.emit_status(now.date());
                        self.status.emit(capture_progress(&self.config, now));
                    }
                }
                Action::EncodeVideo(date) => {
                    log::info!("video cutoff {} reached for {}", self.config.video_cutoff, date);
                    if let Err(err) = self.assembler.encode(date, &self.config) {
                        log::error!("video for {} failed: {:#}", date, err);
                    }
                }
            }
        }
    }

    /// Apply the newest queued snapshot, if any; older ones are dropped.
    fn apply_pending_update(&mut self) {
        let Some(next) = self.updates.try_iter().last() else {
            return;
        };
        if next == self.config {
            return;
        }
        if next.video_cutoff != self.config.video_cutoff {
            self.state.reset_video_trigger();
        }
        if next.session_reload_minutes != self.config.session_reload_minutes {
            self.state.rearm_preventive_reload();
        }
        let address_changed = next.source_address != self.config.source_address;
        self.config = next;
        log::info!("scheduler picked up new config");
        if address_changed {
            self.switch_source();
        }
    }

    /// Follow a changed `source_address`: re-navigate on the same backend, or
    /// open a new source when the address needs a different one.
    fn switch_source(&mut self) {
        let address = self.config.source_address.clone();
        if backend_kind(self.session.address()) == backend_kind(&address) {
            self.session.reload(&address);
            return;
        }
        match (self.open_source)(&address) {
            Ok(source) => {
                self.session.replace_source(source, &address);
            }
            Err(err) => {
                log::error!("cannot open source {}: {:#}; capture paused", address, err);
                self.session.close();
            }
        }
    }

    fn emit_status(&self, date: NaiveDate) {
        let last = match self.capture.last_frame() {
            Some(path) => LastFrame::Frame(path.to_path_buf()),
            None => LastFrame::None,
        };
        self.status.emit(StatusEvent::Status {
            frame_count: self.capture.store().count_frames(date),
            last,
        });
    }
}
