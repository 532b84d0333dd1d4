//! Terminal front end.
//!
//! `Ui::stage` wraps startup steps in a spinner (or a `==>` line).
//! `StatusConsole` is the status-channel consumer: it never talks back to the
//! scheduler, it only renders what it drains.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

use crate::status::{LastFrame, StatusEvent, StatusReceiver};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
    Json,
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
    disable_pretty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool, disable_pretty: bool) -> Self {
        Self {
            mode,
            is_tty,
            disable_pretty,
        }
    }

    pub fn from_args(ui_flag: Option<&str>, is_tty: bool, disable_pretty: bool) -> Self {
        let mode = match ui_flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            Some("json") => UiMode::Json,
            _ => UiMode::Auto,
        };
        Self::new(mode, is_tty, disable_pretty)
    }

    pub fn mode(&self) -> UiMode {
        self.mode
    }

    fn use_pretty(&self) -> bool {
        self.is_tty
            && match self.mode {
                UiMode::Pretty => true,
                UiMode::Auto => !self.disable_pretty,
                UiMode::Plain | UiMode::Json => false,
            }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.use_pretty() {
            let spinner = spinner();
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }
}

fn spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_draw_target(ProgressDrawTarget::stderr());
    spinner.enable_steady_tick(Duration::from_millis(120));
    let style = ProgressStyle::with_template("{spinner} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let message = format!("✔ {} ({})", self.name, format_duration(elapsed));
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// One-line human description of an event.
pub fn describe(event: &StatusEvent) -> String {
    match event {
        StatusEvent::Status { frame_count, last } => match last {
            LastFrame::None => format!("{} frames today", frame_count),
            LastFrame::Frame(path) => format!(
                "{} frames today, last {}",
                frame_count,
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string())
            ),
            LastFrame::StoppedUntil(next) => {
                format!("{} frames today, stopped until {}", frame_count, next)
            }
        },
        StatusEvent::CaptureProgress {
            percent,
            current_time,
            remaining_time,
        } => format!(
            "capture {:>3.0}% at {} ({} left)",
            percent, current_time, remaining_time
        ),
        StatusEvent::VideoPrepare => "preparing video".to_string(),
        StatusEvent::VideoStart { total_frames } => format!("encoding {} frames", total_frames),
        StatusEvent::VideoProgress { done, total } => format!("encoding {}/{}", done, total),
        StatusEvent::VideoDone { summary } => format!("video done: {}", summary),
        StatusEvent::NoFrames { date } => format!("no frames for {}, video skipped", date),
        StatusEvent::DeleteDone { count } => format!("deleted {} frames", count),
        StatusEvent::ConfigChanged => "config changed".to_string(),
    }
}

/// Serialized wire form used by `--ui json`.
pub fn to_json_line(event: &StatusEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(line) => Some(line),
        Err(err) => {
            log::warn!("cannot serialize {} event: {}", event.kind(), err);
            None
        }
    }
}

enum Render {
    Plain,
    Json,
    Pretty {
        spinner: ProgressBar,
        video: Option<ProgressBar>,
    },
}

/// Status-channel consumer.
pub struct StatusConsole {
    render: Render,
}

impl StatusConsole {
    pub fn new(ui: &Ui) -> Self {
        let render = if ui.mode() == UiMode::Json {
            Render::Json
        } else if ui.use_pretty() {
            Render::Pretty {
                spinner: spinner(),
                video: None,
            }
        } else {
            Render::Plain
        };
        Self { render }
    }

    /// Non-blocking: render everything currently queued.
    pub fn pump(&mut self, events: &StatusReceiver) -> usize {
        let drained = events.drain();
        for event in &drained {
            self.render(event);
        }
        drained.len()
    }

    pub fn render(&mut self, event: &StatusEvent) {
        match &mut self.render {
            Render::Plain => {
                if !matches!(event, StatusEvent::VideoProgress { .. }) {
                    eprintln!("{}", describe(event));
                }
            }
            Render::Json => {
                if let Some(line) = to_json_line(event) {
                    println!("{}", line);
                }
            }
            Render::Pretty { spinner, video } => match event {
                StatusEvent::VideoStart { total_frames } => {
                    let bar = ProgressBar::new(*total_frames as u64);
                    bar.set_draw_target(ProgressDrawTarget::stderr());
                    let style = ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar());
                    bar.set_style(style);
                    bar.set_message("encoding");
                    *video = Some(bar);
                }
                StatusEvent::VideoProgress { done, .. } => {
                    if let Some(bar) = video {
                        bar.set_position(*done as u64);
                    }
                }
                StatusEvent::VideoDone { summary } => {
                    if let Some(bar) = video.take() {
                        bar.finish_with_message(summary.clone());
                    } else {
                        spinner.println(describe(event));
                    }
                }
                StatusEvent::Status { .. } | StatusEvent::CaptureProgress { .. } => {
                    spinner.set_message(describe(event));
                }
                _ => spinner.println(describe(event)),
            },
        }
    }

    pub fn finish(self) {
        if let Render::Pretty { spinner, video } = self.render {
            if let Some(bar) = video {
                bar.abandon();
            }
            spinner.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn ui_flag_selects_mode() {
        assert_eq!(Ui::from_args(Some("json"), true, false).mode(), UiMode::Json);
        assert_eq!(Ui::from_args(Some("bogus"), true, false).mode(), UiMode::Auto);
        assert!(!Ui::from_args(Some("pretty"), false, false).use_pretty());
        assert!(!Ui::from_args(None, true, true).use_pretty());
    }

    #[test]
    fn events_read_naturally() {
        let status = StatusEvent::Status {
            frame_count: 12,
            last: LastFrame::Frame(PathBuf::from("capture/20261019/capt-20261019_09-00-00.jpg")),
        };
        assert_eq!(
            describe(&status),
            "12 frames today, last capt-20261019_09-00-00.jpg"
        );
        let stopped = StatusEvent::Status {
            frame_count: 0,
            last: LastFrame::StoppedUntil("2026-10-20 07:00".into()),
        };
        assert_eq!(describe(&stopped), "0 frames today, stopped until 2026-10-20 07:00");
        assert_eq!(
            describe(&StatusEvent::idle_progress()),
            "capture   0% at --:-- (--:-- left)"
        );
    }

    #[test]
    fn json_lines_carry_the_kind_tag() {
        let line = to_json_line(&StatusEvent::DeleteDone { count: 3 }).unwrap();
        assert_eq!(line, r#"{"kind":"delete_done","count":3}"#);
    }
}
