//! Status channel.
//!
//! A one-directional FIFO carrying typed events from the scheduler and the
//! video assembler to whoever renders them. Producers never hold a reference
//! back into a consumer; a consumer that goes away simply stops draining.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// What the status line shows next to the frame count.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum LastFrame {
    /// No frame captured yet today.
    None,
    /// Most recently accepted frame.
    Frame(PathBuf),
    /// Capture is stopped until the given local time (`%Y-%m-%d %H:%M`).
    StoppedUntil(String),
}

/// Events emitted on the status channel, in emission order.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusEvent {
    Status {
        frame_count: usize,
        last: LastFrame,
    },
    CaptureProgress {
        percent: f64,
        current_time: String,
        remaining_time: String,
    },
    VideoPrepare,
    VideoStart {
        total_frames: usize,
    },
    VideoProgress {
        done: usize,
        total: usize,
    },
    VideoDone {
        summary: String,
    },
    NoFrames {
        date: String,
    },
    DeleteDone {
        count: usize,
    },
    ConfigChanged,
}

impl StatusEvent {
    /// Idle capture-progress display used while the scheduler is off.
    pub fn idle_progress() -> Self {
        StatusEvent::CaptureProgress {
            percent: 0.0,
            current_time: "--:--".to_string(),
            remaining_time: "--:--".to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StatusEvent::Status { .. } => "status",
            StatusEvent::CaptureProgress { .. } => "capture_progress",
            StatusEvent::VideoPrepare => "video_prepare",
            StatusEvent::VideoStart { .. } => "video_start",
            StatusEvent::VideoProgress { .. } => "video_progress",
            StatusEvent::VideoDone { .. } => "video_done",
            StatusEvent::NoFrames { .. } => "no_frames",
            StatusEvent::DeleteDone { .. } => "delete_done",
            StatusEvent::ConfigChanged => "config_changed",
        }
    }
}

/// Create a connected sender/receiver pair.
pub fn channel() -> (StatusSender, StatusReceiver) {
    let (tx, rx) = mpsc::channel();
    (StatusSender { tx }, StatusReceiver { rx })
}

/// Producer half. Cheap to clone; emitting never blocks.
#[derive(Clone, Debug)]
pub struct StatusSender {
    tx: Sender<StatusEvent>,
}

impl StatusSender {
    pub fn emit(&self, event: StatusEvent) {
        let kind = event.kind();
        if self.tx.send(event).is_err() {
            log::debug!("status consumer gone, dropping {} event", kind);
        }
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct StatusReceiver {
    rx: Receiver<StatusEvent>,
}

impl StatusReceiver {
    /// Non-blocking drain of every pending event, oldest first.
    pub fn drain(&self) -> Vec<StatusEvent> {
        self.rx.try_iter().collect()
    }

    /// Wait up to `timeout` for the next event.
    ///
    /// Returns `None` on timeout or when every sender has been dropped.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<StatusEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_arrive_in_emission_order() {
        let (tx, rx) = channel();
        tx.emit(StatusEvent::VideoPrepare);
        tx.emit(StatusEvent::VideoStart { total_frames: 2 });
        tx.emit(StatusEvent::VideoProgress { done: 1, total: 2 });
        tx.emit(StatusEvent::DeleteDone { count: 0 });

        let kinds: Vec<_> = rx.drain().iter().map(StatusEvent::kind).collect();
        assert_eq!(
            kinds,
            vec!["video_prepare", "video_start", "video_progress", "delete_done"]
        );
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn emit_without_consumer_does_not_panic() {
        let (tx, rx) = channel();
        drop(rx);
        tx.emit(StatusEvent::ConfigChanged);
    }

    #[test]
    fn wire_format_is_tagged_by_kind() {
        let json = serde_json::to_value(StatusEvent::Status {
            frame_count: 3,
            last: LastFrame::StoppedUntil("2026-10-20 07:00".to_string()),
        })
        .unwrap();
        assert_eq!(json["kind"], "status");
        assert_eq!(json["frame_count"], 3);
        assert_eq!(json["last"]["type"], "stopped_until");
        assert_eq!(json["last"]["value"], "2026-10-20 07:00");
    }
}
