//! Config hot-reload.
//!
//! A `notify` watcher on the config file's directory forwards change events
//! to the watcher thread, which owns the `ConfigStore`. Bursts of events are
//! collapsed with a [`Debouncer`] and each reloaded snapshot is pushed onto
//! the scheduler's update queue.
//!
//! The directory is watched rather than the file so that editors (and
//! `ConfigStore` itself) replacing the file by rename keep being seen.
//!
//! Shutdown is best-effort: a change still inside its debounce window when
//! `stop` is called is dropped.

use anyhow::{anyhow, Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::{Config, ConfigStore};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1500);

/// Trailing-edge debounce: the first notification opens a window, anything
/// arriving inside it is absorbed, and the action fires once it has elapsed.
#[derive(Clone, Debug)]
pub struct Debouncer {
    window: Duration,
    pending_since: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending_since: None,
        }
    }

    /// Record a notification. Returns `true` if it opened a new window.
    pub fn notify(&mut self, at: Instant) -> bool {
        if self.pending_since.is_some() {
            return false;
        }
        self.pending_since = Some(at);
        true
    }

    /// `true` exactly once per window, as soon as it has elapsed.
    pub fn due(&mut self, at: Instant) -> bool {
        match self.pending_since {
            Some(since) if at.saturating_duration_since(since) >= self.window => {
                self.pending_since = None;
                true
            }
            _ => false,
        }
    }

    /// Time left in the open window, `None` when nothing is pending.
    pub fn remaining(&self, at: Instant) -> Option<Duration> {
        self.pending_since
            .map(|since| self.window.saturating_sub(at.saturating_duration_since(since)))
    }

    pub fn is_pending(&self) -> bool {
        self.pending_since.is_some()
    }
}

enum Signal {
    Changed,
    Stop,
}

fn read_text(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn touches(event: &Event, file_name: &OsString) -> bool {
    !matches!(event.kind, EventKind::Access(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
}

pub struct ConfigWatcher {
    store: ConfigStore,
    updates: Sender<Config>,
    debounce: Duration,
}

impl ConfigWatcher {
    pub fn new(store: ConfigStore, updates: Sender<Config>) -> Self {
        Self {
            store,
            updates,
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Start watching. Changes made after this returns are picked up.
    pub fn spawn(self) -> Result<WatcherHandle> {
        let path = self.store.path().to_path_buf();
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| anyhow!("config path {} has no file name", path.display()))?;
        let dir = watch_dir(&path);
        let loaded = read_text(&path);

        let (signals, rx) = mpsc::channel();
        let events = signals.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    if touches(&event, &file_name) {
                        let _ = events.send(Signal::Changed);
                    }
                }
                Err(err) => log::error!("config watch error: {}", err),
            }
        })
        .context("create config watcher")?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch {}", dir.display()))?;

        let join = std::thread::Builder::new()
            .name("config-watcher".into())
            .spawn(move || self.run(watcher, rx, loaded))?;
        Ok(WatcherHandle {
            signals,
            join: Some(join),
        })
    }

    /// `loaded` is the file contents as of the last load, including the
    /// store's own write-back; an event that leaves them unchanged is ignored.
    fn run(
        mut self,
        _watcher: RecommendedWatcher,
        signals: Receiver<Signal>,
        mut loaded: Option<String>,
    ) {
        log::info!(
            "watching {} (debounce {:?})",
            self.store.path().display(),
            self.debounce
        );
        let mut debouncer = Debouncer::new(self.debounce);
        loop {
            let signal = match debouncer.remaining(Instant::now()) {
                Some(wait) => signals.recv_timeout(wait),
                None => signals.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match signal {
                Ok(Signal::Changed) => {
                    if debouncer.notify(Instant::now()) {
                        log::debug!("config change detected");
                    }
                }
                Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            if !debouncer.due(Instant::now()) {
                continue;
            }
            if read_text(self.store.path()) == loaded {
                log::debug!("config {} unchanged", self.store.path().display());
                continue;
            }
            let reloaded = self.store.load();
            loaded = read_text(self.store.path());
            match reloaded {
                Ok(config) => {
                    if self.updates.send(config).is_err() {
                        log::info!("scheduler gone, config watcher exiting");
                        break;
                    }
                    log::info!("config {} reloaded", self.store.path().display());
                }
                Err(err) => log::error!("config reload failed: {:#}", err),
            }
        }
    }
}

#[derive(Debug)]
pub struct WatcherHandle {
    signals: Sender<Signal>,
    join: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    pub fn stop(mut self) -> Result<()> {
        let _ = self.signals.send(Signal::Stop);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("config watcher thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        let _ = self.signals.send(Signal::Stop);
    }
}
