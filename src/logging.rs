//! Process log service.
//!
//! `LogService::init` installs `env_logger` (default filter `info`, `RUST_LOG`
//! overrides). With a log file configured, records go to a [`DailyLogFile`]:
//! the first write of a new local day renames `<base>.<ext>` to
//! `<base>_<YYYYMMDD>.<ext>` and prunes dated files older than `retain_days`.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate};
use env_logger::{Env, Target, WriteStyle};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const DEFAULT_RETAIN_DAYS: u32 = 5;

#[derive(Clone, Debug)]
pub struct LogConfig {
    /// `None` logs to stderr.
    pub file: Option<PathBuf>,
    pub retain_days: u32,
    pub default_filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: None,
            retain_days: DEFAULT_RETAIN_DAYS,
            default_filter: "info".to_string(),
        }
    }
}

pub struct DailyLogFile {
    path: PathBuf,
    retain_days: u32,
    day: NaiveDate,
    file: File,
}

impl DailyLogFile {
    /// Open (append) the current log. A file left over from an earlier day is
    /// rotated on the first write.
    pub fn open(path: impl Into<PathBuf>, retain_days: u32) -> Result<Self> {
        let path = path.into();
        let day = std::fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .map(|modified| DateTime::<Local>::from(modified).date_naive())
            .unwrap_or_else(|_| Local::now().date_naive());
        Self::open_for_day(path, retain_days, day)
    }

    fn open_for_day(path: PathBuf, retain_days: u32, day: NaiveDate) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create log dir {}", parent.display()))?;
            }
        }
        let file = open_append(&path)?;
        Ok(Self {
            path,
            retain_days,
            day,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<stem>_<YYYYMMDD>.<ext>` next to the current log.
    pub fn dated_path(&self, day: NaiveDate) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "log".to_string());
        let name = match self.path.extension() {
            Some(ext) => format!("{}_{}.{}", stem, day.format("%Y%m%d"), ext.to_string_lossy()),
            None => format!("{}_{}", stem, day.format("%Y%m%d")),
        };
        self.path.with_file_name(name)
    }

    /// Rotate when `today` is past the day the current file belongs to.
    pub fn rotate_if_needed(&mut self, today: NaiveDate) -> Result<bool> {
        if today <= self.day {
            return Ok(false);
        }
        self.file.flush()?;
        let dated = self.dated_path(self.day);
        if dated.exists() {
            let mut target = open_append(&dated)?;
            let mut current = File::open(&self.path)?;
            io::copy(&mut current, &mut target)?;
            std::fs::remove_file(&self.path)?;
        } else {
            std::fs::rename(&self.path, &dated)
                .with_context(|| format!("rotate {} -> {}", self.path.display(), dated.display()))?;
        }
        self.file = open_append(&self.path)?;
        self.day = today;
        self.prune(today)?;
        Ok(true)
    }

    /// Delete dated logs older than `retain_days` before `today`.
    pub fn prune(&self, today: NaiveDate) -> Result<usize> {
        let cutoff = today - ChronoDuration::days(self.retain_days as i64);
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let stem = self
            .path
            .file_stem()
            .map(|s| format!("{}_", s.to_string_lossy()))
            .unwrap_or_default();
        let mut removed = 0;
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(day) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix(&stem))
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y%m%d").ok())
            else {
                continue;
            };
            if day < cutoff {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {}", path.display()))
}

impl Write for DailyLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Err(err) = self.rotate_if_needed(Local::now().date_naive()) {
            // the logger itself cannot be used from inside its own sink
            eprintln!("log rotation failed: {:#}", err);
        }
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Cloneable handle so the service can flush the sink env_logger owns.
#[derive(Clone)]
struct SharedLogFile(Arc<Mutex<DailyLogFile>>);

impl Write for SharedLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log file poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log file poisoned"))?
            .flush()
    }
}

/// Process-wide logging lifecycle.
pub struct LogService {
    file: Option<SharedLogFile>,
}

impl LogService {
    pub fn init(config: &LogConfig) -> Result<Self> {
        let mut builder =
            env_logger::Builder::from_env(Env::default().default_filter_or(&config.default_filter));
        let file = match &config.file {
            Some(path) => {
                let shared = SharedLogFile(Arc::new(Mutex::new(DailyLogFile::open(
                    path,
                    config.retain_days,
                )?)));
                builder
                    .target(Target::Pipe(Box::new(shared.clone())))
                    .write_style(WriteStyle::Never);
                Some(shared)
            }
            None => None,
        };
        builder
            .try_init()
            .map_err(|e| anyhow!("logger already initialised: {}", e))?;
        if let Some(path) = &config.file {
            log::info!("logging to {} (keeping {} days)", path.display(), config.retain_days);
        }
        Ok(Self { file })
    }

    pub fn shutdown(self) {
        log::logger().flush();
        if let Some(mut file) = self.file {
            if let Err(err) = file.flush() {
                eprintln!("log flush failed: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    #[test]
    fn new_day_rotates_and_prunes() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("capture.log");
        std::fs::write(dir.path().join("capture_20261001.log"), "old")?;
        std::fs::write(dir.path().join("capture_20261016.log"), "recent")?;
        std::fs::write(dir.path().join("notes.txt"), "keep")?;

        let mut log = DailyLogFile::open_for_day(path.clone(), 5, day(19))?;
        log.file.write_all(b"monday\n")?;
        assert!(!log.rotate_if_needed(day(19))?);
        assert!(log.rotate_if_needed(day(20))?);
        log.file.write_all(b"tuesday\n")?;
        log.flush()?;

        assert_eq!(
            std::fs::read_to_string(dir.path().join("capture_20261019.log"))?,
            "monday\n"
        );
        assert_eq!(std::fs::read_to_string(&path)?, "tuesday\n");
        assert!(!dir.path().join("capture_20261001.log").exists());
        assert!(dir.path().join("capture_20261016.log").exists());
        assert!(dir.path().join("notes.txt").exists());
        Ok(())
    }

    #[test]
    fn rotation_appends_to_an_existing_dated_log() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("capture.log");
        std::fs::write(dir.path().join("capture_20261019.log"), "early\n")?;
        let mut log = DailyLogFile::open_for_day(path, 5, day(19))?;
        log.file.write_all(b"late\n")?;
        log.rotate_if_needed(day(20))?;
        assert_eq!(
            std::fs::read_to_string(dir.path().join("capture_20261019.log"))?,
            "early\nlate\n"
        );
        Ok(())
    }
}
