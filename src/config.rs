use anyhow::{anyhow, Context, Result};
use chrono::{NaiveTime, Timelike};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use toml::{Table, Value};

use crate::status::{StatusEvent, StatusSender};

pub const DEFAULT_CONFIG_PATH: &str = "timelapse.toml";
pub const MIN_IMAGE_QUALITY: u8 = 75;
pub const MAX_IMAGE_QUALITY: u8 = 100;

const DEFAULT_SOURCE_ADDRESS: &str = "http://127.0.0.1:8080/player";
const DEFAULT_WORK_START_MIN: u16 = 7 * 60;
const DEFAULT_WORK_END_MIN: u16 = 20 * 60;
const DEFAULT_VIDEO_CUTOFF_MIN: u16 = 20 * 60 + 1;
const DEFAULT_CAPTURE_INTERVAL_SECS: u64 = 15;
const DEFAULT_FRAME_RATE: u32 = 60;
const DEFAULT_IMAGE_QUALITY: u8 = 95;

const KEY_SOURCE_ADDRESS: &str = "source_address";
const KEY_WORK_START: &str = "work_start";
const KEY_WORK_END: &str = "work_end";
const KEY_CAPTURE_INTERVAL: &str = "capture_interval";
const KEY_VIDEO_CUTOFF: &str = "video_cutoff";
const KEY_FRAME_RATE: &str = "frame_rate";
const KEY_DELETE_FRAMES: &str = "delete_frames_after_video";
const KEY_IMAGE_QUALITY: &str = "image_quality";
const KEY_SESSION_RELOAD: &str = "session_reload_minutes";

const MINUTES_PER_DAY: u32 = 24 * 60;

// -------------------- Time of day --------------------

/// Minute-resolution local time of day, `00:00..=23:59`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct TimeOfDay {
    minutes: u16,
}

impl TimeOfDay {
    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(Self {
            minutes: (hour * 60 + minute) as u16,
        })
    }

    pub fn from_minutes(minutes: u32) -> Option<Self> {
        if minutes >= MINUTES_PER_DAY {
            return None;
        }
        Some(Self {
            minutes: minutes as u16,
        })
    }

    /// Truncates seconds.
    pub fn of(time: NaiveTime) -> Self {
        Self {
            minutes: (time.hour() * 60 + time.minute()) as u16,
        }
    }

    pub fn minutes(self) -> u32 {
        self.minutes as u32
    }

    pub fn hour(self) -> u32 {
        self.minutes() / 60
    }

    pub fn minute(self) -> u32 {
        self.minutes() % 60
    }

    /// The following minute, or `None` at 23:59.
    pub fn next_minute(self) -> Option<Self> {
        Self::from_minutes(self.minutes() + 1)
    }

    pub fn to_naive_time(self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour(), self.minute(), 0).unwrap_or(NaiveTime::MIN)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseTimeError(String);

impl fmt::Display for ParseTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid time of day '{}': expected HH:MM", self.0)
    }
}

impl std::error::Error for ParseTimeError {}

impl TryFrom<String> for TimeOfDay {
    type Error = ParseTimeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl FromStr for TimeOfDay {
    type Err = ParseTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseTimeError(s.to_string());
        let (hour, minute) = s.trim().split_once(':').ok_or_else(err)?;
        let hour: u32 = hour.trim().parse().map_err(|_| err())?;
        let minute: u32 = minute.trim().parse().map_err(|_| err())?;
        Self::from_hm(hour, minute).ok_or_else(err)
    }
}

// -------------------- Validation outcomes --------------------

/// A document the store could not accept.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigError {
    /// A key holds a value of the wrong shape.
    Malformed(String),
    OutOfRange {
        key: &'static str,
        message: String,
    },
    Unorderable {
        key: &'static str,
        message: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Malformed(message) => write!(f, "malformed config: {}", message),
            ConfigError::OutOfRange { key, message } | ConfigError::Unorderable { key, message } => {
                write!(f, "{}: {}", key, message)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// A value the store rewrote instead of rejecting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Correction {
    pub key: &'static str,
    pub from: String,
    pub to: String,
}

impl fmt::Display for Correction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} corrected from {} to {}", self.key, self.from, self.to)
    }
}

// -------------------- Config --------------------

/// Validated schedule and quality parameters.
///
/// Only the store produces these; everything else reads them.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub source_address: String,
    pub work_start: TimeOfDay,
    pub work_end: TimeOfDay,
    pub capture_interval: Duration,
    pub video_cutoff: TimeOfDay,
    pub frame_rate: u32,
    pub delete_frames_after_video: bool,
    pub image_quality: u8,
    /// Preventive session reload period in minutes; 0 disables it.
    pub session_reload_minutes: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_address: DEFAULT_SOURCE_ADDRESS.to_string(),
            work_start: TimeOfDay {
                minutes: DEFAULT_WORK_START_MIN,
            },
            work_end: TimeOfDay {
                minutes: DEFAULT_WORK_END_MIN,
            },
            capture_interval: Duration::from_secs(DEFAULT_CAPTURE_INTERVAL_SECS),
            video_cutoff: TimeOfDay {
                minutes: DEFAULT_VIDEO_CUTOFF_MIN,
            },
            frame_rate: DEFAULT_FRAME_RATE,
            delete_frames_after_video: false,
            image_quality: DEFAULT_IMAGE_QUALITY,
            session_reload_minutes: 0,
        }
    }
}

impl Config {
    /// Parse a config document, back-filling missing keys with defaults.
    ///
    /// Ordering problems are corrected and reported; malformed values fail the
    /// whole document.
    pub fn from_document(doc: &Table) -> Result<(Self, Vec<Correction>), ConfigError> {
        let file = ConfigFile::deserialize(Value::Table(doc.clone()))
            .map_err(|e| ConfigError::Malformed(e.to_string()))?;
        Self::from_file(file)
    }

    fn from_file(file: ConfigFile) -> Result<(Self, Vec<Correction>), ConfigError> {
        let defaults = Config::default();
        let source_address = match file.source_address {
            None => defaults.source_address,
            Some(address) if !address.trim().is_empty() => address.trim().to_string(),
            Some(_) => {
                return Err(ConfigError::OutOfRange {
                    key: KEY_SOURCE_ADDRESS,
                    message: "must not be empty".to_string(),
                })
            }
        };
        let capture_interval = match file.capture_interval {
            Some(seconds) => seconds.to_duration()?,
            None => defaults.capture_interval,
        };
        let delete_frames_after_video = match file.delete_frames_after_video {
            Some(flag) => flag.to_bool(KEY_DELETE_FRAMES)?,
            None => defaults.delete_frames_after_video,
        };

        let mut corrections = Vec::new();
        let image_quality = match file.image_quality {
            None => defaults.image_quality,
            Some(quality) => {
                let clamped =
                    quality.clamp(MIN_IMAGE_QUALITY as i64, MAX_IMAGE_QUALITY as i64) as u8;
                if clamped as i64 != quality {
                    corrections.push(Correction {
                        key: KEY_IMAGE_QUALITY,
                        from: quality.to_string(),
                        to: clamped.to_string(),
                    });
                }
                clamped
            }
        };

        let mut config = Config {
            source_address,
            work_start: file.work_start.unwrap_or(defaults.work_start),
            work_end: file.work_end.unwrap_or(defaults.work_end),
            capture_interval,
            video_cutoff: file.video_cutoff.unwrap_or(defaults.video_cutoff),
            frame_rate: file.frame_rate.unwrap_or(defaults.frame_rate),
            delete_frames_after_video,
            image_quality,
            session_reload_minutes: file
                .session_reload_minutes
                .unwrap_or(defaults.session_reload_minutes),
        };
        corrections.extend(config.normalize()?);
        Ok((config, corrections))
    }

    /// Enforce `work_start < work_end < video_cutoff` and the quality range.
    ///
    /// Idempotent: a normalized config normalizes to itself with no corrections.
    pub fn normalize(&mut self) -> Result<Vec<Correction>, ConfigError> {
        if self.capture_interval.is_zero() {
            return Err(ConfigError::OutOfRange {
                key: KEY_CAPTURE_INTERVAL,
                message: "must be > 0".to_string(),
            });
        }
        if self.frame_rate == 0 {
            return Err(ConfigError::OutOfRange {
                key: KEY_FRAME_RATE,
                message: "must be > 0".to_string(),
            });
        }

        let mut corrections = Vec::new();
        if self.work_end <= self.work_start {
            let end = self
                .work_start
                .next_minute()
                .ok_or_else(|| ConfigError::Unorderable {
                    key: KEY_WORK_END,
                    message: format!("no time of day after work_start {}", self.work_start),
                })?;
            corrections.push(Correction {
                key: KEY_WORK_END,
                from: self.work_end.to_string(),
                to: end.to_string(),
            });
            self.work_end = end;
        }
        if self.video_cutoff <= self.work_end {
            let cutoff = self
                .work_end
                .next_minute()
                .ok_or_else(|| ConfigError::Unorderable {
                    key: KEY_VIDEO_CUTOFF,
                    message: format!("no time of day after work_end {}", self.work_end),
                })?;
            corrections.push(Correction {
                key: KEY_VIDEO_CUTOFF,
                from: self.video_cutoff.to_string(),
                to: cutoff.to_string(),
            });
            self.video_cutoff = cutoff;
        }
        let quality = self.image_quality.clamp(MIN_IMAGE_QUALITY, MAX_IMAGE_QUALITY);
        if quality != self.image_quality {
            corrections.push(Correction {
                key: KEY_IMAGE_QUALITY,
                from: self.image_quality.to_string(),
                to: quality.to_string(),
            });
            self.image_quality = quality;
        }
        Ok(corrections)
    }

    /// Write every known key into `doc`, leaving other keys untouched.
    pub fn write_to(&self, doc: &mut Table) {
        doc.insert(
            KEY_SOURCE_ADDRESS.to_string(),
            Value::String(self.source_address.clone()),
        );
        doc.insert(
            KEY_WORK_START.to_string(),
            Value::String(self.work_start.to_string()),
        );
        doc.insert(
            KEY_WORK_END.to_string(),
            Value::String(self.work_end.to_string()),
        );
        let secs = self.capture_interval.as_secs_f64();
        let interval = if self.capture_interval.subsec_nanos() == 0 && secs <= i64::MAX as f64 {
            Value::Integer(self.capture_interval.as_secs() as i64)
        } else {
            Value::Float(secs)
        };
        doc.insert(KEY_CAPTURE_INTERVAL.to_string(), interval);
        doc.insert(
            KEY_VIDEO_CUTOFF.to_string(),
            Value::String(self.video_cutoff.to_string()),
        );
        doc.insert(
            KEY_FRAME_RATE.to_string(),
            Value::Integer(self.frame_rate as i64),
        );
        doc.insert(
            KEY_DELETE_FRAMES.to_string(),
            Value::Boolean(self.delete_frames_after_video),
        );
        doc.insert(
            KEY_IMAGE_QUALITY.to_string(),
            Value::Integer(self.image_quality as i64),
        );
        doc.insert(
            KEY_SESSION_RELOAD.to_string(),
            Value::Integer(self.session_reload_minutes as i64),
        );
    }

    /// `work_start <= t < work_end`, minute resolution.
    pub fn in_work_window(&self, time: NaiveTime) -> bool {
        let now = TimeOfDay::of(time);
        self.work_start <= now && now < self.work_end
    }

    pub fn session_reload_interval(&self) -> Option<Duration> {
        if self.session_reload_minutes == 0 {
            None
        } else {
            Some(Duration::from_secs(self.session_reload_minutes as u64 * 60))
        }
    }
}

// -------------------- On-disk shape --------------------

/// Known keys of the config document. Anything else in the file is ignored
/// here and preserved by [`ConfigStore`], which edits the parsed table.
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    source_address: Option<String>,
    work_start: Option<TimeOfDay>,
    work_end: Option<TimeOfDay>,
    capture_interval: Option<Seconds>,
    video_cutoff: Option<TimeOfDay>,
    frame_rate: Option<u32>,
    delete_frames_after_video: Option<Flag>,
    image_quality: Option<i64>,
    session_reload_minutes: Option<u32>,
}

/// `capture_interval = 15` or `capture_interval = 2.5`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Seconds {
    Whole(i64),
    Fractional(f64),
}

impl Seconds {
    fn to_duration(&self) -> Result<Duration, ConfigError> {
        let seconds = match *self {
            Seconds::Whole(n) => n as f64,
            Seconds::Fractional(f) => f,
        };
        match Duration::try_from_secs_f64(seconds) {
            Ok(interval) if !interval.is_zero() => Ok(interval),
            _ => Err(ConfigError::OutOfRange {
                key: KEY_CAPTURE_INTERVAL,
                message: format!("must be > 0, got {}", seconds),
            }),
        }
    }
}

/// A boolean, or the strings `"true"` / `"false"` in any case.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Text(String),
}

impl Flag {
    fn to_bool(&self, key: &'static str) -> Result<bool, ConfigError> {
        match self {
            Flag::Bool(value) => Ok(*value),
            Flag::Text(text) if text.eq_ignore_ascii_case("true") => Ok(true),
            Flag::Text(text) if text.eq_ignore_ascii_case("false") => Ok(false),
            Flag::Text(text) => Err(ConfigError::Malformed(format!(
                "{}: expected true or false, got '{}'",
                key, text
            ))),
        }
    }
}

// -------------------- Partial updates --------------------

/// Fields to replace in [`ConfigStore::update`]; `None` keeps the current value.
#[derive(Clone, Debug, Default)]
pub struct ConfigPatch {
    pub source_address: Option<String>,
    pub work_start: Option<TimeOfDay>,
    pub work_end: Option<TimeOfDay>,
    pub capture_interval: Option<Duration>,
    pub video_cutoff: Option<TimeOfDay>,
    pub frame_rate: Option<u32>,
    pub delete_frames_after_video: Option<bool>,
    pub image_quality: Option<u8>,
    pub session_reload_minutes: Option<u32>,
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.source_address.is_none()
            && self.work_start.is_none()
            && self.work_end.is_none()
            && self.capture_interval.is_none()
            && self.video_cutoff.is_none()
            && self.frame_rate.is_none()
            && self.delete_frames_after_video.is_none()
            && self.image_quality.is_none()
            && self.session_reload_minutes.is_none()
    }

    pub fn apply_to(&self, base: &Config) -> Config {
        Config {
            source_address: self
                .source_address
                .clone()
                .unwrap_or_else(|| base.source_address.clone()),
            work_start: self.work_start.unwrap_or(base.work_start),
            work_end: self.work_end.unwrap_or(base.work_end),
            capture_interval: self.capture_interval.unwrap_or(base.capture_interval),
            video_cutoff: self.video_cutoff.unwrap_or(base.video_cutoff),
            frame_rate: self.frame_rate.unwrap_or(base.frame_rate),
            delete_frames_after_video: self
                .delete_frames_after_video
                .unwrap_or(base.delete_frames_after_video),
            image_quality: self.image_quality.unwrap_or(base.image_quality),
            session_reload_minutes: self
                .session_reload_minutes
                .unwrap_or(base.session_reload_minutes),
        }
    }
}

// -------------------- Store --------------------

/// Owner of the persisted config document.
///
/// Unknown keys survive every load/save because the store edits the parsed
/// table in place. A document that fails validation is replaced by defaults
/// and written back.
pub struct ConfigStore {
    path: PathBuf,
    document: Table,
    current: Config,
    loaded: bool,
    status: Option<StatusSender>,
}

impl ConfigStore {
    /// Open and load the store at `path`, creating it from defaults if absent.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let mut store = Self {
            path: path.into(),
            document: Table::new(),
            current: Config::default(),
            loaded: false,
            status: None,
        };
        store.load()?;
        Ok(store)
    }

    /// Report `config_changed` on this channel when the cutoff moves.
    pub fn with_status(mut self, status: StatusSender) -> Self {
        self.status = Some(status);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> &Config {
        &self.current
    }

    /// Re-read the backing file. Never fails on content, only on I/O while
    /// writing the (possibly corrected or defaulted) document back.
    pub fn load(&mut self) -> Result<Config> {
        let (config, document) = match self.read_document() {
            Ok(None) => {
                log::info!(
                    "config {} not found, writing defaults",
                    self.path.display()
                );
                (Config::default(), Table::new())
            }
            Ok(Some(doc)) => match Config::from_document(&doc) {
                Ok((config, corrections)) => {
                    for correction in &corrections {
                        log::warn!("config {}: {}", self.path.display(), correction);
                    }
                    (config, doc)
                }
                Err(errors) => {
                    log::error!(
                        "invalid config {}: {}; falling back to defaults",
                        self.path.display(),
                        errors
                    );
                    (Config::default(), doc)
                }
            },
            Err(err) => {
                log::error!(
                    "unreadable config {}: {:#}; falling back to defaults",
                    self.path.display(),
                    err
                );
                (Config::default(), Table::new())
            }
        };
        self.document = document;
        self.commit(config.clone())?;
        Ok(config)
    }

    /// Persist `config` as the current value.
    pub fn save(&mut self, config: &Config) -> Result<()> {
        let mut config = config.clone();
        for correction in config.normalize()? {
            log::warn!("config {}: {}", self.path.display(), correction);
        }
        self.commit(config)
    }

    /// Merge `patch` into the current value, re-validate and persist.
    pub fn update(&mut self, patch: &ConfigPatch) -> Result<Config> {
        let mut next = patch.apply_to(&self.current);
        for correction in next.normalize()? {
            log::warn!("config {}: {}", self.path.display(), correction);
        }
        log::info!("config {} updated: {:?}", self.path.display(), patch);
        self.commit(next.clone())?;
        Ok(next)
    }

    fn commit(&mut self, config: Config) -> Result<()> {
        config.write_to(&mut self.document);
        self.persist()?;
        let cutoff_changed = self.loaded && self.current.video_cutoff != config.video_cutoff;
        if cutoff_changed {
            log::info!(
                "video cutoff changed {} -> {}",
                self.current.video_cutoff,
                config.video_cutoff
            );
        }
        self.current = config;
        self.loaded = true;
        if cutoff_changed {
            if let Some(status) = &self.status {
                status.emit(StatusEvent::ConfigChanged);
            }
        }
        Ok(())
    }

    fn read_document(&self) -> Result<Option<Table>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| anyhow!("failed to read config file {}: {}", self.path.display(), e))?;
        let doc: Table = toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", self.path.display(), e))?;
        Ok(Some(doc))
    }

    /// Writes only when the rendered document differs from the file, so a
    /// reload of an already-normalized file leaves it untouched.
    fn persist(&self) -> Result<()> {
        let rendered = toml::to_string_pretty(&self.document).context("serialize config")?;
        if std::fs::read_to_string(&self.path).ok().as_deref() == Some(rendered.as_str()) {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create config dir {}", parent.display()))?;
            }
        }
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, rendered)
            .with_context(|| format!("write config {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace config {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status;
    use tempfile::TempDir;

    fn tod(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn doc(raw: &str) -> Table {
        toml::from_str(raw).unwrap()
    }

    #[test]
    fn time_of_day_parses_and_formats() {
        assert_eq!(tod("07:00").minutes(), 420);
        assert_eq!(tod("7:05").to_string(), "07:05");
        assert_eq!(tod("23:59").next_minute(), None);
        assert!("24:00".parse::<TimeOfDay>().is_err());
        assert!("12:60".parse::<TimeOfDay>().is_err());
        assert!("noon".parse::<TimeOfDay>().is_err());
    }

    #[test]
    fn missing_keys_are_back_filled() {
        let (cfg, corrections) = Config::from_document(&doc("frame_rate = 30")).unwrap();
        assert!(corrections.is_empty());
        assert_eq!(cfg.frame_rate, 30);
        assert_eq!(cfg.work_start, tod("07:00"));
        assert_eq!(cfg.video_cutoff, tod("20:01"));
        assert_eq!(cfg.capture_interval, Duration::from_secs(15));
    }

    #[test]
    fn end_not_after_start_is_moved_one_minute_past_start() {
        for (start, end) in [("09:00", "09:00"), ("09:00", "08:30"), ("00:00", "00:00")] {
            let raw = format!("work_start = \"{start}\"\nwork_end = \"{end}\"\nvideo_cutoff = \"23:00\"");
            let (cfg, corrections) = Config::from_document(&doc(&raw)).unwrap();
            assert!(cfg.work_end > cfg.work_start);
            assert_eq!(cfg.work_end.minutes(), cfg.work_start.minutes() + 1);
            assert_eq!(corrections[0].key, KEY_WORK_END);
        }
    }

    #[test]
    fn cutoff_not_after_end_is_moved_one_minute_past_end() {
        let raw = "work_start = \"07:00\"\nwork_end = \"20:00\"\nvideo_cutoff = \"19:00\"";
        let (cfg, corrections) = Config::from_document(&doc(raw)).unwrap();
        assert_eq!(cfg.video_cutoff, tod("20:01"));
        assert_eq!(corrections.len(), 1);
        assert_eq!(corrections[0].from, "19:00");
    }

    #[test]
    fn uncorrectable_ordering_is_an_error() {
        let raw = "work_start = \"23:59\"";
        assert!(Config::from_document(&doc(raw)).is_err());
    }

    #[test]
    fn malformed_values_fail_the_whole_document() {
        for raw in [
            "capture_interval = \"often\"",
            "frame_rate = 29.97",
            "work_start = \"7am\"",
            "capture_interval = 0",
            "frame_rate = -1",
            "delete_frames_after_video = \"maybe\"",
            "delete_frames_after_video = 1",
            "session_reload_minutes = -5",
            "work_end = 900",
            "source_address = \"  \"",
        ] {
            assert!(Config::from_document(&doc(raw)).is_err(), "{raw}");
        }
    }

    #[test]
    fn fractional_interval_and_string_bool_are_accepted() {
        let raw = "capture_interval = 2.5\ndelete_frames_after_video = \"True\"";
        let (cfg, _) = Config::from_document(&doc(raw)).unwrap();
        assert_eq!(cfg.capture_interval, Duration::from_millis(2500));
        assert!(cfg.delete_frames_after_video);
    }

    #[test]
    fn whole_interval_and_unknown_keys_deserialize() {
        let raw = "capture_interval = 30\nsession_reload_minutes = 45\ncamera = \"north\"";
        let (cfg, corrections) = Config::from_document(&doc(raw)).unwrap();
        assert!(corrections.is_empty());
        assert_eq!(cfg.capture_interval, Duration::from_secs(30));
        assert_eq!(cfg.session_reload_interval(), Some(Duration::from_secs(45 * 60)));
    }

    #[test]
    fn quality_is_clamped_into_range() {
        let (cfg, corrections) = Config::from_document(&doc("image_quality = 300")).unwrap();
        assert_eq!(cfg.image_quality, MAX_IMAGE_QUALITY);
        assert_eq!(corrections[0].from, "300");
        let (cfg, _) = Config::from_document(&doc("image_quality = 10")).unwrap();
        assert_eq!(cfg.image_quality, MIN_IMAGE_QUALITY);
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("timelapse.toml");
        let store = ConfigStore::open(&path).unwrap();
        assert_eq!(store.current(), &Config::default());
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("work_start = \"07:00\""));
    }

    #[test]
    fn corrected_values_persist_and_reload_identically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("timelapse.toml");
        std::fs::write(
            &path,
            "work_start = \"10:00\"\nwork_end = \"09:00\"\nvideo_cutoff = \"08:00\"\n",
        )
        .unwrap();

        let first = ConfigStore::open(&path).unwrap().current().clone();
        assert_eq!(first.work_end, tod("10:01"));
        assert_eq!(first.video_cutoff, tod("10:02"));
        let on_disk = std::fs::read_to_string(&path).unwrap();

        let second = ConfigStore::open(&path).unwrap().current().clone();
        assert_eq!(first, second);
        assert_eq!(on_disk, std::fs::read_to_string(&path).unwrap());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults_and_is_rewritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("timelapse.toml");
        std::fs::write(&path, "frame_rate = \"fast\"\nwork_start = \"06:00\"\n").unwrap();

        let store = ConfigStore::open(&path).unwrap();
        assert_eq!(store.current(), &Config::default());
        let reparsed: Table = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reparsed["frame_rate"].as_integer(), Some(60));
        assert_eq!(reparsed["work_start"].as_str(), Some("07:00"));
    }

    #[test]
    fn unknown_keys_survive_a_save() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("timelapse.toml");
        std::fs::write(&path, "operator_note = \"north camera\"\nframe_rate = 24\n").unwrap();

        let mut store = ConfigStore::open(&path).unwrap();
        let mut cfg = store.current().clone();
        cfg.frame_rate = 25;
        store.save(&cfg).unwrap();

        let reparsed: Table = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reparsed["operator_note"].as_str(), Some("north camera"));
        assert_eq!(reparsed["frame_rate"].as_integer(), Some(25));
    }

    #[test]
    fn update_reports_cutoff_changes_only() {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = status::channel();
        let mut store = ConfigStore::open(dir.path().join("timelapse.toml"))
            .unwrap()
            .with_status(tx);

        let patch = ConfigPatch {
            frame_rate: Some(30),
            ..ConfigPatch::default()
        };
        store.update(&patch).unwrap();
        assert!(rx.drain().is_empty());

        let patch = ConfigPatch {
            video_cutoff: Some(tod("21:30")),
            ..ConfigPatch::default()
        };
        let cfg = store.update(&patch).unwrap();
        assert_eq!(cfg.video_cutoff, tod("21:30"));
        assert_eq!(rx.drain(), vec![StatusEvent::ConfigChanged]);
    }

    #[test]
    fn update_rejects_zero_interval() {
        let dir = TempDir::new().unwrap();
        let mut store = ConfigStore::open(dir.path().join("timelapse.toml")).unwrap();
        let patch = ConfigPatch {
            capture_interval: Some(Duration::ZERO),
            ..ConfigPatch::default()
        };
        assert!(store.update(&patch).is_err());
        assert_eq!(store.current(), &Config::default());
    }

    #[test]
    fn work_window_is_half_open() {
        let cfg = Config::default();
        let at = |h, m| NaiveTime::from_hms_opt(h, m, 30).unwrap();
        assert!(!cfg.in_work_window(at(6, 59)));
        assert!(cfg.in_work_window(at(7, 0)));
        assert!(cfg.in_work_window(at(19, 59)));
        assert!(!cfg.in_work_window(at(20, 0)));
    }
}
