//! On-disk artifact layout.
//!
//! ```text
//! <root>/<YYYYMMDD>/capt-<YYYYMMDD>_<HH-MM-SS>.jpg   accepted frames
//! <root>/<YYYYMMDD>/capt-<YYYYMMDD>_<HH-MM-SS>_NNN.jpg  later frames in the same second
//! <root>/<YYYYMMDD>/video-<YYYYMMDD>[_N].mp4          assembled video
//! ```
//!
//! Frame names sort lexically in capture order, which is the order the video
//! assembler writes them in.

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use std::path::{Path, PathBuf};

pub const DEFAULT_CAPTURE_ROOT: &str = "capture";
pub const FRAME_PREFIX: &str = "capt-";
pub const FRAME_EXTENSION: &str = "jpg";
pub const VIDEO_PREFIX: &str = "video-";
pub const VIDEO_EXTENSION: &str = "mp4";

#[derive(Clone, Debug)]
pub struct CaptureStore {
    root: PathBuf,
}

impl CaptureStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn date_key(date: NaiveDate) -> String {
        date.format("%Y%m%d").to_string()
    }

    pub fn date_dir(&self, date: NaiveDate) -> PathBuf {
        self.root.join(Self::date_key(date))
    }

    /// Deterministic frame path for a capture at `at` (second resolution).
    pub fn frame_path(&self, at: NaiveDateTime) -> PathBuf {
        let name = format!(
            "{}{}.{}",
            FRAME_PREFIX,
            at.format("%Y%m%d_%H-%M-%S"),
            FRAME_EXTENSION
        );
        self.date_dir(at.date()).join(name)
    }

    /// [`frame_path`](Self::frame_path), or its next free `_NNN` variant when
    /// a frame already exists for that second.
    pub fn next_frame_path(&self, at: NaiveDateTime) -> PathBuf {
        let base = self.frame_path(at);
        if !base.exists() {
            return base;
        }
        let stem = format!("{}{}", FRAME_PREFIX, at.format("%Y%m%d_%H-%M-%S"));
        let dir = self.date_dir(at.date());
        (1u32..)
            .map(|n| dir.join(format!("{}_{:03}.{}", stem, n, FRAME_EXTENSION)))
            .find(|path| !path.exists())
            .unwrap_or(base)
    }

    pub fn ensure_date_dir(&self, date: NaiveDate) -> Result<PathBuf> {
        let dir = self.date_dir(date);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create capture dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Accepted frames for `date`, in filename (capture) order.
    pub fn list_frames(&self, date: NaiveDate) -> Result<Vec<PathBuf>> {
        let dir = self.date_dir(date);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut frames = Vec::new();
        for entry in
            std::fs::read_dir(&dir).with_context(|| format!("list {}", dir.display()))?
        {
            let path = entry?.path();
            if is_frame_file(&path) {
                frames.push(path);
            }
        }
        frames.sort();
        Ok(frames)
    }

    pub fn count_frames(&self, date: NaiveDate) -> usize {
        match self.list_frames(date) {
            Ok(frames) => frames.len(),
            Err(err) => {
                log::warn!("cannot count frames for {}: {:#}", Self::date_key(date), err);
                0
            }
        }
    }

    /// Output path for the video of `date`.
    ///
    /// When `disambiguate` is set and a video for the date already exists, the
    /// next free `_N` suffix is used instead of overwriting it.
    pub fn video_path(&self, date: NaiveDate, disambiguate: bool) -> Result<PathBuf> {
        let key = Self::date_key(date);
        let dir = self.date_dir(date);
        let base_name = format!("{}{}.{}", VIDEO_PREFIX, key, VIDEO_EXTENSION);
        let base = dir.join(&base_name);
        if !disambiguate || !dir.exists() {
            return Ok(base);
        }

        let stem = format!("{}{}", VIDEO_PREFIX, key);
        let mut seen_any = false;
        let mut max_suffix = 0u32;
        for entry in std::fs::read_dir(&dir).with_context(|| format!("list {}", dir.display()))? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(rest) = name
                .strip_prefix(&stem)
                .and_then(|rest| rest.strip_suffix(&format!(".{}", VIDEO_EXTENSION)))
            else {
                continue;
            };
            seen_any = true;
            if let Some(n) = rest.strip_prefix('_').and_then(|n| n.parse::<u32>().ok()) {
                max_suffix = max_suffix.max(n);
            }
        }
        if !seen_any {
            return Ok(base);
        }
        Ok(dir.join(format!("{}_{}.{}", stem, max_suffix + 1, VIDEO_EXTENSION)))
    }
}

fn is_frame_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.starts_with(FRAME_PREFIX)
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == FRAME_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn frame_path_is_date_bucketed_with_second_resolution() {
        let store = CaptureStore::new("capture");
        let at = date().and_hms_opt(7, 5, 9).unwrap();
        assert_eq!(
            store.frame_path(at),
            PathBuf::from("capture/20261019/capt-20261019_07-05-09.jpg")
        );
    }

    #[test]
    fn frames_are_listed_in_capture_order_and_filtered() {
        let dir = TempDir::new().unwrap();
        let store = CaptureStore::new(dir.path());
        for (h, m, s) in [(12, 0, 0), (7, 0, 15), (7, 0, 0)] {
            touch(&store.frame_path(date().and_hms_opt(h, m, s).unwrap()));
        }
        touch(&store.date_dir(date()).join("video-20261019.mp4"));
        touch(&store.date_dir(date()).join("notes.jpg"));

        let names: Vec<_> = store
            .list_frames(date())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "capt-20261019_07-00-00.jpg",
                "capt-20261019_07-00-15.jpg",
                "capt-20261019_12-00-00.jpg",
            ]
        );
        assert_eq!(store.count_frames(date()), 3);
    }

    #[test]
    fn missing_day_has_no_frames() {
        let dir = TempDir::new().unwrap();
        let store = CaptureStore::new(dir.path());
        assert!(store.list_frames(date()).unwrap().is_empty());
    }

    #[test]
    fn video_suffix_applies_only_when_disambiguating() {
        let dir = TempDir::new().unwrap();
        let store = CaptureStore::new(dir.path());
        let base = store.date_dir(date()).join("video-20261019.mp4");

        assert_eq!(store.video_path(date(), true).unwrap(), base);
        touch(&base);
        assert_eq!(store.video_path(date(), false).unwrap(), base);
        assert_eq!(
            store.video_path(date(), true).unwrap(),
            store.date_dir(date()).join("video-20261019_1.mp4")
        );
        touch(&store.date_dir(date()).join("video-20261019_4.mp4"));
        assert_eq!(
            store.video_path(date(), true).unwrap(),
            store.date_dir(date()).join("video-20261019_5.mp4")
        );
    }
}
