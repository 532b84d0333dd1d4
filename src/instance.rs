//! Single-instance enforcement.
//!
//! On Linux the lock is an advisory `flock` on a pid file, so a crashed
//! process never leaves a stale lock behind. Elsewhere the pid file itself is
//! the lock and is created with `create_new`.

use anyhow::{anyhow, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_LOCK_FILE: &str = "timelapsed.lock";

#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    // held open for the lifetime of the lock
    _file: File,
}

impl InstanceLock {
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    anyhow!("failed to create lock directory {}: {}", parent.display(), e)
                })?;
            }
        }
        let mut file = open_locked(&path)?;
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        log::debug!("instance lock {} held by pid {}", path.display(), std::process::id());
        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn already_running(path: &Path) -> anyhow::Error {
    anyhow!(
        "another timelapsed instance is running (lock {})",
        path.display()
    )
}

#[cfg(target_os = "linux")]
fn open_locked(path: &Path) -> Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o644)
        .open(path)
        .map_err(|e| anyhow!("failed to open lock file {}: {}", path.display(), e))?;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(already_running(path));
        }
        return Err(anyhow!("failed to lock {}: {}", path.display(), err));
    }
    Ok(file)
}

#[cfg(not(target_os = "linux"))]
fn open_locked(path: &Path) -> Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    match options.open(path) {
        Ok(file) => Ok(file),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(already_running(path))
        }
        Err(err) => Err(anyhow!(
            "failed to create lock file {}: {}",
            path.display(),
            err
        )),
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            log::warn!("cannot remove lock file {}: {}", self.path.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_is_refused_until_release() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("run").join("timelapsed.lock");
        let lock = InstanceLock::acquire(&path)?;
        let pid = std::fs::read_to_string(lock.path())?;
        assert_eq!(pid.trim(), std::process::id().to_string());

        let err = InstanceLock::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("another timelapsed instance is running"));

        drop(lock);
        assert!(!path.exists());
        let _again = InstanceLock::acquire(&path)?;
        Ok(())
    }
}
