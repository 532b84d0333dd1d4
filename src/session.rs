//! Video-source session lifecycle and recovery.
//!
//! Recovery is attempted once per failed capture; the scheduler cadence is
//! the backoff. `restart` is the heavier out-of-band hook and is never
//! called by the capture pipeline itself.

use anyhow::{anyhow, Context, Result};

use crate::ingest::{is_usable_embed, VideoSource};

pub struct Session {
    source: Box<dyn VideoSource>,
    address: String,
    reloads: u64,
    restarts: u64,
    closed: bool,
}

impl Session {
    /// First session establishment. Failure here is fatal for the process:
    /// nothing can be captured without a session.
    pub fn establish(mut source: Box<dyn VideoSource>, address: &str) -> Result<Self> {
        let opened = source
            .navigate(address)
            .with_context(|| format!("session fatal: cannot open {}", address))
            .and_then(|_| {
                if is_usable_embed(source.embed_source()) {
                    Ok(())
                } else {
                    Err(anyhow!(
                        "session fatal: {} has no usable player frame",
                        address
                    ))
                }
            });
        if let Err(err) = opened {
            if let Err(shutdown_err) = source.shutdown() {
                log::warn!("session teardown after failed open: {:#}", shutdown_err);
            }
            return Err(err);
        }
        log::info!("video session established via {} at {}", source.name(), address);
        Ok(Self {
            source,
            address: address.to_string(),
            reloads: 0,
            restarts: 0,
            closed: false,
        })
    }

    /// Re-navigate to `address` and check the player frame came back.
    pub fn reload(&mut self, address: &str) -> bool {
        self.reloads += 1;
        log::info!("reloading video session at {}", address);
        self.reopen(address)
    }

    /// Tear the session down completely and build it again.
    pub fn restart(&mut self, address: &str) -> bool {
        self.restarts += 1;
        log::warn!("restarting video session at {}", address);
        if let Err(err) = self.source.shutdown() {
            log::warn!("session shutdown during restart: {:#}", err);
        }
        self.reopen(address)
    }

    /// Move the session onto a different backend. The old source is shut
    /// down first; the session keeps the new one even when its first load
    /// fails, so later reloads retry against the right backend.
    pub fn replace_source(&mut self, source: Box<dyn VideoSource>, address: &str) -> bool {
        self.restarts += 1;
        log::warn!(
            "switching video session from {} to {} at {}",
            self.source.name(),
            source.name(),
            address
        );
        self.close();
        self.source = source;
        self.address = address.to_string();
        self.reopen(address)
    }

    fn reopen(&mut self, address: &str) -> bool {
        self.closed = false;
        if let Err(err) = self.source.navigate(address) {
            log::error!("session reload failed: {:#}", err);
            return false;
        }
        if !is_usable_embed(self.source.embed_source()) {
            log::warn!("session reload: player frame has no usable source");
            return false;
        }
        self.address = address.to_string();
        true
    }

    pub fn source_mut(&mut self) -> &mut dyn VideoSource {
        self.source.as_mut()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn reloads(&self) -> u64 {
        self.reloads
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Release the source. Runs at most once per open session.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match self.source.shutdown() {
            Ok(()) => log::info!("video session closed"),
            Err(err) => log::warn!("video session teardown failed: {:#}", err),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
