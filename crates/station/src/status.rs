//! Logger status marker: `RUNNING since <timestamp> (pid N)` while the
//! sampling process is alive, absent (reported as `STOPPED`) otherwise.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::db::now_timestamp;

pub const STOPPED: &str = "STOPPED";

#[derive(Debug, Clone)]
pub struct StatusMarker {
    path: PathBuf,
}

impl StatusMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mark_running(&self, pid: u32) -> Result<()> {
        let line = format!("RUNNING since {} (pid {pid})", now_timestamp());
        std::fs::write(&self.path, line)
            .with_context(|| format!("failed to write status file {}", self.path.display()))
    }

    /// Remove the marker. Already gone is fine.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("failed to remove status file {}", self.path.display())),
        }
    }

    /// Current status line.
    pub fn read(&self) -> String {
        std::fs::read_to_string(&self.path)
            .map(|s| s.trim().to_string())
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| STOPPED.to_string())
    }
}
