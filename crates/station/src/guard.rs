//! The watering guard: a one-line file holding the unix time of the last
//! completed watering. It is the only state the cooldown depends on.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct WateringGuard {
    path: PathBuf,
}

impl WateringGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last completed watering. A missing or unreadable file means "never".
    pub fn last(&self) -> Option<OffsetDateTime> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), "watering guard unreadable: {e}");
                return None;
            }
        };
        let parsed = text
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|secs| secs.is_finite())
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs as i64).ok());
        if parsed.is_none() {
            warn!(path = %self.path.display(), contents = text.trim(), "watering guard corrupt, ignoring");
        }
        parsed
    }

    pub fn record(&self, at: OffsetDateTime) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        std::fs::write(&self.path, at.unix_timestamp().to_string())
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}
