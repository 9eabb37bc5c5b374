//! Per-cycle housekeeping: an optional camera snapshot and pruning of old
//! `*.jpg` files from the images directory.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::process::Command;
use tracing::{debug, info, warn};

const CAPTURE_TIMEOUT: Duration = Duration::from_secs(30);

/// Delete `*.jpg` files in `dir` last modified before `now - retention`.
/// Returns how many were removed. Files that cannot be removed are logged
/// and skipped.
pub fn purge_old_images(dir: &Path, retention: Duration, now: SystemTime) -> Result<usize> {
    let cutoff = now.checked_sub(retention).unwrap_or(SystemTime::UNIX_EPOCH);
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("failed to list {}", dir.display())),
    };

    let mut removed = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let is_jpg = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg"));
        if !is_jpg {
            continue;
        }
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %path.display(), "cannot stat image: {e}");
                continue;
            }
        };
        if modified < cutoff {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "old image removed");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), "cannot remove old image: {e}"),
            }
        }
    }
    Ok(removed)
}

/// USB camera snapshots through `ffmpeg`'s v4l2 input.
#[derive(Debug, Clone)]
pub struct Camera {
    device: String,
}

impl Camera {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }

    fn command(&self, out: &Path) -> Command {
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-f", "v4l2", "-input_format", "yuyv422"])
            .args(["-video_size", "1280x960", "-i"])
            .arg(&self.device)
            .args(["-frames:v", "1", "-q:v", "2", "-y"])
            .arg(out)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Capture one frame into `dir`, named after the current UTC time.
    pub async fn capture(&self, dir: &Path) -> Result<PathBuf> {
        let stamp = OffsetDateTime::now_utc()
            .format(format_description!(
                "[year][month][day]_[hour][minute][second]"
            ))
            .context("failed to format snapshot name")?;
        let out = dir.join(format!("snapshot_{stamp}.jpg"));

        let status = tokio::time::timeout(CAPTURE_TIMEOUT, self.command(&out).status())
            .await
            .context("ffmpeg timed out")?
            .context("failed to run ffmpeg")?;
        if !status.success() {
            bail!("ffmpeg exited with {status}");
        }
        Ok(out)
    }
}

pub struct Housekeeping {
    images_dir: PathBuf,
    retention: Duration,
    camera: Option<Camera>,
}

impl Housekeeping {
    pub fn new(images_dir: impl Into<PathBuf>, retention: Duration, camera: Option<Camera>) -> Self {
        Self {
            images_dir: images_dir.into(),
            retention,
            camera,
        }
    }

    pub fn from_config(cfg: &crate::config::Config) -> Self {
        let camera = cfg
            .housekeeping
            .camera_enabled
            .then(|| Camera::new(cfg.housekeeping.camera_device.clone()));
        Self::new(cfg.images_dir(), cfg.image_retention(), camera)
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    /// Snapshot (if enabled) then prune. Failures are logged, never fatal.
    pub async fn run(&self) {
        if let Some(camera) = &self.camera {
            match camera.capture(&self.images_dir).await {
                Ok(path) => info!(path = %path.display(), "snapshot captured"),
                Err(e) => warn!("snapshot failed: {e:#}"),
            }
        }
        match purge_old_images(&self.images_dir, self.retention, SystemTime::now()) {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "old images pruned"),
            Err(e) => warn!("image cleanup failed: {e:#}"),
        }
    }
}
