//! Two-point soil-probe calibration: dry/wet reference voltages persisted as
//! `{"dry_v": .., "wet_v": ..}` and the voltage-to-percent conversion.
//!
//! Calibration is best-effort. A missing or corrupt file is logged and the
//! default pair is used; re-running calibration repairs it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub const DEFAULT_DRY_V: f64 = 1.60;
pub const DEFAULT_WET_V: f64 = 0.20;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    #[serde(rename = "dry_v")]
    pub dry_voltage: f64,
    #[serde(rename = "wet_v")]
    pub wet_voltage: f64,
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self {
            dry_voltage: DEFAULT_DRY_V,
            wet_voltage: DEFAULT_WET_V,
        }
    }
}

impl CalibrationProfile {
    /// Swap the bounds if they were stored inverted.
    pub fn normalized(self) -> Self {
        if self.dry_voltage < self.wet_voltage {
            Self {
                dry_voltage: self.wet_voltage,
                wet_voltage: self.dry_voltage,
            }
        } else {
            self
        }
    }

    fn is_finite(&self) -> bool {
        self.dry_voltage.is_finite() && self.wet_voltage.is_finite()
    }

    /// Map a probe voltage onto 0..=100 % moisture (dry reads high, wet reads
    /// low). A missing voltage or a degenerate span yields 0.
    pub fn moisture_percent(&self, voltage: Option<f64>) -> f64 {
        let CalibrationProfile {
            dry_voltage: dry,
            wet_voltage: wet,
        } = self.normalized();

        let span = dry - wet;
        if !span.is_finite() || span <= 0.0 {
            return 0.0;
        }
        let Some(v) = voltage.filter(|v| v.is_finite()) else {
            return 0.0;
        };

        let v = v.clamp(wet, dry);
        let percent = (dry - v) / span * 100.0;
        round_to(percent, 3).clamp(0.0, 100.0)
    }
}

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// A partial calibration update; `None` bounds are left untouched.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct CalibrationUpdate {
    pub dry: Option<f64>,
    pub wet: Option<f64>,
}

/// Old files stored raw ADC counts instead of volts.
#[derive(Deserialize)]
struct LegacyRawCalibration {
    #[allow(dead_code)]
    dry: f64,
    #[allow(dead_code)]
    wet: f64,
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// File-backed calibration store. Clones share one write lock so concurrent
/// saves from the control plane never interleave.
#[derive(Clone)]
pub struct CalibrationStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl CalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted profile, falling back to defaults. Never fails.
    pub fn load(&self) -> CalibrationProfile {
        match self.read_file() {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                warn!(path = %self.path.display(), "calibration file not found, using defaults");
                CalibrationProfile::default()
            }
            Err(e) => {
                warn!(path = %self.path.display(), "calibration file unusable, using defaults: {e:#}");
                CalibrationProfile::default()
            }
        }
    }

    fn read_file(&self) -> Result<Option<CalibrationProfile>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("failed to read calibration file"),
        };

        match serde_json::from_str::<CalibrationProfile>(&contents) {
            Ok(profile) if profile.is_finite() => Ok(Some(profile)),
            Ok(_) => anyhow::bail!("calibration contains non-finite voltages"),
            Err(e) => {
                if serde_json::from_str::<LegacyRawCalibration>(&contents).is_ok() {
                    anyhow::bail!("found legacy raw-count calibration; recalibrate in volts");
                }
                Err(e).context("failed to parse calibration file")
            }
        }
    }

    /// Merge `update` into the persisted profile and write it atomically.
    /// Returns the profile now on disk.
    pub fn save(&self, update: CalibrationUpdate) -> Result<CalibrationProfile> {
        for v in [update.dry, update.wet].into_iter().flatten() {
            anyhow::ensure!(v.is_finite(), "calibration voltage must be finite, got {v}");
        }

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut profile = self.load();
        if let Some(dry) = update.dry {
            profile.dry_voltage = dry;
        }
        if let Some(wet) = update.wet {
            profile.wet_voltage = wet;
        }

        let json = serde_json::to_string(&profile).context("failed to encode calibration")?;
        let tmp = self.path.with_extension("json.tmp");
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        std::fs::write(&tmp, json)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        info!(
            dry_v = profile.dry_voltage,
            wet_v = profile.wet_voltage,
            "calibration saved"
        );
        Ok(profile)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
