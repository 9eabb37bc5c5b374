//! Simulated greenhouse sensors for development off the Pi.
//!
//! Models plausible behaviour for all four sensor families:
//! - Soil probe voltage as a random walk with mean reversion and a steady
//!   drying drift; it moves toward the wet end while the pump is energized
//! - Air temperature, humidity and light following a day/night cycle
//! - Per-reading electronic noise
//! - Occasional read failures (sensor flakiness)

use anyhow::{bail, Result};
use std::f64::consts::PI;
use std::fmt;

use crate::calibration::{DEFAULT_DRY_V, DEFAULT_WET_V};
use crate::relay::MemoryLine;
use crate::sensors::{AirSample, Sensor, SoilSample};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

/// Position in the day cycle, -1 at "midnight" and +1 at "noon".
fn diurnal(period_s: f64) -> f64 {
    let now_s = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    (2.0 * PI * now_s / period_s - PI / 2.0).sin()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range and dries steadily. Crosses the watering threshold
    /// within a few cycles.
    Drying,
    /// Hovers near the centre. Low noise, rare failures.
    Stable,
    /// High noise and ~10% failed reads. Exercises the per-sensor fault
    /// isolation.
    Flaky,
    /// Starts near the wet end and dries very slowly.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }

    pub fn from_env() -> Self {
        Self::from_str_lossy(&std::env::var("SIM_SCENARIO").unwrap_or_default())
    }

    /// (drift V/sample, walk sigma V, noise sigma V, failure probability, start fraction)
    fn params(self) -> (f64, f64, f64, f32, f64) {
        match self {
            Self::Drying => (0.05, 0.01, 0.005, 0.02, 0.5),
            Self::Stable => (0.002, 0.004, 0.002, 0.005, 0.5),
            Self::Flaky => (0.02, 0.02, 0.02, 0.10, 0.5),
            Self::Wet => (0.005, 0.005, 0.004, 0.02, 0.1),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

fn maybe_fail(name: &str, prob: f32) -> Result<()> {
    if fastrand::f32() < prob {
        bail!("simulated {name} read failure");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Soil probe
// ---------------------------------------------------------------------------

/// Simulated ADS1115 + capacitive probe.
pub struct SimSoil {
    /// Current "true" probe voltage. Evolves each read.
    base: f64,
    dry_v: f64,
    wet_v: f64,
    drift: f64,
    walk_sigma: f64,
    noise_sigma: f64,
    mean_reversion: f64,
    fail_prob: f32,
    /// Pump relay line; energized pulls the probe toward wet.
    pump: Option<(MemoryLine, bool)>,
    wet_rate: f64,
}

impl SimSoil {
    pub fn new(scenario: Scenario) -> Self {
        let (drift, walk_sigma, noise_sigma, fail_prob, start_frac) = scenario.params();
        let (dry_v, wet_v) = (DEFAULT_DRY_V, DEFAULT_WET_V);
        let range = dry_v - wet_v;
        Self {
            base: (wet_v + start_frac * range + gaussian(0.0, range * 0.03)).clamp(wet_v, dry_v),
            dry_v,
            wet_v,
            drift,
            walk_sigma,
            noise_sigma,
            mean_reversion: if scenario == Scenario::Drying { 0.0 } else { 0.02 },
            fail_prob,
            pump: None,
            wet_rate: range * 0.5,
        }
    }

    /// Couple the simulation to the pump relay's output line.
    pub fn with_pump(mut self, line: MemoryLine, active_low: bool) -> Self {
        self.pump = Some((line, active_low));
        self
    }

    fn pump_energized(&self) -> bool {
        match &self.pump {
            Some((line, active_low)) => line.level().is_some_and(|high| high != *active_low),
            None => false,
        }
    }

    pub fn next_voltage(&mut self) -> f64 {
        let center = (self.dry_v + self.wet_v) / 2.0;
        let pull = self.mean_reversion * (center - self.base);
        let walk = gaussian(0.0, self.walk_sigma);
        let wet = if self.pump_energized() { -self.wet_rate } else { 0.0 };

        self.base = (self.base + self.drift + pull + walk + wet)
            .clamp(self.wet_v - 0.1, self.dry_v + 0.1);

        (self.base + gaussian(0.0, self.noise_sigma)).clamp(0.0, 4.095)
    }
}

impl Sensor for SimSoil {
    type Value = SoilSample;

    fn name(&self) -> &'static str {
        "ads1115"
    }

    fn read(&mut self) -> Result<SoilSample> {
        maybe_fail(self.name(), self.fail_prob)?;
        let voltage = self.next_voltage();
        let raw = (voltage * 32768.0 / 4.096).round() as i64;
        Ok(SoilSample {
            raw,
            voltage: crate::sensors::ads1115::raw_to_volts(raw as i16),
        })
    }
}

// ---------------------------------------------------------------------------
// Air, soil temperature, light
// ---------------------------------------------------------------------------

/// Simulated DHT22.
pub struct SimAir {
    period_s: f64,
    fail_prob: f32,
}

impl SimAir {
    pub fn new(scenario: Scenario, period_s: f64) -> Self {
        Self {
            period_s,
            fail_prob: scenario.params().3 * 2.0,
        }
    }
}

impl Sensor for SimAir {
    type Value = AirSample;

    fn name(&self) -> &'static str {
        "dht22"
    }

    fn read(&mut self) -> Result<AirSample> {
        maybe_fail(self.name(), self.fail_prob)?;
        let day = diurnal(self.period_s);
        Ok(AirSample {
            temperature: 22.0 + 5.0 * day + gaussian(0.0, 0.2),
            humidity: (60.0 - 15.0 * day + gaussian(0.0, 1.0)).clamp(0.0, 100.0),
        })
    }
}

/// Simulated DS18B20; lags the air and swings less.
pub struct SimSoilTemp {
    period_s: f64,
    fail_prob: f32,
}

impl SimSoilTemp {
    pub fn new(scenario: Scenario, period_s: f64) -> Self {
        Self {
            period_s,
            fail_prob: scenario.params().3,
        }
    }
}

impl Sensor for SimSoilTemp {
    type Value = f64;

    fn name(&self) -> &'static str {
        "ds18b20"
    }

    fn read(&mut self) -> Result<f64> {
        maybe_fail(self.name(), self.fail_prob)?;
        Ok(19.0 + 2.0 * diurnal(self.period_s) + gaussian(0.0, 0.05))
    }
}

/// Simulated BH1750: dark at night, up to ~20 klx at noon.
pub struct SimLight {
    period_s: f64,
    fail_prob: f32,
}

impl SimLight {
    pub fn new(scenario: Scenario, period_s: f64) -> Self {
        Self {
            period_s,
            fail_prob: scenario.params().3,
        }
    }
}

impl Sensor for SimLight {
    type Value = f64;

    fn name(&self) -> &'static str {
        "bh1750"
    }

    fn read(&mut self) -> Result<f64> {
        maybe_fail(self.name(), self.fail_prob)?;
        let day = diurnal(self.period_s);
        let lux = if day > 0.0 {
            20_000.0 * day * (1.0 + gaussian(0.0, 0.05))
        } else {
            0.0
        };
        Ok(lux.max(0.0))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
