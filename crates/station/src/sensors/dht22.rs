//! DHT22 air temperature/humidity through the kernel IIO `dht11` driver.
//!
//! The overlay exposes `in_temp_input` (m°C) and `in_humidityrelative_input`
//! (m%RH). Reads fail with EIO whenever the driver misses the sensor's
//! timing window, which is common, so each sample retries a few times.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::{thread, time::Duration};
use tracing::debug;

use super::{AirSample, Sensor};

const TEMP_FILE: &str = "in_temp_input";
const HUMIDITY_FILE: &str = "in_humidityrelative_input";

/// The sensor needs ~2 s between conversions.
pub const RETRY_DELAY: Duration = Duration::from_millis(2000);

pub struct Dht22 {
    dir: PathBuf,
    attempts: u32,
    retry_delay: Duration,
}

impl Dht22 {
    pub fn new(dir: impl Into<PathBuf>, attempts: u32) -> Self {
        Self {
            dir: dir.into(),
            attempts: attempts.max(1),
            retry_delay: RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn read_once(&self) -> Result<AirSample> {
        let temperature = read_milli(&self.dir.join(TEMP_FILE))?;
        let humidity = read_milli(&self.dir.join(HUMIDITY_FILE))?;
        anyhow::ensure!(
            (0.0..=100.0).contains(&humidity),
            "humidity {humidity} out of range"
        );
        Ok(AirSample {
            temperature,
            humidity,
        })
    }
}

fn read_milli(path: &Path) -> Result<f64> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let milli: i64 = text
        .trim()
        .parse()
        .with_context(|| format!("bad value in {}: {:?}", path.display(), text.trim()))?;
    Ok(milli as f64 / 1000.0)
}

impl Sensor for Dht22 {
    type Value = AirSample;

    fn name(&self) -> &'static str {
        "dht22"
    }

    fn read(&mut self) -> Result<AirSample> {
        let mut attempt = 1;
        loop {
            match self.read_once() {
                Ok(sample) => return Ok(sample),
                Err(e) if attempt < self.attempts => {
                    debug!(attempt, "dht22 read failed, retrying: {e:#}");
                    attempt += 1;
                    thread::sleep(self.retry_delay);
                }
                Err(e) => {
                    return Err(e).context(format!("dht22 failed after {attempt} attempts"))
                }
            }
        }
    }
}
