//! TOML config file loading and validation for the station and the hub.
//!
//! Every section carries serde defaults, so an empty (or absent) file yields
//! a working configuration for the stock wiring.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::relay::Relay;
use crate::sensors::dht22;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub pins: PinsConfig,
    pub sensors: SensorsConfig,
    pub sampling: SamplingConfig,
    pub watering: WateringConfig,
    pub housekeeping: HousekeepingConfig,
    pub web: WebConfig,
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub db_url: Option<String>,
    pub calibration_file: Option<PathBuf>,
    pub status_file: Option<PathBuf>,
    pub last_watering_file: Option<PathBuf>,
    pub images_dir: Option<PathBuf>,
    pub logger_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PinsConfig {
    pub pump: u8,
    pub light: u8,
    /// LOW-trigger relay boards: electrical HIGH means OFF.
    pub active_low: bool,
}

impl PinsConfig {
    pub fn pin(&self, relay: Relay) -> u8 {
        match relay {
            Relay::Pump => self.pump,
            Relay::Light => self.light,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorsConfig {
    pub i2c_bus: u8,
    pub ads1115_addr: u8,
    pub bh1750_addr: u8,
    pub w1_base_dir: PathBuf,
    pub dht_iio_dir: PathBuf,
    pub read_timeout_ms: u64,
    pub dht_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub interval_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WateringConfig {
    pub threshold_percent: f64,
    pub duration_sec: u64,
    pub cooldown_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HousekeepingConfig {
    pub image_retention_days: u64,
    pub camera_enabled: bool,
    pub camera_device: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Defaults to `greenhouse-logger` next to the running executable.
    pub logger_bin: Option<PathBuf>,
    pub start_grace_ms: u64,
    pub stop_timeout_sec: u64,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            db_url: None,
            calibration_file: None,
            status_file: None,
            last_watering_file: None,
            images_dir: None,
            logger_log: None,
        }
    }
}

impl Default for PinsConfig {
    fn default() -> Self {
        Self {
            pump: 12,
            light: 16,
            active_low: true,
        }
    }
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            i2c_bus: 1,
            ads1115_addr: 0x48,
            bh1750_addr: 0x23,
            w1_base_dir: PathBuf::from("/sys/bus/w1/devices"),
            dht_iio_dir: PathBuf::from("/sys/bus/iio/devices/iio:device0"),
            read_timeout_ms: 5000,
            dht_attempts: 3,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self { interval_sec: 2400 }
    }
}

impl Default for WateringConfig {
    fn default() -> Self {
        Self {
            threshold_percent: 40.0,
            duration_sec: 10,
            cooldown_sec: 3600,
        }
    }
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            image_retention_days: 90,
            camera_enabled: false,
            camera_device: "/dev/video0".to_string(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 5000 }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            logger_bin: None,
            start_grace_ms: 500,
            stop_timeout_sec: 15,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Highest 7-bit I2C address that is not reserved.
const I2C_ADDR_MAX: u8 = 0x77;

const MAX_IMAGE_RETENTION_DAYS: u64 = 36_500;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_pins(&mut errors);
        self.validate_sensors(&mut errors);
        self.validate_timing(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_pins(&self, errors: &mut Vec<String>) {
        for (name, pin) in [("pump", self.pins.pump), ("light", self.pins.light)] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "pins.{name}: {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            }
        }
        if self.pins.pump == self.pins.light {
            errors.push(format!(
                "pins: pump and light share GPIO {}",
                self.pins.pump
            ));
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let s = &self.sensors;
        for (name, addr) in [("ads1115_addr", s.ads1115_addr), ("bh1750_addr", s.bh1750_addr)] {
            if !(0x08..=I2C_ADDR_MAX).contains(&addr) {
                errors.push(format!(
                    "sensors.{name}: 0x{addr:02x} outside the 7-bit range 0x08-0x{I2C_ADDR_MAX:02x}"
                ));
            }
        }
        if s.read_timeout_ms == 0 {
            errors.push("sensors.read_timeout_ms must be positive".to_string());
        }
        if s.dht_attempts == 0 {
            errors.push("sensors.dht_attempts must be at least 1".to_string());
        }
        // Every DHT22 retry has to start inside the sensor read timeout.
        let retries = dht22::RETRY_DELAY.saturating_mul(s.dht_attempts.saturating_sub(1));
        if s.read_timeout_ms > 0 && retries >= Duration::from_millis(s.read_timeout_ms) {
            errors.push(format!(
                "sensors.read_timeout_ms ({}) too short for {} dht_attempts {} ms apart",
                s.read_timeout_ms,
                s.dht_attempts,
                dht22::RETRY_DELAY.as_millis()
            ));
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let w = &self.watering;
        if !(w.threshold_percent > 0.0 && w.threshold_percent <= 100.0) {
            errors.push(format!(
                "watering.threshold_percent {} out of range (0, 100]",
                w.threshold_percent
            ));
        }
        if w.duration_sec == 0 {
            errors.push("watering.duration_sec must be positive".to_string());
        }
        if self.sampling.interval_sec == 0 {
            errors.push("sampling.interval_sec must be positive".to_string());
        }
        if w.duration_sec > 0 && w.duration_sec >= self.sampling.interval_sec {
            errors.push(format!(
                "watering.duration_sec ({}) must be shorter than sampling.interval_sec ({})",
                w.duration_sec, self.sampling.interval_sec
            ));
        }
        let days = self.housekeeping.image_retention_days;
        if !(1..=MAX_IMAGE_RETENTION_DAYS).contains(&days) {
            errors.push(format!(
                "housekeeping.image_retention_days {days} out of range 1-{MAX_IMAGE_RETENTION_DAYS}"
            ));
        }
        if self.supervisor.stop_timeout_sec == 0 {
            errors.push("supervisor.stop_timeout_sec must be positive".to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Derived paths and durations
// ---------------------------------------------------------------------------

impl Config {
    fn data_path(&self, explicit: &Option<PathBuf>, default_name: &str) -> PathBuf {
        explicit
            .clone()
            .unwrap_or_else(|| self.paths.data_dir.join(default_name))
    }

    /// SQLite connection string; `DB_URL` in the environment wins.
    pub fn db_url(&self) -> String {
        if let Ok(url) = std::env::var("DB_URL") {
            return url;
        }
        self.paths.db_url.clone().unwrap_or_else(|| {
            format!(
                "sqlite:{}?mode=rwc",
                self.paths.data_dir.join("sensors.db").display()
            )
        })
    }

    pub fn calibration_file(&self) -> PathBuf {
        self.data_path(&self.paths.calibration_file, "soil_calibration.json")
    }

    pub fn status_file(&self) -> PathBuf {
        self.data_path(&self.paths.status_file, "logger_status.txt")
    }

    pub fn last_watering_file(&self) -> PathBuf {
        self.data_path(&self.paths.last_watering_file, "last_watering.txt")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data_path(&self.paths.images_dir, "logs")
    }

    pub fn logger_log(&self) -> PathBuf {
        self.data_path(&self.paths.logger_log, "logger_run.log")
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sampling.interval_sec)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.sensors.read_timeout_ms)
    }

    pub fn image_retention(&self) -> Duration {
        Duration::from_secs(self.housekeeping.image_retention_days.saturating_mul(24 * 3600))
    }

    /// HTTP port; `WEB_PORT` in the environment wins.
    pub fn web_port(&self) -> u16 {
        std::env::var("WEB_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(self.web.port)
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// defaults; a present but unparsable or invalid file is an error.
pub fn load(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let config: Config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config: {}", path.display()))?
    } else {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };
    config
        .validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(config)
}

/// Config path from `CONFIG_PATH`, defaulting to `greenhouse.toml`.
pub fn path_from_env() -> PathBuf {
    std::env::var("CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("greenhouse.toml"))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_config_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.pins.pump, 12);
        assert_eq!(config.pins.light, 16);
        assert!(config.pins.active_low);
        assert_eq!(config.sampling.interval_sec, 2400);
        assert_eq!(config.watering.threshold_percent, 40.0);
        assert_eq!(config.watering.duration_sec, 10);
        assert_eq!(config.watering.cooldown_sec, 3600);
        assert_eq!(config.web.port, 5000);
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_section_keeps_other_defaults() {
        let toml_str = r#"
[watering]
threshold_percent = 35.5

[paths]
data_dir = "/var/lib/greenhouse"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.watering.threshold_percent, 35.5);
        assert_eq!(config.watering.cooldown_sec, 3600);
        assert_eq!(
            config.calibration_file(),
            PathBuf::from("/var/lib/greenhouse/soil_calibration.json")
        );
        assert_eq!(
            config.status_file(),
            PathBuf::from("/var/lib/greenhouse/logger_status.txt")
        );
    }

    #[test]
    fn explicit_paths_override_data_dir() {
        let toml_str = r#"
[paths]
data_dir = "/data"
last_watering_file = "/tmp/lw.txt"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.last_watering_file(), PathBuf::from("/tmp/lw.txt"));
        assert_eq!(config.images_dir(), PathBuf::from("/data/logs"));
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load(dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.pins.pump, 12);
    }

    #[test]
    fn load_unparsable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[pins\npump = ").unwrap();
        assert!(load(&path).is_err());
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn gpio_pin_outside_header_rejected() {
        let mut cfg = Config::default();
        cfg.pins.pump = 1;
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");
    }

    #[test]
    fn shared_relay_pin_rejected() {
        let mut cfg = Config::default();
        cfg.pins.light = cfg.pins.pump;
        assert_validation_err(&cfg, "share GPIO");
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let mut cfg = Config::default();
        cfg.watering.threshold_percent = 0.0;
        assert_validation_err(&cfg, "threshold_percent");
        cfg.watering.threshold_percent = 100.5;
        assert_validation_err(&cfg, "threshold_percent");
    }

    #[test]
    fn watering_longer_than_interval_rejected() {
        let mut cfg = Config::default();
        cfg.sampling.interval_sec = 10;
        cfg.watering.duration_sec = 10;
        assert_validation_err(&cfg, "must be shorter than sampling.interval_sec");
    }

    #[test]
    fn i2c_address_out_of_range_rejected() {
        let mut cfg = Config::default();
        cfg.sensors.bh1750_addr = 0x7f;
        assert_validation_err(&cfg, "sensors.bh1750_addr");
    }

    #[test]
    fn dht_retries_must_fit_in_read_timeout() {
        let mut cfg = Config::default();
        cfg.sensors.dht_attempts = 3;
        cfg.sensors.read_timeout_ms = 3000;
        assert_validation_err(&cfg, "too short for 3 dht_attempts");

        cfg.sensors.read_timeout_ms = 4000;
        assert_validation_err(&cfg, "sensors.read_timeout_ms (4000)");

        cfg.sensors.read_timeout_ms = 4500;
        cfg.validate().unwrap();

        // A single attempt never waits.
        cfg.sensors.dht_attempts = 1;
        cfg.sensors.read_timeout_ms = 100;
        cfg.validate().unwrap();
    }

    #[test]
    fn default_timeout_covers_default_dht_attempts() {
        let cfg = Config::default();
        let retries = dht22::RETRY_DELAY * (cfg.sensors.dht_attempts - 1);
        assert!(retries < cfg.read_timeout());
    }

    #[test]
    fn image_retention_is_bounded() {
        let mut cfg = Config::default();
        cfg.housekeeping.image_retention_days = 0;
        assert_validation_err(&cfg, "image_retention_days 0 out of range");

        cfg.housekeeping.image_retention_days = u64::MAX;
        assert_validation_err(&cfg, "image_retention_days");
        assert_eq!(cfg.image_retention(), Duration::from_secs(u64::MAX));

        cfg.housekeeping.image_retention_days = MAX_IMAGE_RETENTION_DAYS;
        cfg.validate().unwrap();
        assert_eq!(
            cfg.image_retention(),
            Duration::from_secs(MAX_IMAGE_RETENTION_DAYS * 86_400)
        );
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.pins.pump = 0;
        cfg.sampling.interval_sec = 0;
        cfg.sensors.read_timeout_ms = 0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("pins.pump"), "missing pin error in: {msg}");
        assert!(msg.contains("interval_sec"), "missing interval error in: {msg}");
        assert!(msg.contains("read_timeout_ms"), "missing timeout error in: {msg}");
    }
}
