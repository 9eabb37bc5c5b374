//! DS18B20 soil temperature over the kernel 1-Wire sysfs interface.
//!
//! ```text
//! 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
//! 72 01 4b 46 7f ff 0e 10 57 t=23125
//! ```

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use super::Sensor;

/// 1-Wire family code for the DS18B20.
const FAMILY_PREFIX: &str = "28-";

pub struct Ds18b20 {
    base_dir: PathBuf,
}

impl Ds18b20 {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// First `28-*` device under the bus directory. Re-discovered on every
    /// read so a probe plugged in later is picked up.
    fn device_file(&self) -> Result<PathBuf> {
        let entries = std::fs::read_dir(&self.base_dir)
            .with_context(|| format!("failed to list {}", self.base_dir.display()))?;
        let mut devices: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(FAMILY_PREFIX))
            .map(|e| e.path())
            .collect();
        devices.sort();
        match devices.into_iter().next() {
            Some(dir) => Ok(dir.join("w1_slave")),
            None => bail!("no DS18B20 found under {}", self.base_dir.display()),
        }
    }
}

/// Parse the two-line `w1_slave` payload into °C.
pub fn parse_w1_slave(text: &str) -> Result<f64> {
    let mut lines = text.lines();
    let crc_line = lines.next().unwrap_or_default();
    if !crc_line.trim_end().ends_with("YES") {
        bail!("crc check failed: {crc_line:?}");
    }
    let data_line = lines.next().unwrap_or_default();
    let Some((_, value)) = data_line.split_once("t=") else {
        bail!("no temperature field: {data_line:?}");
    };
    let milli: i64 = value
        .trim()
        .parse()
        .with_context(|| format!("bad temperature value {value:?}"))?;
    Ok(milli as f64 / 1000.0)
}

fn read_file(path: &Path) -> Result<f64> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_w1_slave(&text)
}

impl Sensor for Ds18b20 {
    type Value = f64;

    fn name(&self) -> &'static str {
        "ds18b20"
    }

    fn read(&mut self) -> Result<f64> {
        let path = self.device_file()?;
        read_file(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n\
                        72 01 4b 46 7f ff 0e 10 57 t=23125\n";

    #[test]
    fn parses_good_payload() {
        assert_eq!(parse_w1_slave(GOOD).unwrap(), 23.125);
    }

    #[test]
    fn negative_temperature() {
        let text = "ff ff : crc=aa YES\nff ff t=-2500\n";
        assert_eq!(parse_w1_slave(text).unwrap(), -2.5);
    }

    #[test]
    fn crc_failure_rejected() {
        let text = "72 01 : crc=57 NO\n72 01 t=23125\n";
        assert!(parse_w1_slave(text).is_err());
    }

    #[test]
    fn missing_value_rejected() {
        assert!(parse_w1_slave("aa : crc=57 YES\n").is_err());
        assert!(parse_w1_slave("").is_err());
    }

    #[test]
    fn discovers_device_by_family_prefix() {
        let base = tempfile::tempdir().unwrap();
        std::fs::create_dir(base.path().join("w1_bus_master1")).unwrap();
        let dev = base.path().join("28-0316a2790cff");
        std::fs::create_dir(&dev).unwrap();
        std::fs::write(dev.join("w1_slave"), GOOD).unwrap();

        let mut sensor = Ds18b20::new(base.path());
        assert_eq!(sensor.read().unwrap(), 23.125);
    }

    #[test]
    fn no_device_is_an_error() {
        let base = tempfile::tempdir().unwrap();
        std::fs::create_dir(base.path().join("w1_bus_master1")).unwrap();
        let msg = format!("{:#}", Ds18b20::new(base.path()).read().unwrap_err());
        assert!(msg.contains("no DS18B20"), "got: {msg}");
    }
}
