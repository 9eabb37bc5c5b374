//! BH1750 ambient light sensor.
//!
//! One-time high-resolution mode: write the mode command, wait for the
//! conversion, read two bytes. Lux is `raw / 1.2`.

use anyhow::{anyhow, Result};
use embedded_hal::i2c::I2c;
use std::{thread, time::Duration};

use super::Sensor;
use crate::calibration::round_to;

/// One-time H-resolution mode (1 lx, powers down afterwards).
const ONE_TIME_HIGH_RES: u8 = 0x20;

/// Max measurement time for H-resolution mode.
const MEASUREMENT_WAIT: Duration = Duration::from_millis(180);

pub fn raw_to_lux(raw: u16) -> f64 {
    round_to(f64::from(raw) / 1.2, 2)
}

pub struct Bh1750<I> {
    i2c: I,
    addr: u8,
    wait: Duration,
}

impl<I: I2c> Bh1750<I> {
    pub fn new(i2c: I, addr: u8) -> Self {
        Self {
            i2c,
            addr,
            wait: MEASUREMENT_WAIT,
        }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn lux(&mut self) -> Result<f64> {
        self.i2c
            .write(self.addr, &[ONE_TIME_HIGH_RES])
            .map_err(|e| anyhow!("bh1750 command write failed: {e:?}"))?;
        thread::sleep(self.wait);

        let mut buf = [0u8; 2];
        self.i2c
            .read(self.addr, &mut buf)
            .map_err(|e| anyhow!("bh1750 read failed: {e:?}"))?;
        Ok(raw_to_lux(u16::from_be_bytes(buf)))
    }
}

impl<I: I2c + Send + 'static> Sensor for Bh1750<I> {
    type Value = f64;

    fn name(&self) -> &'static str {
        "bh1750"
    }

    fn read(&mut self) -> Result<f64> {
        self.lux()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::ads1115::tests::ScriptedBus;

    #[test]
    fn lux_conversion() {
        assert_eq!(raw_to_lux(0), 0.0);
        assert_eq!(raw_to_lux(120), 100.0);
        assert_eq!(raw_to_lux(1000), 833.33);
    }

    #[test]
    fn reads_after_mode_command() {
        let mut bus = ScriptedBus::default();
        bus.replies.push_back(600u16.to_be_bytes());

        let mut sensor = Bh1750::new(bus, 0x23).with_wait(Duration::ZERO);
        assert_eq!(sensor.read().unwrap(), 500.0);
        assert_eq!(sensor.i2c.writes, vec![vec![ONE_TIME_HIGH_RES]]);
    }

    #[test]
    fn bus_error_propagates() {
        let bus = ScriptedBus {
            fail: true,
            ..Default::default()
        };
        let mut sensor = Bh1750::new(bus, 0x23).with_wait(Duration::ZERO);
        assert!(sensor.read().is_err());
    }
}
