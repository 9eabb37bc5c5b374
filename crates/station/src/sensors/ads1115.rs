//! ADS1115 16-bit ADC driver for the capacitive soil probe.
//!
//! Reads a single-ended channel at PGA ±4.096 V, 128 SPS, single-shot mode.
//! The first conversion after the probe has been idle is unreliable, so
//! every sample is a flush-then-read: one conversion is taken and thrown
//! away, the input settles for [`SETTLE`], and only the second conversion is
//! reported.

use anyhow::{anyhow, ensure, Result};
use embedded_hal::i2c::I2c;
use std::{thread, time::Duration};

use super::{Sensor, SoilSample};

// ── ADS1115 register addresses ──────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
const REG_CONFIG: u8 = 0x01;

// ── Config register bit fields ──────────────────────────────────────────────
//
// Layout (MSB first):
//   [15]    OS      : write 1 to start single-shot conversion
//   [14:12] MUX     : input multiplexer (channel selection)
//   [11:9]  PGA     : programmable gain amplifier
//   [8]     MODE    : 0 = continuous, 1 = single-shot
//   [7:5]   DR      : data rate
//   [4]     COMP_MODE
//   [3]     COMP_POL
//   [2]     COMP_LAT
//   [1:0]   COMP_QUE: 11 = disable comparator (default)

/// Bits common to all channel reads:
///   OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot),
///   DR=100 (128 SPS), COMP_QUE=11 (comparator off).
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

/// MUX values for single-ended reads (AINx vs GND).
const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

const MAX_CHANNEL: usize = 3;

/// Full-scale voltage for PGA=001.
const FULL_SCALE_V: f64 = 4.096;

/// Conversion time at 128 SPS is ~7.8 ms.  We wait 9 ms for margin.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

/// Pause between the discarded conversion and the one we keep.
pub const SETTLE: Duration = Duration::from_millis(50);

/// Bit 15 of the config register: conversion-ready flag when read.
const OS_READY_BIT: u16 = 1 << 15;

/// Build the config register value for a single-ended read on `channel`.
fn config_for_channel(channel: usize) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[channel] << MUX_SHIFT)
}

/// Convert a raw conversion to volts at the configured gain.
pub fn raw_to_volts(raw: i16) -> f64 {
    f64::from(raw) * FULL_SCALE_V / 32768.0
}

// ── Driver ──────────────────────────────────────────────────────────────────

pub struct Ads1115<I> {
    i2c: I,
    addr: u8,
    channel: usize,
    settle: Duration,
}

impl<I: I2c> Ads1115<I> {
    pub fn new(i2c: I, addr: u8, channel: usize) -> Result<Self> {
        ensure!(
            channel <= MAX_CHANNEL,
            "ADS1115 channel {channel} out of range (0–{MAX_CHANNEL})"
        );
        tracing::info!(addr = format_args!("0x{addr:02x}"), channel, "ads1115 initialised");
        Ok(Self {
            i2c,
            addr,
            channel,
            settle: SETTLE,
        })
    }

    /// Override the settle interval (tests use zero).
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Perform one single-shot conversion, returning the raw signed value.
    fn convert(&mut self) -> Result<i16> {
        let config = config_for_channel(self.channel).to_be_bytes();
        self.i2c
            .write(self.addr, &[REG_CONFIG, config[0], config[1]])
            .map_err(|e| anyhow!("ads1115 config write failed: {e:?}"))?;

        thread::sleep(CONVERSION_WAIT);

        // Poll the OS bit to confirm conversion is done.
        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c
                .write_read(self.addr, &[REG_CONFIG], &mut buf)
                .map_err(|e| anyhow!("ads1115 status read failed: {e:?}"))?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c
            .write_read(self.addr, &[REG_CONVERSION], &mut buf)
            .map_err(|e| anyhow!("ads1115 conversion read failed: {e:?}"))?;
        Ok(i16::from_be_bytes(buf))
    }

    /// Flush-then-read sample of the probe.
    pub fn sample(&mut self) -> Result<SoilSample> {
        let _flushed = self.convert()?;
        thread::sleep(self.settle);
        let raw = self.convert()?;
        Ok(SoilSample {
            raw: i64::from(raw),
            voltage: raw_to_volts(raw),
        })
    }
}

impl<I: I2c + Send + 'static> Sensor for Ads1115<I> {
    type Value = SoilSample;

    fn name(&self) -> &'static str {
        "ads1115"
    }

    fn read(&mut self) -> Result<SoilSample> {
        self.sample()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use embedded_hal::i2c::{ErrorKind, ErrorType, Operation};
    use std::collections::VecDeque;

    #[derive(Debug)]
    pub(crate) struct BusError;

    impl embedded_hal::i2c::Error for BusError {
        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
    }

    /// Scripted I2C device: records writes, answers reads from a queue.
    #[derive(Default)]
    pub(crate) struct ScriptedBus {
        pub writes: Vec<Vec<u8>>,
        pub replies: VecDeque<[u8; 2]>,
        pub fail: bool,
    }

    impl ErrorType for ScriptedBus {
        type Error = BusError;
    }

    impl I2c for ScriptedBus {
        fn transaction(
            &mut self,
            _address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            if self.fail {
                return Err(BusError);
            }
            for op in operations {
                match op {
                    Operation::Write(bytes) => self.writes.push(bytes.to_vec()),
                    Operation::Read(buf) => {
                        let reply = self.replies.pop_front().unwrap_or([0, 0]);
                        buf.copy_from_slice(&reply[..buf.len()]);
                    }
                }
            }
            Ok(())
        }
    }

    /// Replies for one conversion: status ready, then `raw`.
    fn conversion(raw: i16) -> [[u8; 2]; 2] {
        [[0x80, 0x00], raw.to_be_bytes()]
    }

    // -- Config register construction -----------------------------------------

    #[test]
    fn config_register_channel_a0() {
        // AIN0 vs GND: MUX = 100 → bits [14:12] = 0b100
        let cfg = config_for_channel(0);
        assert_eq!(cfg, 0xC383, "A0 config: {cfg:#06x}");
    }

    #[test]
    fn config_register_channel_a3() {
        let cfg = config_for_channel(3);
        assert_eq!(cfg, 0xF383, "A3 config: {cfg:#06x}");
    }

    #[test]
    fn config_base_has_correct_pga() {
        // PGA bits [11:9] should be 001 for ±4.096 V.
        let pga = (CONFIG_BASE >> 9) & 0b111;
        assert_eq!(pga, 0b001, "PGA should be ±4.096 V");
    }

    #[test]
    fn config_base_is_single_shot() {
        let mode = (CONFIG_BASE >> 8) & 1;
        assert_eq!(mode, 1, "MODE should be single-shot");
    }

    // -- Conversion -----------------------------------------------------------

    #[test]
    fn raw_to_volts_full_scale() {
        assert_eq!(raw_to_volts(0), 0.0);
        assert!((raw_to_volts(16384) - 2.048).abs() < 1e-9);
    }

    #[test]
    fn channel_out_of_range_rejected() {
        assert!(Ads1115::new(ScriptedBus::default(), 0x48, 4).is_err());
    }

    // -- Flush-then-read ------------------------------------------------------

    #[test]
    fn sample_discards_first_conversion() {
        let mut bus = ScriptedBus::default();
        // First conversion reads garbage, second is the real value.
        bus.replies.extend(conversion(31000));
        bus.replies.extend(conversion(7000));

        let mut adc = Ads1115::new(bus, 0x48, 0)
            .unwrap()
            .with_settle(Duration::ZERO);
        let s = adc.sample().unwrap();

        assert_eq!(s.raw, 7000);
        assert!((s.voltage - raw_to_volts(7000)).abs() < 1e-12);

        // Two conversions were started (two config writes).
        let config_writes = adc
            .i2c
            .writes
            .iter()
            .filter(|w| w.len() == 3 && w[0] == REG_CONFIG)
            .count();
        assert_eq!(config_writes, 2);
    }

    #[test]
    fn bus_failure_is_an_error() {
        let bus = ScriptedBus {
            fail: true,
            ..Default::default()
        };
        let mut adc = Ads1115::new(bus, 0x48, 0).unwrap();
        assert!(adc.read().is_err());
    }
}
