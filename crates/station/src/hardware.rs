//! The hardware context: four sensor slots and the relay board, opened once
//! at startup and handed to whoever needs them.
//!
//! With `hw` the I2C sensors use the Pi's bus and the relays drive real
//! GPIO. Without it, `sim` swaps every sensor for a simulated one coupled to
//! the in-memory pump line; with neither, the sysfs sensors are still read
//! and the I2C sensors are offline.

use anyhow::Result;
use serde::Serialize;
use std::time::Duration;
use tracing::info;

use crate::config::Config;
use crate::relay::{Relay, RelayBoard, SharedRelays};
use crate::sensors::{AirSample, Sensor, SensorKind, SensorSlot, SoilSample};

#[derive(Clone)]
pub struct Hardware {
    pub air: SensorSlot<AirSample>,
    pub soil_temp: SensorSlot<f64>,
    pub soil: SensorSlot<SoilSample>,
    pub light: SensorSlot<f64>,
    pub relays: SharedRelays,
    pub read_timeout: Duration,
}

/// One pass over every sensor. Each field is independently optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub air: Option<AirSample>,
    pub soil_temp: Option<f64>,
    pub soil: Option<SoilSample>,
    pub lux: Option<f64>,
}

/// A single on-demand reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SensorValue {
    Air(AirSample),
    Soil(SoilSample),
    Celsius { temperature: f64 },
    Lux { lux: f64 },
}

impl Hardware {
    pub fn new(
        air: impl Sensor<Value = AirSample>,
        soil_temp: impl Sensor<Value = f64>,
        soil: impl Sensor<Value = SoilSample>,
        light: impl Sensor<Value = f64>,
        relays: SharedRelays,
        read_timeout: Duration,
    ) -> Self {
        Self {
            air: SensorSlot::new(air),
            soil_temp: SensorSlot::new(soil_temp),
            soil: SensorSlot::new(soil),
            light: SensorSlot::new(light),
            relays,
            read_timeout,
        }
    }

    /// Read every sensor in turn. A failing sensor costs at most one
    /// timeout and leaves only its own field empty.
    pub async fn snapshot(&self) -> Snapshot {
        let t = self.read_timeout;
        Snapshot {
            air: self.air.sample(t).await,
            soil_temp: self.soil_temp.sample(t).await,
            soil: self.soil.sample(t).await,
            lux: self.light.sample(t).await,
        }
    }

    pub async fn read(&self, kind: SensorKind) -> Option<SensorValue> {
        let t = self.read_timeout;
        match kind {
            SensorKind::Dht => self.air.sample(t).await.map(SensorValue::Air),
            SensorKind::Ds18b20 => self
                .soil_temp
                .sample(t)
                .await
                .map(|temperature| SensorValue::Celsius { temperature }),
            SensorKind::Ads => self.soil.sample(t).await.map(SensorValue::Soil),
            SensorKind::Bh1750 => self
                .light
                .sample(t)
                .await
                .map(|lux| SensorValue::Lux { lux }),
        }
    }

    // -----------------------------------------------------------------------
    // Opening
    // -----------------------------------------------------------------------

    /// Open the Pi's I2C bus, sysfs sensors and the GPIO lines of `relays`.
    #[cfg(feature = "hw")]
    pub fn open(cfg: &Config, relays: &[Relay]) -> Result<Self> {
        use crate::sensors::{Ads1115, Bh1750, Dht22, Ds18b20, Offline};
        use rppal::i2c::I2c;

        let s = &cfg.sensors;
        let relays = RelayBoard::open(&relay_pins(cfg, relays), cfg.pins.active_low)?;

        let soil: Box<dyn Sensor<Value = SoilSample>> = match I2c::with_bus(s.i2c_bus)
            .map_err(anyhow::Error::from)
            .and_then(|bus| Ads1115::new(bus, s.ads1115_addr, 0))
        {
            Ok(adc) => Box::new(adc),
            Err(e) => {
                tracing::error!("ads1115 unavailable: {e:#}");
                Box::new(Offline::new("ads1115", format!("{e:#}")))
            }
        };
        let light: Box<dyn Sensor<Value = f64>> = match I2c::with_bus(s.i2c_bus) {
            Ok(bus) => Box::new(Bh1750::new(bus, s.bh1750_addr)),
            Err(e) => {
                tracing::error!("bh1750 unavailable: {e}");
                Box::new(Offline::new("bh1750", e.to_string()))
            }
        };

        info!(i2c_bus = s.i2c_bus, "hardware opened");
        Ok(Self::new(
            Dht22::new(&s.dht_iio_dir, s.dht_attempts),
            Ds18b20::new(&s.w1_base_dir),
            soil,
            light,
            SharedRelays::new(relays),
            cfg.read_timeout(),
        ))
    }

    /// Simulated sensors coupled to an in-memory relay board.
    #[cfg(all(feature = "sim", not(feature = "hw")))]
    pub fn open(cfg: &Config, relays: &[Relay]) -> Result<Self> {
        use crate::sim::{Scenario, SimAir, SimLight, SimSoil, SimSoilTemp};

        /// Simulated day length; short so a dev session sees day and night.
        const SIM_DAY_SECS: f64 = 3600.0;

        let (relays, lines) =
            RelayBoard::open_memory(&relay_pins(cfg, relays), cfg.pins.active_low)?;
        let scenario = Scenario::from_env();

        let mut soil = SimSoil::new(scenario);
        if let Some(line) = lines.get(&Relay::Pump) {
            soil = soil.with_pump(line.clone(), cfg.pins.active_low);
        }

        info!(%scenario, "simulated hardware opened");
        Ok(Self::new(
            SimAir::new(scenario, SIM_DAY_SECS),
            SimSoilTemp::new(scenario, SIM_DAY_SECS),
            soil,
            SimLight::new(scenario, SIM_DAY_SECS),
            SharedRelays::new(relays),
            cfg.read_timeout(),
        ))
    }

    /// sysfs sensors only; the I2C sensors need the `hw` feature.
    #[cfg(not(any(feature = "sim", feature = "hw")))]
    pub fn open(cfg: &Config, relays: &[Relay]) -> Result<Self> {
        use crate::sensors::{Dht22, Ds18b20, Offline};

        let s = &cfg.sensors;
        let (relays, _lines) =
            RelayBoard::open_memory(&relay_pins(cfg, relays), cfg.pins.active_low)?;

        tracing::warn!("built without `hw`: I2C sensors offline, relays not wired");
        Ok(Self::new(
            Dht22::new(&s.dht_iio_dir, s.dht_attempts),
            Ds18b20::new(&s.w1_base_dir),
            Offline::<SoilSample>::new("ads1115", "built without hw feature"),
            Offline::<f64>::new("bh1750", "built without hw feature"),
            SharedRelays::new(relays),
            cfg.read_timeout(),
        ))
    }
}

fn relay_pins(cfg: &Config, relays: &[Relay]) -> Vec<(Relay, u8)> {
    relays.iter().map(|&r| (r, cfg.pins.pin(r))).collect()
}

// ===========================================================================
// Tests
// ===========================================================================
