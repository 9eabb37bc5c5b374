//! Sensor subsystem: the [`Sensor`] capability trait, the four physical
//! sensor families, and [`SensorSlot`], which gives every read its own fault
//! boundary.
//!
//! A slot runs the (blocking) driver call on tokio's blocking pool under a
//! timeout. Driver errors, panics and timeouts all come back as `None`; a
//! single flaky sensor must not stall or abort the sampling cycle.

pub mod ads1115;
pub mod bh1750;
pub mod dht22;
pub mod ds18b20;

use anyhow::Result;
use serde::Serialize;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;
use tracing::{debug, warn};

pub use ads1115::Ads1115;
pub use bh1750::Bh1750;
pub use dht22::Dht22;
pub use ds18b20::Ds18b20;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Air temperature (°C) and relative humidity (%).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AirSample {
    pub temperature: f64,
    pub humidity: f64,
}

/// Soil probe conversion: raw ADC count and the voltage it represents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SoilSample {
    pub raw: i64,
    pub voltage: f64,
}

/// Which sensor family a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Dht,
    Ds18b20,
    Ads,
    Bh1750,
}

impl SensorKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dht" | "dht22" => Some(Self::Dht),
            "ds18b20" => Some(Self::Ds18b20),
            "ads" | "ads1115" => Some(Self::Ads),
            "bh1750" | "lux" => Some(Self::Bh1750),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

/// A physical sensor. `read` may block (bus transfers, settle delays) and
/// may fail; callers go through a [`SensorSlot`] rather than calling it on
/// the async runtime.
pub trait Sensor: Send + 'static {
    type Value: Send + 'static;

    fn name(&self) -> &'static str;

    fn read(&mut self) -> Result<Self::Value>;
}

impl<S: Sensor + ?Sized> Sensor for Box<S> {
    type Value = S::Value;

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn read(&mut self) -> Result<Self::Value> {
        (**self).read()
    }
}

/// Placeholder for a sensor that could not be opened; every read fails.
pub struct Offline<T> {
    name: &'static str,
    reason: String,
    _value: std::marker::PhantomData<fn() -> T>,
}

impl<T> Offline<T> {
    pub fn new(name: &'static str, reason: impl Into<String>) -> Self {
        Self {
            name,
            reason: reason.into(),
            _value: std::marker::PhantomData,
        }
    }
}

impl<T: Send + 'static> Sensor for Offline<T> {
    type Value = T;

    fn name(&self) -> &'static str {
        self.name
    }

    fn read(&mut self) -> Result<T> {
        anyhow::bail!("{} offline: {}", self.name, self.reason)
    }
}

// ---------------------------------------------------------------------------
// Fault-isolated slot
// ---------------------------------------------------------------------------

pub type DynSensor<T> = Box<dyn Sensor<Value = T>>;

/// Shared, fault-isolated handle to one sensor.
pub struct SensorSlot<T> {
    name: &'static str,
    sensor: Arc<Mutex<DynSensor<T>>>,
}

impl<T> Clone for SensorSlot<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            sensor: Arc::clone(&self.sensor),
        }
    }
}

impl<T: Send + 'static> SensorSlot<T> {
    pub fn new(sensor: impl Sensor<Value = T>) -> Self {
        let name = sensor.name();
        Self {
            name,
            sensor: Arc::new(Mutex::new(Box::new(sensor))),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Read once. `None` means the sensor failed, timed out, or is still
    /// stuck in an earlier read that timed out.
    pub async fn sample(&self, timeout: Duration) -> Option<T> {
        let name = self.name;
        let sensor = Arc::clone(&self.sensor);
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = match sensor.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    anyhow::bail!("previous read still in progress")
                }
            };
            guard.read()
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(value))) => {
                debug!(sensor = name, "read ok");
                Some(value)
            }
            Ok(Ok(Err(e))) => {
                warn!(sensor = name, "read failed: {e:#}");
                None
            }
            Ok(Err(join_err)) => {
                warn!(sensor = name, "read panicked: {join_err}");
                None
            }
            Err(_) => {
                warn!(sensor = name, timeout_ms = timeout.as_millis() as u64, "read timed out");
                None
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
