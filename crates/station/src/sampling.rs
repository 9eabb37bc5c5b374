//! The sampling loop: read → round → persist → irrigate → housekeeping →
//! sleep, once per interval, first pass immediately.

use anyhow::Result;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::calibration::{round_to, CalibrationProfile, CalibrationStore};
use crate::db::{now_timestamp, Db, NewReading};
use crate::hardware::{Hardware, Snapshot};
use crate::housekeeping::Housekeeping;
use crate::irrigation::{Decision, IrrigationController};

/// Build the persisted row from one snapshot. Moisture is only derived when
/// the probe actually produced a voltage.
pub fn build_reading(snap: &Snapshot, profile: &CalibrationProfile, timestamp: String) -> NewReading {
    let soil_percent = snap
        .soil
        .map(|s| round_to(profile.moisture_percent(Some(s.voltage)), 2));
    NewReading {
        timestamp,
        air_temp: snap.air.map(|a| round_to(a.temperature, 2)),
        air_humidity: snap.air.map(|a| round_to(a.humidity, 2)),
        soil_temp: snap.soil_temp.map(|t| round_to(t, 2)),
        soil_raw: snap.soil.map(|s| s.raw),
        soil_voltage: snap.soil.map(|s| round_to(s.voltage, 3)),
        soil_percent,
        lux: snap.lux.map(|l| round_to(l, 2)),
    }
}

pub struct Station {
    hw: Hardware,
    db: Db,
    calibration: CalibrationStore,
    irrigation: IrrigationController,
    housekeeping: Housekeeping,
    interval: Duration,
}

/// What one pass produced.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub reading: NewReading,
    pub reading_id: Option<i64>,
    pub decision: Option<Decision>,
}

impl Station {
    pub fn new(
        hw: Hardware,
        db: Db,
        calibration: CalibrationStore,
        irrigation: IrrigationController,
        housekeeping: Housekeeping,
        interval: Duration,
    ) -> Self {
        Self {
            hw,
            db,
            calibration,
            irrigation,
            housekeeping,
            interval,
        }
    }

    /// One full pass. Never fails: every stage logs its own errors so the
    /// next stage still runs.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let snap = self.hw.snapshot().await;
        let profile = self.calibration.load();
        let reading = build_reading(&snap, &profile, now_timestamp());

        let reading_id = match self.db.insert_reading(&reading).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!("failed to persist reading: {e:#}");
                None
            }
        };

        info!(
            id = reading_id,
            air_temp = reading.air_temp,
            air_humidity = reading.air_humidity,
            soil_temp = reading.soil_temp,
            soil_percent = reading.soil_percent,
            lux = reading.lux,
            "sample recorded"
        );

        let decision = match self.irrigation.evaluate(reading.soil_percent).await {
            Ok(d) => Some(d),
            Err(e) => {
                error!("irrigation cycle failed: {e:#}");
                None
            }
        };

        self.housekeeping.run().await;

        CycleReport {
            reading,
            reading_id,
            decision,
        }
    }

    /// Run until `shutdown` flips to true (or its sender is dropped). A
    /// cycle already in progress, including a watering hold, is finished
    /// before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if let Err(e) = std::fs::create_dir_all(self.housekeeping.images_dir()) {
            error!("cannot create images dir: {e}");
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_sec = self.interval.as_secs(), "sampling loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            self.run_cycle().await;
        }

        info!("sampling loop stopped");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::memory_db;
    use crate::db::Order;
    use crate::guard::WateringGuard;
    use crate::hardware::tests::fixed_hardware;
    use crate::irrigation::WateringPolicy;
    use crate::relay::Relay;
    use crate::sensors::{AirSample, SoilSample};

    fn policy() -> WateringPolicy {
        WateringPolicy {
            threshold_percent: 40.0,
            duration: Duration::from_millis(10),
            cooldown: Duration::from_secs(3600),
        }
    }

    async fn station(voltage: f64, dir: &std::path::Path) -> Station {
        let hw = fixed_hardware(voltage);
        let db = memory_db().await;
        let irrigation = IrrigationController::new(
            hw.relays.clone(),
            db.clone(),
            WateringGuard::new(dir.join("last_watering.txt")),
            policy(),
        );
        Station::new(
            hw,
            db,
            CalibrationStore::new(dir.join("cal.json")),
            irrigation,
            Housekeeping::new(dir.join("logs"), Duration::from_secs(90 * 86400), None),
            Duration::from_secs(3600),
        )
    }

    // -- Rounding ---------------------------------------------------------

    #[test]
    fn reading_is_rounded_per_field() {
        let snap = Snapshot {
            air: Some(AirSample {
                temperature: 21.456,
                humidity: 55.555,
            }),
            soil_temp: Some(18.0625),
            soil: Some(SoilSample {
                raw: 8000,
                voltage: 1.00049,
            }),
            lux: Some(321.666),
        };
        let r = build_reading(&snap, &CalibrationProfile::default(), "t".into());
        assert_eq!(r.air_temp, Some(21.46));
        assert_eq!(r.soil_temp, Some(18.06));
        assert_eq!(r.soil_voltage, Some(1.0));
        assert_eq!(r.soil_percent, Some(42.82));
        assert_eq!(r.lux, Some(321.67));
        assert_eq!(r.soil_raw, Some(8000));
    }

    #[test]
    fn missing_probe_means_missing_percent() {
        let r = build_reading(&Snapshot::default(), &CalibrationProfile::default(), "t".into());
        assert_eq!(r.soil_percent, None);
        assert_eq!(r.air_temp, None);
    }

    // -- Cycle ------------------------------------------------------------

    #[tokio::test]
    async fn dry_soil_cycle_persists_and_waters() {
        let dir = tempfile::tempdir().unwrap();
        // 1.5 V against the 1.60/0.20 default is ~7 %.
        let mut st = station(1.5, dir.path()).await;

        let report = st.run_cycle().await;
        assert_eq!(report.reading_id, Some(1));
        assert_eq!(report.decision, Some(Decision::Water));
        assert_eq!(st.hw.relays.get(Relay::Pump), Some(false));

        let events = st.db.query_actuator_events(0).await.unwrap();
        assert_eq!(events.len(), 2);
        let rows = st.db.query_readings(0, Order::Asc, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].soil_voltage, Some(1.5));
    }

    #[tokio::test]
    async fn wet_soil_cycle_does_not_water() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = station(0.3, dir.path()).await;
        let report = st.run_cycle().await;
        assert!(matches!(report.decision, Some(Decision::MoistEnough { .. })));
        assert!(st.db.query_actuator_events(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_after_first_pass() {
        let dir = tempfile::tempdir().unwrap();
        let st = station(0.3, dir.path()).await;
        let db = st.db.clone();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(st.run(rx));
        // First pass runs immediately.
        for _ in 0..50 {
            if db.count_readings().await.unwrap() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(db.count_readings().await.unwrap(), 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop did not stop")
            .unwrap()
            .unwrap();
        assert!(dir.path().join("logs").is_dir());
    }
}
