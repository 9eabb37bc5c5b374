//! Threshold-with-cooldown irrigation.
//!
//! ```text
//! Idle ──[moisture < threshold && cooldown elapsed]──▶ Watering
//!  ▲                                                      │
//!  └────────[hold done or failed; pump confirmed OFF]─────┘
//! ```
//!
//! The decision is a pure function of the moisture reading, the guard
//! timestamp and the clock. Performing a cycle energizes the pump, holds,
//! and de-energizes on every exit path; a [`PumpGuard`] covers the paths an
//! `await` cannot (cancellation, panic).

use anyhow::{Context, Result};
use std::future::Future;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{Action, Db, EventSource};
use crate::guard::WateringGuard;
use crate::relay::{Relay, SharedRelays};

/// The relays automatic logic owns. The light stays under manual control.
pub const AUTOMATIC_RELAYS: &[Relay] = &[Relay::Pump];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WateringPolicy {
    pub threshold_percent: f64,
    pub duration: Duration,
    pub cooldown: Duration,
}

impl WateringPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            threshold_percent: cfg.watering.threshold_percent,
            duration: Duration::from_secs(cfg.watering.duration_sec),
            cooldown: Duration::from_secs(cfg.watering.cooldown_sec),
        }
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Water,
    /// No moisture value this cycle; never water blind.
    NoReading,
    MoistEnough { percent: f64 },
    CoolingDown { remaining: Duration },
}

impl Decision {
    pub fn should_water(&self) -> bool {
        matches!(self, Decision::Water)
    }
}

pub fn decide(
    moisture: Option<f64>,
    last_watering: Option<OffsetDateTime>,
    now: OffsetDateTime,
    policy: &WateringPolicy,
) -> Decision {
    let Some(percent) = moisture.filter(|m| m.is_finite()) else {
        return Decision::NoReading;
    };
    if percent >= policy.threshold_percent {
        return Decision::MoistEnough { percent };
    }
    if let Some(last) = last_watering {
        let elapsed = now - last;
        let cooldown = time::Duration::try_from(policy.cooldown).unwrap_or(time::Duration::MAX);
        if elapsed < cooldown {
            let remaining = (cooldown - elapsed).unsigned_abs();
            return Decision::CoolingDown { remaining };
        }
    }
    Decision::Water
}

// ---------------------------------------------------------------------------
// Drop guard
// ---------------------------------------------------------------------------

/// De-energizes the pump when dropped while armed. The cycle disarms it
/// after a normal shutoff; any other exit (cancelled future, panic) still
/// turns the pump off.
pub struct PumpGuard {
    relays: Option<SharedRelays>,
}

impl PumpGuard {
    pub fn arm(relays: SharedRelays) -> Self {
        Self {
            relays: Some(relays),
        }
    }

    /// Turn the pump off now and disarm.
    pub fn release(mut self) -> Result<()> {
        match self.relays.take() {
            Some(relays) => relays.set(Relay::Pump, false),
            None => Ok(()),
        }
    }
}

impl Drop for PumpGuard {
    fn drop(&mut self) {
        if let Some(relays) = self.relays.take() {
            warn!("watering interrupted, forcing pump off");
            if let Err(e) = relays.set(Relay::Pump, false) {
                error!("pump shutoff from guard failed: {e:#}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrrigationState {
    Idle,
    Watering { since: Instant },
}

pub struct IrrigationController {
    relays: SharedRelays,
    db: Db,
    guard: WateringGuard,
    policy: WateringPolicy,
    state: IrrigationState,
}

impl IrrigationController {
    pub fn new(relays: SharedRelays, db: Db, guard: WateringGuard, policy: WateringPolicy) -> Self {
        Self {
            relays,
            db,
            guard,
            policy,
            state: IrrigationState::Idle,
        }
    }

    pub fn state(&self) -> IrrigationState {
        self.state
    }

    pub fn policy(&self) -> &WateringPolicy {
        &self.policy
    }

    /// Decide on this cycle's moisture and water if eligible.
    pub async fn evaluate(&mut self, moisture: Option<f64>) -> Result<Decision> {
        if let IrrigationState::Watering { .. } = self.state {
            // A previous cycle was cancelled mid-hold; its guard already
            // turned the pump off.
            warn!("resetting stale watering state");
            self.state = IrrigationState::Idle;
        }

        let decision = decide(
            moisture,
            self.guard.last(),
            OffsetDateTime::now_utc(),
            &self.policy,
        );
        match decision {
            Decision::Water => {
                info!(
                    moisture = moisture.unwrap_or_default(),
                    threshold = self.policy.threshold_percent,
                    duration_sec = self.policy.duration.as_secs(),
                    "moisture below threshold, watering"
                );
                self.water().await?;
            }
            Decision::NoReading => warn!("no moisture reading, skipping irrigation"),
            Decision::MoistEnough { percent } => {
                info!(percent, threshold = self.policy.threshold_percent, "moisture adequate")
            }
            Decision::CoolingDown { remaining } => {
                info!(remaining_sec = remaining.as_secs(), "watering cooldown active")
            }
        }
        Ok(decision)
    }

    /// One watering cycle with a timed hold.
    pub async fn water(&mut self) -> Result<()> {
        let duration = self.policy.duration;
        self.water_with(async move {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }

    /// One watering cycle; `hold` decides how long the pump stays on. The
    /// guard timestamp is written only if the hold completed and the pump
    /// is confirmed off.
    pub async fn water_with<F>(&mut self, hold: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        if let Err(e) = self.relays.set(Relay::Pump, true) {
            // Leave the line in a known state before giving up.
            if let Err(off) = self.relays.set(Relay::Pump, false) {
                warn!("pump shutoff after failed energize also failed: {off:#}");
            }
            return Err(e).context("failed to energize pump");
        }
        let pump = PumpGuard::arm(self.relays.clone());
        self.state = IrrigationState::Watering {
            since: Instant::now(),
        };
        self.record(Action::On).await;

        let held = hold.await;

        let off = pump.release();
        self.state = IrrigationState::Idle;
        match off {
            Ok(()) => self.record(Action::Off).await,
            Err(e) => {
                error!("pump did not switch off: {e:#}");
                return Err(e).context("failed to de-energize pump");
            }
        }

        held.context("watering hold failed")?;

        if let Err(e) = self.guard.record(OffsetDateTime::now_utc()) {
            error!("failed to persist watering time, next cooldown will be short: {e:#}");
        }
        info!("watering cycle complete");
        Ok(())
    }

    async fn record(&self, action: Action) {
        if let Err(e) = self
            .db
            .insert_actuator_event(Relay::Pump, action, EventSource::Auto)
            .await
        {
            error!(action = action.as_str(), "failed to record pump event: {e:#}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
