use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use station::calibration::{CalibrationProfile, CalibrationStore};
use station::db::{format_timestamp, now_timestamp, Action, Db, EventSource, SensorReading};
use station::guard::WateringGuard;
use station::hardware::Hardware;
use station::relay::{on_off, Relay};
use station::status::StatusMarker;

use crate::supervisor::{Supervisor, SupervisorError};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<HubState>>;

// ---------------------------------------------------------------------------
// Event ring
// ---------------------------------------------------------------------------

pub struct HubState {
    pub started_at: Instant,
    pub events: VecDeque<HubEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubEvent {
    pub ts: String,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Logger,
    Relay,
    Calibration,
    Error,
    System,
}

impl HubState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn record_logger(&mut self, detail: String) {
        self.push_event(EventKind::Logger, detail);
    }

    pub fn record_relay(&mut self, relay: Relay, energized: bool) {
        self.push_event(EventKind::Relay, format!("{relay} set {}", on_off(energized)));
    }

    pub fn record_calibration(&mut self, detail: String) {
        self.push_event(EventKind::Calibration, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<HubEvent> {
        self.events.iter().rev().cloned().collect()
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(HubEvent {
            ts: now_timestamp(),
            kind,
            detail,
        });
    }
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// JSON responses
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    /// The logger's own status line (`RUNNING since ...` / `STOPPED`).
    pub logger: String,
    pub running: bool,
    pub pid: Option<u32>,
    pub relays: BTreeMap<Relay, bool>,
    pub calibration: CalibrationProfile,
    pub last_watering: Option<String>,
    pub latest_reading: Option<SensorReading>,
    pub events: Vec<HubEvent>,
}

/// Outcome of a start/stop/status request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunResult {
    pub ok: bool,
    pub msg: String,
    pub running: bool,
    pub pid: Option<u32>,
}

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

/// Everything a request handler can reach.
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub hw: Hardware,
    pub supervisor: Arc<Supervisor>,
    pub calibration: CalibrationStore,
    pub marker: StatusMarker,
    pub guard: WateringGuard,
    pub events: SharedState,
    pub stop_timeout: Duration,
}

impl AppState {
    fn run_result(&self, ok: bool, msg: String) -> RunResult {
        let pid = self.supervisor.pid();
        RunResult {
            ok,
            msg,
            running: pid.is_some(),
            pid,
        }
    }

    pub fn run_status(&self) -> RunResult {
        let msg = if self.supervisor.is_running() {
            "logger running"
        } else {
            "logger not running"
        };
        self.run_result(true, msg.to_string())
    }

    pub async fn start_logger(&self) -> RunResult {
        match self.supervisor.start().await {
            Ok(started) => {
                let msg = format!("logger started (pid {})", started.pid);
                self.events.write().await.record_logger(msg.clone());
                self.run_result(true, msg)
            }
            Err(e) => {
                warn!("start refused: {e}");
                self.events.write().await.record_error(e.to_string());
                self.run_result(false, e.to_string())
            }
        }
    }

    pub async fn stop_logger(&self) -> RunResult {
        match self.supervisor.stop(self.stop_timeout).await {
            Ok(stopped) if stopped.forced => {
                self.after_forced_kill(stopped.pid).await;
                let msg = format!("logger (pid {}) killed after ignoring SIGTERM", stopped.pid);
                self.events.write().await.record_logger(msg.clone());
                self.run_result(true, msg)
            }
            Ok(stopped) => {
                let msg = format!("logger stopped (pid {})", stopped.pid);
                self.events.write().await.record_logger(msg.clone());
                self.run_result(true, msg)
            }
            Err(SupervisorError::NotRunning) => {
                self.run_result(false, SupervisorError::NotRunning.to_string())
            }
            Err(e) => {
                error!("stop failed: {e}");
                self.events.write().await.record_error(e.to_string());
                self.run_result(false, e.to_string())
            }
        }
    }

    /// A killed logger may have died mid-watering and never cleared its
    /// marker.
    async fn after_forced_kill(&self, pid: u32) {
        warn!(pid, "logger was killed; switching pump off and clearing status");
        if let Err(e) = self.hw.relays.set(Relay::Pump, false) {
            error!("failed to switch pump off after kill: {e:#}");
        }
        if let Err(e) = self
            .db
            .insert_actuator_event(Relay::Pump, Action::Off, EventSource::System)
            .await
        {
            error!("failed to record pump OFF: {e:#}");
        }
        if let Err(e) = self.marker.clear() {
            error!("{e:#}");
        }
    }

    /// Switch a relay by hand. `None` toggles. Returns the new state.
    pub async fn set_relay(&self, relay: Relay, state: Option<bool>) -> anyhow::Result<bool> {
        let energized = state.unwrap_or_else(|| !self.hw.relays.get(relay).unwrap_or(false));
        if let Err(e) = self.hw.relays.set(relay, energized) {
            self.events
                .write()
                .await
                .record_error(format!("{relay}: {e:#}"));
            return Err(e);
        }
        info!(%relay, state = on_off(energized), "relay switched by hand");

        if let Err(e) = self
            .db
            .insert_actuator_event(relay, Action::from(energized), EventSource::Manual)
            .await
        {
            error!("failed to record relay event: {e:#}");
        }
        self.events.write().await.record_relay(relay, energized);
        Ok(energized)
    }

    pub async fn status(&self) -> anyhow::Result<StatusResponse> {
        let latest_reading = self.db.latest_reading().await?;
        let pid = self.supervisor.pid();
        let st = self.events.read().await;
        Ok(StatusResponse {
            uptime_secs: st.started_at.elapsed().as_secs(),
            logger: self.marker.read(),
            running: pid.is_some(),
            pid,
            relays: self.hw.relays.states(),
            calibration: self.calibration.load(),
            last_watering: self.guard.last().map(format_timestamp),
            latest_reading,
            events: st.recent(),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::supervisor::tests::{Behaviour, FakeLauncher};
    use anyhow::Result;
    use station::relay::{MemoryLine, OutputLine, RelayBoard, SharedRelays};
    use station::sensors::{AirSample, Sensor, SoilSample};
    use std::path::Path;

    /// Sensor that always reports the same value.
    pub(crate) struct Steady<T>(pub T, pub &'static str);

    impl<T: Copy + Send + 'static> Sensor for Steady<T> {
        type Value = T;

        fn name(&self) -> &'static str {
            self.1
        }

        fn read(&mut self) -> Result<T> {
            Ok(self.0)
        }
    }

    pub(crate) fn memory_relays() -> (SharedRelays, MemoryLine) {
        let pump = MemoryLine::new();
        let light = MemoryLine::new();
        let lines: Vec<(Relay, Box<dyn OutputLine>)> = vec![
            (Relay::Pump, Box::new(pump.clone())),
            (Relay::Light, Box::new(light)),
        ];
        let board = RelayBoard::with_lines(lines, true).unwrap();
        (SharedRelays::new(board), pump)
    }

    pub(crate) fn steady_hardware(voltage: f64) -> Hardware {
        let (relays, _) = memory_relays();
        Hardware::new(
            Steady(
                AirSample {
                    temperature: 22.5,
                    humidity: 61.0,
                },
                "dht22",
            ),
            Steady(17.25, "ds18b20"),
            Steady(
                SoilSample {
                    raw: (voltage * 8000.0) as i64,
                    voltage,
                },
                "ads1115",
            ),
            Steady(480.0, "bh1750"),
            relays,
            Duration::from_millis(500),
        )
    }

    pub(crate) async fn app_state(dir: &Path, hw: Hardware, behaviour: Behaviour) -> AppState {
        let db = Db::open("sqlite::memory:").await.unwrap();
        AppState {
            db,
            hw,
            supervisor: Arc::new(Supervisor::new(
                FakeLauncher::new(behaviour),
                Duration::from_millis(10),
            )),
            calibration: CalibrationStore::new(dir.join("soil_calibration.json")),
            marker: StatusMarker::new(dir.join("logger_status.txt")),
            guard: WateringGuard::new(dir.join("last_watering.txt")),
            events: HubState::shared(),
            stop_timeout: Duration::from_millis(300),
        }
    }

    // -- Event ring -------------------------------------------------------

    #[test]
    fn ring_keeps_newest_events() {
        let mut st = HubState::new();
        for i in 0..(MAX_EVENTS + 5) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        let recent = st.recent();
        assert_eq!(recent[0].detail, format!("event {}", MAX_EVENTS + 4));
        assert_eq!(recent.last().unwrap().detail, "event 5");
    }

    #[test]
    fn relay_event_detail() {
        let mut st = HubState::new();
        st.record_relay(Relay::Light, true);
        assert_eq!(st.events[0].kind, EventKind::Relay);
        assert_eq!(st.events[0].detail, "light set ON");
    }

    // -- Logger control ---------------------------------------------------

    #[tokio::test]
    async fn start_twice_reports_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_state(dir.path(), steady_hardware(0.9), Behaviour::Polite).await;

        let first = app.start_logger().await;
        assert!(first.ok);
        assert!(first.running);
        assert_eq!(first.pid, Some(1000));

        let second = app.start_logger().await;
        assert!(!second.ok);
        assert!(second.running);
        assert!(second.msg.contains("already running"), "{}", second.msg);
    }

    #[tokio::test]
    async fn stop_without_logger_is_not_ok() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_state(dir.path(), steady_hardware(0.9), Behaviour::Polite).await;
        let res = app.stop_logger().await;
        assert!(!res.ok);
        assert!(!res.running);
        assert_eq!(res.msg, "logger not running");
    }

    #[tokio::test]
    async fn forced_stop_cleans_up_after_logger() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_state(dir.path(), steady_hardware(0.9), Behaviour::Stubborn).await;
        app.marker.mark_running(1000).unwrap();
        app.hw.relays.set(Relay::Pump, true).unwrap();

        assert!(app.start_logger().await.ok);
        let res = app.stop_logger().await;
        assert!(res.ok);
        assert!(!res.running);
        assert!(res.msg.contains("killed"), "{}", res.msg);

        assert_eq!(app.hw.relays.get(Relay::Pump), Some(false));
        assert_eq!(app.marker.read(), station::status::STOPPED);
        let events = app.db.query_actuator_events(0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "OFF");
        assert_eq!(events[0].source, "system");
    }

    // -- Relays -----------------------------------------------------------

    #[tokio::test]
    async fn manual_relay_switch_records_event() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_state(dir.path(), steady_hardware(0.9), Behaviour::Polite).await;

        assert!(app.set_relay(Relay::Light, Some(true)).await.unwrap());
        // No explicit state toggles.
        assert!(!app.set_relay(Relay::Light, None).await.unwrap());

        let events = app.db.query_actuator_events(0).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "OFF");
        assert_eq!(events[1].action, "ON");
        assert!(events.iter().all(|e| e.source == "manual" && e.actuator == "light"));
    }

    // -- Status -----------------------------------------------------------

    #[tokio::test]
    async fn status_reports_stopped_logger_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_state(dir.path(), steady_hardware(0.9), Behaviour::Polite).await;
        let st = app.status().await.unwrap();
        assert_eq!(st.logger, "STOPPED");
        assert!(!st.running);
        assert_eq!(st.relays.get(&Relay::Pump), Some(&false));
        assert_eq!(st.calibration, CalibrationProfile::default());
        assert!(st.last_watering.is_none());
        assert!(st.latest_reading.is_none());
    }
}
