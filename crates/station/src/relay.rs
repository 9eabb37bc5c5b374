//! Relay control. The `hw` feature drives real pins through rppal; without
//! it each relay is backed by an in-memory line that only tracks its level.
//!
//! Logical state ("energized") and electrical level are kept apart: with an
//! active-low board, OFF is a HIGH pin. Getting that backwards runs the pump
//! when the caller asked for it to stop.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

#[cfg(feature = "hw")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Relay identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relay {
    /// Irrigation pump (RELAY1).
    Pump,
    /// Grow light or any secondary load (RELAY2).
    Light,
}

impl Relay {
    pub const ALL: [Relay; 2] = [Relay::Pump, Relay::Light];

    pub fn name(self) -> &'static str {
        match self {
            Relay::Pump => "pump",
            Relay::Light => "light",
        }
    }
}

impl fmt::Display for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Relay {
    type Err = String;

    /// Accepts role names as well as the board labels `relay1` / `relay2`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pump" | "relay1" | "1" => Ok(Relay::Pump),
            "light" | "relay2" | "2" => Ok(Relay::Light),
            other => Err(format!("unknown relay '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Output lines
// ---------------------------------------------------------------------------

/// One digital output. `high` is the electrical level, not the relay state.
pub trait OutputLine: Send {
    fn set_level(&mut self, high: bool) -> Result<()>;
}

#[cfg(feature = "hw")]
impl OutputLine for OutputPin {
    fn set_level(&mut self, high: bool) -> Result<()> {
        if high {
            self.set_high();
        } else {
            self.set_low();
        }
        Ok(())
    }
}

/// Output line that only remembers its level. Clones share the level, so a
/// test can keep one and watch what the board drives.
#[derive(Clone, Default)]
pub struct MemoryLine {
    level: Arc<Mutex<Option<bool>>>,
}

impl MemoryLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last level driven, `None` before the first write.
    pub fn level(&self) -> Option<bool> {
        *self.level.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl OutputLine for MemoryLine {
    fn set_level(&mut self, high: bool) -> Result<()> {
        *self.level.lock().unwrap_or_else(|p| p.into_inner()) = Some(high);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Relay board
// ---------------------------------------------------------------------------

struct RelayChannel {
    line: Box<dyn OutputLine>,
    energized: bool,
}

/// The actuator driver. Holds the in-memory truth of what is energized.
pub struct RelayBoard {
    channels: BTreeMap<Relay, RelayChannel>,
    active_low: bool,
}

impl RelayBoard {
    /// Build a board from already-opened lines and drive every one OFF.
    pub fn with_lines(
        lines: impl IntoIterator<Item = (Relay, Box<dyn OutputLine>)>,
        active_low: bool,
    ) -> Result<Self> {
        let mut board = Self {
            channels: lines
                .into_iter()
                .map(|(relay, line)| {
                    (
                        relay,
                        RelayChannel {
                            line,
                            energized: false,
                        },
                    )
                })
                .collect(),
            active_low,
        };

        // Fail-safe: ensure "OFF" at startup
        for relay in board.relays() {
            board.set(relay, false)?;
        }
        Ok(board)
    }

    /// Claim the GPIO pins for the given relays. Pins not listed are never
    /// touched, so another process may own them.
    #[cfg(feature = "hw")]
    pub fn open(pins: &[(Relay, u8)], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new().context("failed to open GPIO")?;
        let mut lines: Vec<(Relay, Box<dyn OutputLine>)> = Vec::new();
        for &(relay, pin_num) in pins {
            // Start at the OFF level so the relay never blips on.
            let pin = gpio
                .get(pin_num)
                .with_context(|| format!("failed to claim GPIO {pin_num} for {relay}"))?;
            let pin = if active_low {
                pin.into_output_high()
            } else {
                pin.into_output_low()
            };
            info!(%relay, gpio = pin_num, active_low, "relay registered");
            lines.push((relay, Box::new(pin)));
        }
        Self::with_lines(lines, active_low)
    }

    /// In-memory board (development, no hardware). Also returns the lines so
    /// simulated sensors can observe what the relays are driving.
    #[cfg(not(feature = "hw"))]
    pub fn open_memory(
        pins: &[(Relay, u8)],
        active_low: bool,
    ) -> Result<(Self, BTreeMap<Relay, MemoryLine>)> {
        let mut lines = BTreeMap::new();
        for &(relay, pin_num) in pins {
            info!(%relay, gpio = pin_num, "[mock-gpio] relay registered (not wired)");
            lines.insert(relay, MemoryLine::new());
        }
        let board = Self::with_lines(
            lines
                .iter()
                .map(|(relay, line)| (*relay, Box::new(line.clone()) as Box<dyn OutputLine>)),
            active_low,
        )?;
        Ok((board, lines))
    }

    pub fn relays(&self) -> Vec<Relay> {
        self.channels.keys().copied().collect()
    }

    /// Electrical level that produces the requested logical state.
    fn level_for(&self, energized: bool) -> bool {
        if self.active_low {
            // active-low relay: LOW = ON, HIGH = OFF
            !energized
        } else {
            energized
        }
    }

    pub fn set(&mut self, relay: Relay, energized: bool) -> Result<()> {
        let level = self.level_for(energized);
        let channel = self
            .channels
            .get_mut(&relay)
            .with_context(|| format!("relay {relay} is not wired"))?;
        channel
            .line
            .set_level(level)
            .with_context(|| format!("failed to drive relay {relay}"))?;
        channel.energized = energized;
        info!(%relay, state = on_off(energized), "relay set");
        Ok(())
    }

    /// In-memory state; never read back from the database.
    pub fn get(&self, relay: Relay) -> Option<bool> {
        self.channels.get(&relay).map(|c| c.energized)
    }

    pub fn states(&self) -> BTreeMap<Relay, bool> {
        self.channels
            .iter()
            .map(|(relay, c)| (*relay, c.energized))
            .collect()
    }

    /// Drive every relay OFF, continuing past failures.
    pub fn all_off(&mut self) -> Result<()> {
        let mut first_err = None;
        for relay in self.relays() {
            if let Err(e) = self.set(relay, false) {
                warn!(%relay, "all_off: {e:#}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

pub fn on_off(energized: bool) -> &'static str {
    if energized {
        "ON"
    } else {
        "OFF"
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Cloneable handle serializing every relay mutation through one lock.
/// A plain mutex so shutoff also works from `Drop`.
#[derive(Clone)]
pub struct SharedRelays(Arc<Mutex<RelayBoard>>);

impl SharedRelays {
    pub fn new(board: RelayBoard) -> Self {
        Self(Arc::new(Mutex::new(board)))
    }

    pub fn lock(&self) -> MutexGuard<'_, RelayBoard> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, relay: Relay, energized: bool) -> Result<()> {
        self.lock().set(relay, energized)
    }

    pub fn get(&self, relay: Relay) -> Option<bool> {
        self.lock().get(relay)
    }

    pub fn states(&self) -> BTreeMap<Relay, bool> {
        self.lock().states()
    }

    pub fn all_off(&self) -> Result<()> {
        self.lock().all_off()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Board with memory lines; returns the lines so tests can inspect levels.
    fn test_board(active_low: bool) -> (RelayBoard, MemoryLine, MemoryLine) {
        let pump = MemoryLine::new();
        let light = MemoryLine::new();
        let board = RelayBoard::with_lines(
            [
                (Relay::Pump, Box::new(pump.clone()) as Box<dyn OutputLine>),
                (Relay::Light, Box::new(light.clone()) as Box<dyn OutputLine>),
            ],
            active_low,
        )
        .unwrap();
        (board, pump, light)
    }

    struct BrokenLine;

    impl OutputLine for BrokenLine {
        fn set_level(&mut self, _high: bool) -> Result<()> {
            anyhow::bail!("bus fault")
        }
    }

    // -- Polarity -------------------------------------------------------------

    #[test]
    fn active_low_board_starts_high() {
        let (board, pump, light) = test_board(true);
        assert_eq!(pump.level(), Some(true));
        assert_eq!(light.level(), Some(true));
        assert_eq!(board.get(Relay::Pump), Some(false));
    }

    #[test]
    fn active_low_on_drives_low() {
        let (mut board, pump, _) = test_board(true);
        board.set(Relay::Pump, true).unwrap();
        assert_eq!(pump.level(), Some(false));
        assert_eq!(board.get(Relay::Pump), Some(true));

        board.set(Relay::Pump, false).unwrap();
        assert_eq!(pump.level(), Some(true));
        assert_eq!(board.get(Relay::Pump), Some(false));
    }

    #[test]
    fn active_high_on_drives_high() {
        let (mut board, pump, _) = test_board(false);
        assert_eq!(pump.level(), Some(false));
        board.set(Relay::Pump, true).unwrap();
        assert_eq!(pump.level(), Some(true));
    }

    // -- State ----------------------------------------------------------------

    #[test]
    fn all_off_resets_everything() {
        let (mut board, pump, light) = test_board(true);
        board.set(Relay::Pump, true).unwrap();
        board.set(Relay::Light, true).unwrap();
        board.all_off().unwrap();
        assert_eq!(board.get(Relay::Pump), Some(false));
        assert_eq!(board.get(Relay::Light), Some(false));
        assert_eq!(pump.level(), Some(true));
        assert_eq!(light.level(), Some(true));
    }

    #[test]
    fn board_without_light_never_drives_it() {
        let pump = MemoryLine::new();
        let light = MemoryLine::new();
        let mut board = RelayBoard::with_lines(
            [(Relay::Pump, Box::new(pump.clone()) as Box<dyn OutputLine>)],
            true,
        )
        .unwrap();
        board.set(Relay::Pump, true).unwrap();
        board.all_off().unwrap();
        assert!(board.set(Relay::Light, false).is_err());

        assert_eq!(board.relays(), vec![Relay::Pump]);
        assert_eq!(pump.level(), Some(true));
        assert_eq!(light.level(), None);
    }

    #[test]
    fn failed_write_keeps_previous_state() {
        let mut board = RelayBoard::with_lines(
            [(Relay::Light, Box::new(MemoryLine::new()) as Box<dyn OutputLine>)],
            true,
        )
        .unwrap();
        board.channels.insert(
            Relay::Pump,
            RelayChannel {
                line: Box::new(BrokenLine),
                energized: false,
            },
        );
        assert!(board.set(Relay::Pump, true).is_err());
        assert_eq!(board.get(Relay::Pump), Some(false));
        // all_off still reaches the healthy relay
        assert!(board.all_off().is_err());
        assert_eq!(board.get(Relay::Light), Some(false));
    }

    #[test]
    fn unwired_relay_is_an_error() {
        let mut board = RelayBoard::with_lines(
            [(Relay::Pump, Box::new(MemoryLine::new()) as Box<dyn OutputLine>)],
            true,
        )
        .unwrap();
        assert!(board.set(Relay::Light, true).is_err());
        assert_eq!(board.get(Relay::Light), None);
    }

    #[test]
    fn shared_handle_sees_same_board() {
        let (board, _, _) = test_board(true);
        let shared = SharedRelays::new(board);
        let other = shared.clone();
        shared.set(Relay::Light, true).unwrap();
        assert_eq!(other.get(Relay::Light), Some(true));
        assert!(other.states()[&Relay::Light]);
    }

    // -- Parsing --------------------------------------------------------------

    #[test]
    fn relay_parses_roles_and_board_labels() {
        assert_eq!("pump".parse::<Relay>(), Ok(Relay::Pump));
        assert_eq!("RELAY1".parse::<Relay>(), Ok(Relay::Pump));
        assert_eq!(" light ".parse::<Relay>(), Ok(Relay::Light));
        assert_eq!("2".parse::<Relay>(), Ok(Relay::Light));
        assert!("fan".parse::<Relay>().is_err());
    }
}
