//! Pump relays via GPIO. The `gpio` feature gates the real rppal driver;
//! without it, a mock board only tracks and logs the requested states.

use anyhow::Result;
use tracing::info;

use crate::actuator::Actuator;
use crate::config::RelayConfig;

#[cfg(feature = "gpio")]
use anyhow::Context;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Real relay board (production: requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct RelayBoard {
    water: OutputPin,
    fertilizer: OutputPin,
    active_low: bool,
    state: [bool; 2],
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub(crate) fn new(cfg: &RelayConfig) -> Result<Self> {
        let gpio = Gpio::new().context("open GPIO")?;
        let water = gpio
            .get(cfg.water_pin)
            .with_context(|| format!("claim water relay gpio {}", cfg.water_pin))?
            .into_output();
        let fertilizer = gpio
            .get(cfg.fertilizer_pin)
            .with_context(|| format!("claim fertilizer relay gpio {}", cfg.fertilizer_pin))?
            .into_output();

        let mut board = Self {
            water,
            fertilizer,
            active_low: cfg.active_low,
            state: [false; 2],
        };
        board.drive(Actuator::Water, false);
        board.drive(Actuator::Fertilizer, false);
        info!(
            water_pin = cfg.water_pin,
            fertilizer_pin = cfg.fertilizer_pin,
            active_low = cfg.active_low,
            "relay board initialised"
        );
        Ok(board)
    }

    fn drive(&mut self, actuator: Actuator, on: bool) {
        let active_low = self.active_low;
        let pin = match actuator {
            Actuator::Water => &mut self.water,
            Actuator::Fertilizer => &mut self.fertilizer,
        };
        // active-low boards energise the coil on LOW
        if on != active_low {
            pin.set_high()
        } else {
            pin.set_low()
        }
        self.state[slot(actuator)] = on;
    }

    pub(crate) fn set(&mut self, actuator: Actuator, on: bool) {
        self.drive(actuator, on);
        info!(%actuator, "relay {}", if on { "ON" } else { "OFF" });
    }

    pub(crate) fn is_on(&self, actuator: Actuator) -> bool {
        self.state[slot(actuator)]
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development: no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct RelayBoard {
    state: [bool; 2],
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub(crate) fn new(cfg: &RelayConfig) -> Result<Self> {
        info!(
            water_pin = cfg.water_pin,
            fertilizer_pin = cfg.fertilizer_pin,
            "[mock-gpio] relay board initialised (no hardware)"
        );
        Ok(Self { state: [false; 2] })
    }

    pub(crate) fn set(&mut self, actuator: Actuator, on: bool) {
        self.state[slot(actuator)] = on;
        info!(%actuator, "[mock-gpio] relay {}", if on { "ON" } else { "OFF" });
    }

    pub(crate) fn is_on(&self, actuator: Actuator) -> bool {
        self.state[slot(actuator)]
    }
}

// ---------------------------------------------------------------------------
// Shared behaviour
// ---------------------------------------------------------------------------

fn slot(actuator: Actuator) -> usize {
    match actuator {
        Actuator::Water => 0,
        Actuator::Fertilizer => 1,
    }
}

impl RelayBoard {
    /// Drive both outputs; only actual changes touch the pins.
    pub(crate) fn apply(&mut self, water_on: bool, fertilizer_on: bool) {
        for (actuator, on) in [(Actuator::Water, water_on), (Actuator::Fertilizer, fertilizer_on)] {
            if self.is_on(actuator) != on {
                self.set(actuator, on);
            }
        }
    }

    pub(crate) fn all_off(&mut self) {
        self.set(Actuator::Water, false);
        self.set(Actuator::Fertilizer, false);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
