//! Relay outputs. The `gpio` feature gates the real rppal driver; without it,
//! a mock board keeps pin levels in memory and logs every change.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HardwareError {
    #[error("no relay wired for channel '{0}'")]
    NotWired(String),
    #[error("relay '{channel}' fault: {reason}")]
    Fault { channel: String, reason: String },
}

/// Minimal relay interface the scheduler drives. `set` must be idempotent.
pub trait RelayBoard: Send + Sync {
    fn set(&self, channel: &str, active: bool) -> Result<(), HardwareError>;

    /// Checks that the channel still matches the last commanded level.
    fn verify(&self, _channel: &str) -> Result<(), HardwareError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
struct Line {
    pin: OutputPin,
    commanded: bool,
}

#[cfg(feature = "gpio")]
pub(crate) struct GpioBoard {
    lines: Mutex<HashMap<String, Line>>, // channel -> GPIO line
    active_low: bool,                    // most relay hats are active-low
}

#[cfg(feature = "gpio")]
impl GpioBoard {
    pub(crate) fn new(channel_to_gpio: &[(String, u8)], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut lines = HashMap::new();

        for (channel, pin_num) in channel_to_gpio {
            let mut pin = gpio.get(*pin_num)?.into_output();
            // pumps start OFF
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }
            tracing::debug!(channel = %channel, gpio = pin_num, "relay line claimed");
            lines.insert(
                channel.clone(),
                Line {
                    pin,
                    commanded: false,
                },
            );
        }

        Ok(Self {
            lines: Mutex::new(lines),
            active_low,
        })
    }

    fn level_is_on(&self, pin: &OutputPin) -> bool {
        if self.active_low {
            pin.is_set_low()
        } else {
            pin.is_set_high()
        }
    }
}

#[cfg(feature = "gpio")]
impl RelayBoard for GpioBoard {
    fn set(&self, channel: &str, active: bool) -> Result<(), HardwareError> {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let line = lines
            .get_mut(channel)
            .ok_or_else(|| HardwareError::NotWired(channel.to_string()))?;

        // active-low: LOW = ON, HIGH = OFF
        match (self.active_low, active) {
            (true, true) | (false, false) => line.pin.set_low(),
            (true, false) | (false, true) => line.pin.set_high(),
        }
        line.commanded = active;
        tracing::debug!(channel, on = active, "relay set");
        Ok(())
    }

    fn verify(&self, channel: &str) -> Result<(), HardwareError> {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let line = lines
            .get(channel)
            .ok_or_else(|| HardwareError::NotWired(channel.to_string()))?;
        if self.level_is_on(&line.pin) != line.commanded {
            return Err(HardwareError::Fault {
                channel: channel.to_string(),
                reason: format!("readback disagrees with commanded on={}", line.commanded),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct GpioBoard {
    lines: Mutex<HashMap<String, bool>>, // channel -> on/off
}

#[cfg(not(feature = "gpio"))]
impl GpioBoard {
    pub(crate) fn new(channel_to_gpio: &[(String, u8)], _active_low: bool) -> Result<Self> {
        let mut lines = HashMap::new();
        for (channel, pin_num) in channel_to_gpio {
            tracing::info!(channel = %channel, gpio = pin_num, "mock relay registered (not wired)");
            lines.insert(channel.clone(), false);
        }
        Ok(Self {
            lines: Mutex::new(lines),
        })
    }

    #[cfg(test)]
    fn is_on(&self, channel: &str) -> bool {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.get(channel).copied().unwrap_or(false)
    }
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard for GpioBoard {
    fn set(&self, channel: &str, active: bool) -> Result<(), HardwareError> {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let state = lines
            .get_mut(channel)
            .ok_or_else(|| HardwareError::NotWired(channel.to_string()))?;
        *state = active;
        tracing::info!(channel, on = active, "[mock-gpio] relay set");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;

    fn board(channels: &[(&str, u8)]) -> GpioBoard {
        let map: Vec<(String, u8)> = channels
            .iter()
            .map(|(name, pin)| (name.to_string(), *pin))
            .collect();
        GpioBoard::new(&map, true).unwrap()
    }

    // -- GpioBoard (mock) ----------------------------------------------------

    #[test]
    fn new_board_starts_all_off() {
        let board = board(&[("ph_up", 23), ("mist", 21)]);
        assert!(!board.is_on("ph_up"));
        assert!(!board.is_on("mist"));
    }

    #[test]
    fn set_on_then_off() {
        let board = board(&[("water", 20)]);
        board.set("water", true).unwrap();
        assert!(board.is_on("water"));
        board.set("water", false).unwrap();
        assert!(!board.is_on("water"));
    }

    #[test]
    fn set_is_idempotent() {
        let board = board(&[("water", 20)]);
        board.set("water", false).unwrap();
        board.set("water", false).unwrap();
        assert!(!board.is_on("water"));
    }

    #[test]
    fn unwired_channel_is_an_error() {
        let board = board(&[("water", 20)]);
        let err = board.set("nonexistent", true).unwrap_err();
        assert_eq!(err, HardwareError::NotWired("nonexistent".into()));
    }

    #[test]
    fn mock_verify_always_passes() {
        let board = board(&[("water", 20)]);
        board.set("water", true).unwrap();
        assert!(board.verify("water").is_ok());
    }
}
