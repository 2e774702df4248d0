// Dual H-bridge motor driver for the balance buggy
//
// Each wheel has a forward and a reverse PWM input. A speed s in [-1, 1]
// drives exactly one of them at round(max_duty * |s|); s == 0 de-energizes both.

use std::fmt;
use tracing::{debug, info, warn};

use super::PwmOutput;
use crate::bridge::BusError;
use crate::config::{BalanceConfig, ConfigError, HBridgeChannels, WheelChannels};
use crate::messages::MotorCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wheel {
    Left,
    Right,
}

impl fmt::Display for Wheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Wheel::Left => write!(f, "left"),
            Wheel::Right => write!(f, "right"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActuationError {
    #[error("Invalid {wheel} wheel speed {speed}, expected a value in [-1, 1]")]
    InvalidSpeed { wheel: Wheel, speed: f64 },

    #[error("Failed to program PWM channel {channel}: {source}")]
    Bus {
        channel: u8,
        #[source]
        source: BusError,
    },
}

/// (forward, reverse) duty for one wheel, or None if `speed` is not in [-1, 1]
pub fn duty_pair(speed: f64, max_duty: u16) -> Option<(u16, u16)> {
    if !(-1.0..=1.0).contains(&speed) {
        return None;
    }
    let duty = |s: f64| (f64::from(max_duty) * s).round() as u16;

    Some(if speed > 0.0 {
        (duty(speed), 0)
    } else if speed < 0.0 {
        (0, duty(-speed))
    } else {
        (0, 0)
    })
}

/// Motor driver for the two-wheeled base
pub struct MotorDriver<P: PwmOutput> {
    pwm: P,
    channels: WheelChannels,
    max_duty: u16,
    pwm_freq_hz: u32,
}

impl<P: PwmOutput> MotorDriver<P> {
    /// Create a driver, checking the duty ceiling against the hardware range
    pub fn new(pwm: P, config: &BalanceConfig) -> Result<Self, ConfigError> {
        let hardware_max = pwm.max_duty();
        if config.max_duty == 0 || config.max_duty > hardware_max {
            return Err(ConfigError::Invalid {
                field: "max_duty",
                reason: format!(
                    "{} is outside (0, {}] supported by the PWM hardware",
                    config.max_duty, hardware_max
                ),
            });
        }

        Ok(Self {
            pwm,
            channels: config.wheels,
            max_duty: config.max_duty,
            pwm_freq_hz: config.pwm_freq_hz,
        })
    }

    /// Program the same PWM frequency on all four inputs and leave them de-energized
    pub fn initialize(&mut self) -> Result<(), ActuationError> {
        info!(
            "Initializing H-bridge outputs at {} Hz, max duty {}",
            self.pwm_freq_hz, self.max_duty
        );
        for bridge in [self.channels.left, self.channels.right] {
            for channel in [bridge.forward, bridge.reverse] {
                self.pwm
                    .set_frequency(channel, self.pwm_freq_hz)
                    .map_err(|source| ActuationError::Bus { channel, source })?;
            }
        }
        self.stop()
    }

    /// Apply a drive command to both wheels
    ///
    /// Both speeds are validated before any channel is written.
    pub fn drive(&mut self, command: MotorCommand) -> Result<(), ActuationError> {
        let left = duty_pair(command.left, self.max_duty).ok_or(ActuationError::InvalidSpeed {
            wheel: Wheel::Left,
            speed: command.left,
        })?;
        let right = duty_pair(command.right, self.max_duty).ok_or(ActuationError::InvalidSpeed {
            wheel: Wheel::Right,
            speed: command.right,
        })?;

        debug!(
            "Setting duties: left={:?}, right={:?} (command {:?})",
            left, right, command
        );
        self.set_bridge(self.channels.left, left)?;
        self.set_bridge(self.channels.right, right)
    }

    /// De-energize all outputs
    pub fn stop(&mut self) -> Result<(), ActuationError> {
        self.drive(MotorCommand::zero())
    }

    pub fn max_duty(&self) -> u16 {
        self.max_duty
    }

    fn set_bridge(&mut self, bridge: HBridgeChannels, (fwd, rev): (u16, u16)) -> Result<(), ActuationError> {
        // Release the idle side first so both inputs are never driven together
        let order = if fwd > 0 {
            [(bridge.reverse, rev), (bridge.forward, fwd)]
        } else {
            [(bridge.forward, fwd), (bridge.reverse, rev)]
        };
        for (channel, duty) in order {
            self.pwm
                .set_duty(channel, duty)
                .map_err(|source| ActuationError::Bus { channel, source })?;
        }
        Ok(())
    }
}

impl<P: PwmOutput> Drop for MotorDriver<P> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop motors on drop: {}", e);
        }
    }
}
