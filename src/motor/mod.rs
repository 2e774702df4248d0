// Motor actuation for the two-wheeled base
//
// Provides:
// - PWM actuation interface (implemented by the serial bridge and the mocks)
// - Dual H-bridge driver mapping normalized speed to duty pairs

mod driver;

pub use driver::{duty_pair, ActuationError, MotorDriver, Wheel};

use crate::bridge::BusError;

/// PWM channels driving the H-bridge inputs
pub trait PwmOutput {
    /// Largest duty value the hardware accepts
    fn max_duty(&self) -> u16;

    fn set_duty(&mut self, channel: u8, duty: u16) -> Result<(), BusError>;

    fn set_frequency(&mut self, channel: u8, hz: u32) -> Result<(), BusError>;
}
