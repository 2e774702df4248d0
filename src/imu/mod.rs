// Inertial measurement for the balance loop
//
// Provides:
// - MPU-6050 register driver over any register bus
// - Calibrating sampler that turns raw counts into g and deg/s

pub mod mpu6050;
mod sampler;

pub use mpu6050::Mpu6050;
pub use sampler::{CalibrationError, CalibrationOffsets, ImuSampler, SensorError};

use crate::bridge::BusError;
use crate::messages::RawImuReading;

/// Source of raw accelerometer and gyroscope counts
pub trait ImuDriver {
    /// Bring the device out of reset; called once before calibration
    fn initialize(&mut self) -> Result<(), BusError> {
        Ok(())
    }

    fn read_raw(&mut self) -> Result<RawImuReading, BusError>;
}

/// Byte-addressed register access to a device on a shared bus
pub trait RegisterBus {
    fn read_registers(&mut self, device: u8, addr: u8, buf: &mut [u8]) -> Result<(), BusError>;

    fn write_registers(&mut self, device: u8, addr: u8, data: &[u8]) -> Result<(), BusError>;
}
