// MPU-6050 accelerometer/gyroscope over a register bus

use tracing::{debug, info};

use super::{ImuDriver, RegisterBus};
use crate::bridge::BusError;
use crate::messages::RawImuReading;

/// Default I2C address (AD0 low)
pub const MPU6050_ADDR: u8 = 0x68;

/// Register addresses
pub const PWR_MGMT_1: u8 = 0x6B;
pub const ACCEL_XOUT_H: u8 = 0x3B;
pub const GYRO_XOUT_H: u8 = 0x43;
pub const WHO_AM_I: u8 = 0x75;

pub const WHO_AM_I_VALUE: u8 = 0x68;

/// ACCEL_XOUT_H..GYRO_ZOUT_L, including the two temperature bytes
const BURST_LEN: usize = 14;

pub struct Mpu6050<B> {
    bus: B,
    address: u8,
}

impl<B: RegisterBus> Mpu6050<B> {
    pub fn new(bus: B) -> Self {
        Self::with_address(bus, MPU6050_ADDR)
    }

    pub fn with_address(bus: B, address: u8) -> Self {
        Self { bus, address }
    }

    pub fn into_inner(self) -> B {
        self.bus
    }
}

impl<B: RegisterBus> ImuDriver for Mpu6050<B> {
    /// Check identity and wake the device from sleep
    fn initialize(&mut self) -> Result<(), BusError> {
        let mut id = [0u8; 1];
        self.bus.read_registers(self.address, WHO_AM_I, &mut id)?;
        if id[0] != WHO_AM_I_VALUE {
            return Err(BusError::InvalidResponse {
                device: self.address,
                reason: format!("WHO_AM_I returned 0x{:02X}", id[0]),
            });
        }

        self.bus.write_registers(self.address, PWR_MGMT_1, &[0x00])?;
        info!("MPU-6050 at 0x{:02X} awake", self.address);
        Ok(())
    }

    fn read_raw(&mut self) -> Result<RawImuReading, BusError> {
        let mut buf = [0u8; BURST_LEN];
        self.bus.read_registers(self.address, ACCEL_XOUT_H, &mut buf)?;
        let reading = decode_burst(&buf);
        debug!("MPU-6050 raw: {:?}", reading);
        Ok(reading)
    }
}

/// Decode the big-endian burst starting at ACCEL_XOUT_H
pub fn decode_burst(buf: &[u8; BURST_LEN]) -> RawImuReading {
    let word = |i: usize| i16::from_be_bytes([buf[i], buf[i + 1]]);
    // bytes 6..8 are temperature
    RawImuReading {
        accel_raw: (word(0), word(2), word(4)),
        gyro_raw: (word(8), word(10), word(12)),
    }
}
