// Fake IMU, register bus and PWM output for exercising the loop without hardware

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::bridge::BusError;
use crate::config::WheelChannels;
use crate::imu::mpu6050::MPU6050_ADDR;
use crate::imu::{ImuDriver, RegisterBus};
use crate::messages::RawImuReading;
use crate::motor::PwmOutput;

/// Raw counts for a sensor pitched by `deg` about the wheel axis
pub fn raw_tilt(deg: f64, one_g: f64) -> RawImuReading {
    let rad = deg.to_radians();
    let count = |v: f64| v.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
    RawImuReading::new((count(-rad.sin() * one_g), 0, count(rad.cos() * one_g)), (0, 0, 0))
}

/// IMU that replays a fixed script; the last reading repeats once the script runs out
#[derive(Debug, Clone)]
pub struct ScriptedImu {
    readings: Vec<RawImuReading>,
    reads: usize,
    fail_after: Option<usize>,
}

impl ScriptedImu {
    pub fn constant(reading: RawImuReading) -> Self {
        Self::sequence(vec![reading])
    }

    pub fn sequence(readings: Vec<RawImuReading>) -> Self {
        assert!(!readings.is_empty(), "script needs at least one reading");
        Self {
            readings,
            reads: 0,
            fail_after: None,
        }
    }

    /// Level readings that stop answering after `n` successful reads
    pub fn failing_after(n: usize) -> Self {
        Self::constant(raw_tilt(0.0, 16384.0)).with_failure_after(n)
    }

    pub fn with_failure_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Successful reads so far
    pub fn reads(&self) -> usize {
        self.reads
    }
}

impl ImuDriver for ScriptedImu {
    fn read_raw(&mut self) -> Result<RawImuReading, BusError> {
        if self.fail_after.is_some_and(|n| self.reads >= n) {
            return Err(BusError::Timeout {
                device: MPU6050_ADDR,
            });
        }
        let index = self.reads.min(self.readings.len() - 1);
        self.reads += 1;
        Ok(self.readings[index])
    }
}

/// In-memory register file; devices with no registers behave as absent
#[derive(Debug, Clone, Default)]
pub struct RegisterMap {
    registers: BTreeMap<(u8, u8), u8>,
}

impl RegisterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, device: u8, addr: u8, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            self.registers.insert((device, addr.wrapping_add(i as u8)), b);
        }
    }

    pub fn get(&self, device: u8, addr: u8) -> Option<u8> {
        self.registers.get(&(device, addr)).copied()
    }

    fn present(&self, device: u8) -> bool {
        self.registers.keys().any(|&(d, _)| d == device)
    }
}

impl RegisterBus for RegisterMap {
    fn read_registers(&mut self, device: u8, addr: u8, buf: &mut [u8]) -> Result<(), BusError> {
        if !self.present(device) {
            return Err(BusError::Timeout { device });
        }
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.get(device, addr.wrapping_add(i as u8)).unwrap_or(0);
        }
        Ok(())
    }

    fn write_registers(&mut self, device: u8, addr: u8, data: &[u8]) -> Result<(), BusError> {
        if !self.present(device) {
            return Err(BusError::Timeout { device });
        }
        self.set(device, addr, data);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PwmRecord {
    duties: BTreeMap<u8, u16>,
    frequencies: BTreeMap<u8, u32>,
    writes: Vec<(u8, u16)>,
    failing: bool,
}

/// PWM output that records every write; clones share the same record
#[derive(Debug, Clone)]
pub struct RecordingPwm {
    record: Rc<RefCell<PwmRecord>>,
    hardware_max: u16,
}

impl RecordingPwm {
    pub fn new(hardware_max: u16) -> Self {
        Self {
            record: Rc::default(),
            hardware_max,
        }
    }

    /// Make every subsequent write fail
    pub fn fail_writes(&self, failing: bool) {
        self.record.borrow_mut().failing = failing;
    }

    /// Current duty of a channel (0 if never written)
    pub fn duty(&self, channel: u8) -> u16 {
        self.record.borrow().duties.get(&channel).copied().unwrap_or(0)
    }

    pub fn duties(&self) -> BTreeMap<u8, u16> {
        self.record.borrow().duties.clone()
    }

    pub fn frequency(&self, channel: u8) -> Option<u32> {
        self.record.borrow().frequencies.get(&channel).copied()
    }

    pub fn writes(&self) -> Vec<(u8, u16)> {
        self.record.borrow().writes.clone()
    }

    /// Replay the write history and count moments where both inputs of a bridge were driven
    pub fn shoot_through_events(&self, wheels: &WheelChannels) -> usize {
        let mut state: BTreeMap<u8, u16> = BTreeMap::new();
        let mut events = 0;
        for &(channel, duty) in &self.record.borrow().writes {
            state.insert(channel, duty);
            for bridge in [wheels.left, wheels.right] {
                let fwd = state.get(&bridge.forward).copied().unwrap_or(0);
                let rev = state.get(&bridge.reverse).copied().unwrap_or(0);
                if fwd > 0 && rev > 0 {
                    events += 1;
                }
            }
        }
        events
    }
}

impl PwmOutput for RecordingPwm {
    fn max_duty(&self) -> u16 {
        self.hardware_max
    }

    fn set_duty(&mut self, channel: u8, duty: u16) -> Result<(), BusError> {
        let mut record = self.record.borrow_mut();
        if record.failing {
            return Err(BusError::DeviceError {
                device: crate::bridge::PWM_DEVICE,
                status: 0x01,
            });
        }
        record.duties.insert(channel, duty);
        record.writes.push((channel, duty));
        Ok(())
    }

    fn set_frequency(&mut self, channel: u8, hz: u32) -> Result<(), BusError> {
        let mut record = self.record.borrow_mut();
        if record.failing {
            return Err(BusError::DeviceError {
                device: crate::bridge::PWM_DEVICE,
                status: 0x01,
            });
        }
        record.frequencies.insert(channel, hz);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_tilt_level() {
        let reading = raw_tilt(0.0, 16384.0);
        assert_eq!(reading.accel_raw, (0, 0, 16384));
    }

    #[test]
    fn test_scripted_imu_repeats_last_reading() {
        let a = raw_tilt(0.0, 16384.0);
        let b = raw_tilt(10.0, 16384.0);
        let mut imu = ScriptedImu::sequence(vec![a, b]);
        assert_eq!(imu.read_raw().unwrap(), a);
        assert_eq!(imu.read_raw().unwrap(), b);
        assert_eq!(imu.read_raw().unwrap(), b);
        assert_eq!(imu.reads(), 3);
    }

    #[test]
    fn test_shoot_through_detection() {
        let wheels = WheelChannels::default();
        let mut pwm = RecordingPwm::new(u16::MAX);
        pwm.set_duty(wheels.left.forward, 100).unwrap();
        pwm.set_duty(wheels.left.reverse, 100).unwrap();
        assert_eq!(pwm.shoot_through_events(&wheels), 1);
    }
}
