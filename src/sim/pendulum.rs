// Inverted-pendulum rig standing in for the buggy.
//
// The IMU and PWM halves share one plant. Each IMU read advances the
// physics by one control period using the wheel duties currently applied,
// so the loop sees the effect of its previous command on the next tick.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::debug;

use crate::bridge::{BusError, HARDWARE_MAX_DUTY};
use crate::config::{BalanceConfig, WheelChannels};
use crate::imu::ImuDriver;
use crate::messages::RawImuReading;
use crate::motor::PwmOutput;

#[derive(Debug, Clone, Copy)]
pub struct PendulumParams {
    /// Pivot to centre of mass, metres
    pub length_m: f64,
    pub gravity: f64,
    /// Angular acceleration (rad/s^2) at full duty on both wheels
    pub motor_gain: f64,
    /// Viscous damping, 1/s
    pub damping: f64,
    /// Physics step per IMU read, seconds
    pub step_s: f64,
    /// Reads during which the rig is held upright (covers calibration)
    pub hold_reads: usize,
    /// Tilt at the moment the rig is let go
    pub release_tilt_deg: f64,
}

impl PendulumParams {
    pub fn for_config(config: &BalanceConfig) -> Self {
        Self {
            length_m: 0.15,
            gravity: 9.81,
            motor_gain: 40.0,
            damping: 0.5,
            step_s: config.dt_secs(),
            hold_reads: config.calibration_samples,
            release_tilt_deg: 5.0,
        }
    }
}

#[derive(Debug)]
struct Plant {
    params: PendulumParams,
    wheels: WheelChannels,
    max_duty: f64,
    accel_one_g: f64,
    gyro_lsb_per_dps: f64,
    theta: f64,
    omega: f64,
    reads: usize,
    duties: BTreeMap<u8, u16>,
}

impl Plant {
    fn wheel_drive(&self) -> f64 {
        let duty = |ch: u8| f64::from(self.duties.get(&ch).copied().unwrap_or(0));
        let left = duty(self.wheels.left.forward) - duty(self.wheels.left.reverse);
        let right = duty(self.wheels.right.forward) - duty(self.wheels.right.reverse);
        (left + right) / (2.0 * self.max_duty)
    }

    fn step(&mut self) {
        let p = self.params;
        if self.reads < p.hold_reads {
            self.theta = 0.0;
            self.omega = 0.0;
        } else if self.reads == p.hold_reads {
            self.theta = p.release_tilt_deg.to_radians();
            self.omega = 0.0;
        } else {
            let accel = (p.gravity / p.length_m) * self.theta.sin()
                - p.motor_gain * self.wheel_drive()
                - p.damping * self.omega;
            self.omega += accel * p.step_s;
            self.theta += self.omega * p.step_s;

            // Lying on the floor
            let floor = std::f64::consts::FRAC_PI_2;
            if self.theta.abs() >= floor {
                self.theta = floor.copysign(self.theta);
                self.omega = 0.0;
            }
        }
        self.reads += 1;
    }

    fn reading(&self) -> RawImuReading {
        let count = |v: f64| v.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        let g = self.accel_one_g;
        RawImuReading::new(
            (count(-self.theta.sin() * g), 0, count(self.theta.cos() * g)),
            (0, count(self.omega.to_degrees() * self.gyro_lsb_per_dps), 0),
        )
    }
}

/// Shared simulated plant; hand out `imu()` and `pwm()` to the loop
#[derive(Debug, Clone)]
pub struct PendulumRig {
    plant: Rc<RefCell<Plant>>,
}

impl PendulumRig {
    pub fn new(params: PendulumParams, config: &BalanceConfig) -> Self {
        let plant = Plant {
            params,
            wheels: config.wheels,
            max_duty: f64::from(config.max_duty),
            accel_one_g: config.accel_one_g,
            gyro_lsb_per_dps: config.gyro_lsb_per_dps,
            theta: 0.0,
            omega: 0.0,
            reads: 0,
            duties: BTreeMap::new(),
        };
        Self {
            plant: Rc::new(RefCell::new(plant)),
        }
    }

    pub fn imu(&self) -> SimImu {
        SimImu {
            plant: Rc::clone(&self.plant),
        }
    }

    pub fn pwm(&self) -> SimPwm {
        SimPwm {
            plant: Rc::clone(&self.plant),
        }
    }

    /// True pitch of the rig in degrees
    pub fn angle_deg(&self) -> f64 {
        self.plant.borrow().theta.to_degrees()
    }

    /// Whether the rig has fallen past the point the motors can recover
    pub fn has_fallen(&self) -> bool {
        self.angle_deg().abs() >= 90.0
    }
}

pub struct SimImu {
    plant: Rc<RefCell<Plant>>,
}

impl ImuDriver for SimImu {
    fn read_raw(&mut self) -> Result<RawImuReading, BusError> {
        let mut plant = self.plant.borrow_mut();
        plant.step();
        let reading = plant.reading();
        debug!("Sim rig: theta={:.3} deg", plant.theta.to_degrees());
        Ok(reading)
    }
}

pub struct SimPwm {
    plant: Rc<RefCell<Plant>>,
}

impl PwmOutput for SimPwm {
    fn max_duty(&self) -> u16 {
        HARDWARE_MAX_DUTY
    }

    fn set_duty(&mut self, channel: u8, duty: u16) -> Result<(), BusError> {
        self.plant.borrow_mut().duties.insert(channel, duty);
        Ok(())
    }

    fn set_frequency(&mut self, _channel: u8, _hz: u32) -> Result<(), BusError> {
        Ok(())
    }
}
