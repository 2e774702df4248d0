// Bench tools for checking the hardware before closing the loop
//
// imu_read: READ-ONLY, prints raw MPU-6050 counts (safe, no movement)
// motor_ramp: ramps both wheels forward then reverse (wheels must be off the ground)

use std::time::Duration;
use tokio::time::{interval, sleep};
use tracing::info;

use crate::bridge::{BusError, SerialBridge, PWM_DEVICE};
use crate::config::BalanceConfig;
use crate::imu::{ImuDriver, Mpu6050};
use crate::messages::MotorCommand;
use crate::motor::{MotorDriver, PwmOutput};
use crate::runtime::{BalanceError, StopToken};

/// Print `count` raw readings, `period` apart (0 = until stopped)
pub async fn imu_read<D: ImuDriver>(
    imu: &mut D,
    count: u64,
    period: Duration,
    mut stop: StopToken,
) -> Result<u64, BalanceError> {
    let mut ticker = interval(period);
    let mut reads = 0;

    while count == 0 || reads < count {
        tokio::select! {
            _ = stop.stopped() => break,
            _ = ticker.tick() => {}
        }
        let r = imu.read_raw()?;
        let (ax, ay, az) = r.accel_raw;
        let (gx, gy, gz) = r.gyro_raw;
        println!(
            "Accel: x={:6} y={:6} z={:6} | Gyro: x={:6} y={:6} z={:6}",
            ax, ay, az, gx, gy, gz
        );
        reads += 1;
    }
    Ok(reads)
}

/// Ramp profile: 0 -> 1 -> 0 forward, then the same in reverse
pub fn ramp_profile(steps: u32) -> Vec<f64> {
    let n = steps.max(1) as i64;
    let up = (0..=n).map(|i| i as f64 / n as f64);
    let down = (0..n).rev().map(|i| i as f64 / n as f64);
    let forward: Vec<f64> = up.chain(down).collect();
    let reverse = forward.iter().map(|s| -s);
    forward.iter().copied().chain(reverse).collect()
}

/// Drive both wheels through the ramp, holding each step for `hold`
///
/// The driver is stopped on every exit path.
pub async fn motor_ramp<P: PwmOutput>(
    motors: &mut MotorDriver<P>,
    steps: u32,
    hold: Duration,
    mut stop: StopToken,
) -> Result<(), BalanceError> {
    motors.initialize()?;

    let mut result: Result<(), BalanceError> = Ok(());
    for speed in ramp_profile(steps) {
        info!("Duty = {:.0} ({:+.2})", f64::from(motors.max_duty()) * speed.abs(), speed);
        if let Err(e) = motors.drive(MotorCommand::both(speed)) {
            result = Err(e.into());
            break;
        }
        tokio::select! {
            _ = stop.stopped() => break,
            _ = sleep(hold) => {}
        }
    }

    motors.stop()?;
    info!("Done, motors off.");
    result
}

/// Open the bridge and wake the IMU
pub fn open_imu(port: &str, config: &BalanceConfig) -> Result<Mpu6050<SerialBridge>, BalanceError> {
    let bridge = SerialBridge::open(port, config.bus_timeout())?;
    let mut imu = Mpu6050::new(bridge);
    imu.initialize()?;
    Ok(imu)
}

/// Open the bridge for PWM output only
pub fn open_motors(port: &str, config: &BalanceConfig) -> Result<MotorDriver<SerialBridge>, BalanceError> {
    let mut bridge = SerialBridge::open(port, config.bus_timeout())?;
    if !bridge.ping(PWM_DEVICE)? {
        return Err(BusError::Timeout { device: PWM_DEVICE }.into());
    }
    info!("PWM block 0x{:02X} responded", PWM_DEVICE);
    Ok(MotorDriver::new(bridge, config)?)
}
