// Calibrated IMU sampling
//
// Calibration averages N stationary readings into per-axis offsets. Accel Z
// keeps earth gravity: its offset is the mean minus the 1 g reference.

use tracing::{debug, info};

use super::ImuDriver;
use crate::bridge::BusError;
use crate::config::BalanceConfig;
use crate::messages::{ImuSample, RawImuReading};

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("IMU read failed: {0}")]
    Bus(#[from] BusError),

    #[error("IMU sampled before calibration completed")]
    NotCalibrated,
}

#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("IMU initialization failed: {0}")]
    DeviceInit(#[source] BusError),

    #[error("Calibration needs at least one sample")]
    NoSamples,

    #[error("IMU read failed during calibration (sample {sample}): {source}")]
    Bus {
        sample: usize,
        #[source]
        source: BusError,
    },
}

/// Raw-count offsets subtracted from every reading
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CalibrationOffsets {
    pub accel: (f64, f64, f64),
    pub gyro: (f64, f64, f64),
}

pub struct ImuSampler<D> {
    driver: D,
    offsets: Option<CalibrationOffsets>,
    accel_one_g: f64,
    accel_lsb_per_g: f64,
    gyro_lsb_per_dps: f64,
}

impl<D: ImuDriver> ImuSampler<D> {
    pub fn new(driver: D, config: &BalanceConfig) -> Self {
        Self {
            driver,
            offsets: None,
            accel_one_g: config.accel_one_g,
            accel_lsb_per_g: config.accel_lsb_per_g,
            gyro_lsb_per_dps: config.gyro_lsb_per_dps,
        }
    }

    /// Average `samples` readings taken while the robot is held still
    ///
    /// Any bus error aborts calibration and leaves the sampler uncalibrated.
    pub fn calibrate(&mut self, samples: usize) -> Result<CalibrationOffsets, CalibrationError> {
        if samples == 0 {
            return Err(CalibrationError::NoSamples);
        }
        info!("Calibrating IMU over {} samples, keep the robot still", samples);
        self.offsets = None;

        let mut sum = [0.0f64; 6];
        for i in 0..samples {
            let raw = self
                .driver
                .read_raw()
                .map_err(|source| CalibrationError::Bus { sample: i, source })?;
            for (acc, v) in sum.iter_mut().zip(axes(&raw)) {
                *acc += v;
            }
        }

        let n = samples as f64;
        let mean = sum.map(|s| s / n);
        let offsets = CalibrationOffsets {
            accel: (mean[0], mean[1], mean[2] - self.accel_one_g),
            gyro: (mean[3], mean[4], mean[5]),
        };

        info!("IMU calibrated: {:?}", offsets);
        self.offsets = Some(offsets);
        Ok(offsets)
    }

    /// Use offsets from an earlier calibration
    pub fn set_offsets(&mut self, offsets: CalibrationOffsets) {
        self.offsets = Some(offsets);
    }

    pub fn offsets(&self) -> Option<CalibrationOffsets> {
        self.offsets
    }

    pub fn is_calibrated(&self) -> bool {
        self.offsets.is_some()
    }

    /// Read one sample with offsets removed, in g and deg/s
    pub fn sample(&mut self, timestamp_ms: u64) -> Result<ImuSample, SensorError> {
        let offsets = self.offsets.ok_or(SensorError::NotCalibrated)?;
        let raw = self.driver.read_raw()?;
        let [ax, ay, az, gx, gy, gz] = axes(&raw);

        let g = self.accel_lsb_per_g;
        let dps = self.gyro_lsb_per_dps;
        let sample = ImuSample {
            accel: (
                (ax - offsets.accel.0) / g,
                (ay - offsets.accel.1) / g,
                (az - offsets.accel.2) / g,
            ),
            gyro: (
                (gx - offsets.gyro.0) / dps,
                (gy - offsets.gyro.1) / dps,
                (gz - offsets.gyro.2) / dps,
            ),
            timestamp_ms,
        };
        debug!("IMU sample: {:?}", sample);
        Ok(sample)
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}

fn axes(raw: &RawImuReading) -> [f64; 6] {
    let (ax, ay, az) = raw.accel_raw;
    let (gx, gy, gz) = raw.gyro_raw;
    [ax, ay, az, gx, gy, gz].map(f64::from)
}
