// Pitch estimation by complementary filter.
//
// Gyro integration is smooth but drifts; accelerometer tilt is stable but
// noisy. A fixed weight `alpha` blends the two:
//
// acc_angle = degrees(atan2(-accel.x, accel.z)) + mount_offset
// angle     = alpha * (angle_prev + gyro.y * dt) + (1 - alpha) * acc_angle

use serde::Serialize;

use crate::config::{AngleSeed, BalanceConfig};
use crate::messages::ImuSample;

/// Filter memory, owned by the scheduler and carried between ticks
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OrientationState {
    /// Pitch in degrees, 0 = upright
    pub angle: f64,
}

/// Result of one filter step
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Estimate {
    /// Fused pitch
    pub angle: f64,
    /// Accelerometer-only pitch, including the mounting correction
    pub acc_angle: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ComplementaryFilter {
    alpha: f64,
    mount_offset_deg: f64,
}

impl ComplementaryFilter {
    pub fn new(alpha: f64, mount_offset_deg: f64) -> Self {
        Self {
            alpha,
            mount_offset_deg,
        }
    }

    pub fn from_config(config: &BalanceConfig) -> Self {
        Self::new(config.alpha, config.mount_offset_deg)
    }

    /// Accelerometer tilt about the wheel axis, in degrees
    pub fn acc_angle(&self, sample: &ImuSample) -> f64 {
        let (x, _, z) = sample.accel;
        (-x).atan2(z).to_degrees() + self.mount_offset_deg
    }

    /// Initial filter state for the chosen seed
    pub fn seed(&self, seed: AngleSeed, first: &ImuSample) -> OrientationState {
        match seed {
            AngleSeed::Zero => OrientationState::default(),
            AngleSeed::Accelerometer => OrientationState {
                angle: self.acc_angle(first),
            },
        }
    }

    /// Advance the filter by one tick of `dt` seconds
    pub fn update(&self, state: &mut OrientationState, sample: &ImuSample, dt: f64) -> Estimate {
        let acc_angle = self.acc_angle(sample);
        // Pitch rate axis for the buggy's mounting orientation
        let gyro_rate = sample.gyro.1;

        state.angle =
            self.alpha * (state.angle + gyro_rate * dt) + (1.0 - self.alpha) * acc_angle;

        Estimate {
            angle: state.angle,
            acc_angle,
        }
    }
}
