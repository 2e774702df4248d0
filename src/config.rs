// Gains, timing, safety limits and pin mapping for the balance loop
//
// Defaults match the tuned values the buggy shipped with. Everything is fixed at
// startup: load a JSON file, apply CLI overrides, then validate once.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::bridge::MAX_PWM_CHANNEL;

// PID gains
pub const DEFAULT_KP: f64 = 0.5;
pub const DEFAULT_KI: f64 = 0.0;
pub const DEFAULT_KD: f64 = 0.1;

// Integral clamp in degree-seconds
pub const DEFAULT_INTEGRAL_LIMIT: f64 = 10.0;

// Complementary filter gyro weight
pub const DEFAULT_ALPHA: f64 = 0.98;

// 5 ms tick = 200 Hz loop
pub const DEFAULT_DT_MS: u64 = 5;

// Beyond this accelerometer tilt the robot is considered unrecoverable
pub const DEFAULT_TILT_CUTOFF_DEG: f64 = 45.0;

pub const DEFAULT_MOUNT_OFFSET_DEG: f64 = 0.0;

// Duty ceiling, kept below the 16-bit hardware maximum as headroom
pub const DEFAULT_MAX_DUTY: u16 = 60_000;

pub const DEFAULT_PWM_FREQ_HZ: u32 = 1_000;

// MPU-6050 at +-2 g / +-250 deg/s
pub const DEFAULT_CALIBRATION_SAMPLES: usize = 100;
pub const DEFAULT_ACCEL_ONE_G: f64 = 16_384.0;
pub const DEFAULT_ACCEL_LSB_PER_G: f64 = 16_384.0;
pub const DEFAULT_GYRO_LSB_PER_DPS: f64 = 131.0;

// Sensor reads must time out well inside one tick
pub const DEFAULT_BUS_TIMEOUT_MS: u64 = 2;

// Time to let go of the robot after calibration
pub const DEFAULT_START_DELAY_MS: u64 = 3_000;

// Serial port of the bridge microcontroller
pub const DEFAULT_BRIDGE_PORT: &str = "/dev/ttyACM0";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// How the orientation estimate is seeded before the first tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AngleSeed {
    /// Start at 0 deg and let the filter converge
    #[default]
    Zero,
    /// Start at the first accelerometer tilt reading
    Accelerometer,
}

/// Forward/reverse PWM channels of one H-bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HBridgeChannels {
    pub forward: u8,
    pub reverse: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WheelChannels {
    pub left: HBridgeChannels,
    pub right: HBridgeChannels,
}

impl Default for WheelChannels {
    fn default() -> Self {
        // Motor A on GP0/GP1, motor B on GP14/GP15
        Self {
            left: HBridgeChannels { forward: 0, reverse: 1 },
            right: HBridgeChannels { forward: 14, reverse: 15 },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BalanceConfig {
    #[serde(rename = "Kp", alias = "kp")]
    pub kp: f64,
    #[serde(rename = "Ki", alias = "ki")]
    pub ki: f64,
    #[serde(rename = "Kd", alias = "kd")]
    pub kd: f64,
    pub integral_limit: f64,
    pub alpha: f64,
    pub dt_ms: u64,
    pub tilt_cutoff_deg: f64,
    pub mount_offset_deg: f64,
    pub max_duty: u16,
    pub pwm_freq_hz: u32,
    pub calibration_samples: usize,
    pub accel_one_g: f64,
    pub accel_lsb_per_g: f64,
    pub gyro_lsb_per_dps: f64,
    pub angle_seed: AngleSeed,
    pub bus_timeout_ms: u64,
    pub start_delay_ms: u64,
    pub wheels: WheelChannels,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            kp: DEFAULT_KP,
            ki: DEFAULT_KI,
            kd: DEFAULT_KD,
            integral_limit: DEFAULT_INTEGRAL_LIMIT,
            alpha: DEFAULT_ALPHA,
            dt_ms: DEFAULT_DT_MS,
            tilt_cutoff_deg: DEFAULT_TILT_CUTOFF_DEG,
            mount_offset_deg: DEFAULT_MOUNT_OFFSET_DEG,
            max_duty: DEFAULT_MAX_DUTY,
            pwm_freq_hz: DEFAULT_PWM_FREQ_HZ,
            calibration_samples: DEFAULT_CALIBRATION_SAMPLES,
            accel_one_g: DEFAULT_ACCEL_ONE_G,
            accel_lsb_per_g: DEFAULT_ACCEL_LSB_PER_G,
            gyro_lsb_per_dps: DEFAULT_GYRO_LSB_PER_DPS,
            angle_seed: AngleSeed::Zero,
            bus_timeout_ms: DEFAULT_BUS_TIMEOUT_MS,
            start_delay_ms: DEFAULT_START_DELAY_MS,
            wheels: WheelChannels::default(),
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn finite(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(invalid(field, format!("{} is not a finite number", value)))
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    finite(field, value)?;
    if value > 0.0 {
        Ok(())
    } else {
        Err(invalid(field, format!("{} must be > 0", value)))
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    finite(field, value)?;
    if value >= 0.0 {
        Ok(())
    } else {
        Err(invalid(field, format!("{} must be >= 0", value)))
    }
}

impl BalanceConfig {
    /// Load from a JSON file and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value once; the loop relies on these never changing afterwards
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_negative("Kp", self.kp)?;
        non_negative("Ki", self.ki)?;
        non_negative("Kd", self.kd)?;
        positive("integral_limit", self.integral_limit)?;

        finite("alpha", self.alpha)?;
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(invalid("alpha", format!("{} is outside [0, 1]", self.alpha)));
        }

        if self.dt_ms == 0 {
            return Err(invalid("dt_ms", "tick period must be nonzero"));
        }

        positive("tilt_cutoff_deg", self.tilt_cutoff_deg)?;
        if self.tilt_cutoff_deg > 180.0 {
            return Err(invalid("tilt_cutoff_deg", "must be <= 180"));
        }
        finite("mount_offset_deg", self.mount_offset_deg)?;

        // Upper bound depends on the PWM hardware and is checked by the motor driver
        if self.max_duty == 0 {
            return Err(invalid("max_duty", "must be > 0"));
        }
        if self.pwm_freq_hz == 0 {
            return Err(invalid("pwm_freq_hz", "must be > 0"));
        }

        if self.calibration_samples == 0 {
            return Err(invalid("calibration_samples", "need at least one sample"));
        }
        finite("accel_one_g", self.accel_one_g)?;
        positive("accel_lsb_per_g", self.accel_lsb_per_g)?;
        positive("gyro_lsb_per_dps", self.gyro_lsb_per_dps)?;

        if self.bus_timeout_ms == 0 || self.bus_timeout_ms >= self.dt_ms {
            return Err(invalid(
                "bus_timeout_ms",
                format!("{} must be in [1, dt_ms={})", self.bus_timeout_ms, self.dt_ms),
            ));
        }

        let w = &self.wheels;
        let channels = [w.left.forward, w.left.reverse, w.right.forward, w.right.reverse];
        if let Some(ch) = channels.iter().find(|&&ch| ch > MAX_PWM_CHANNEL) {
            return Err(invalid(
                "wheels",
                format!("channel {} out of range (max {})", ch, MAX_PWM_CHANNEL),
            ));
        }
        for (i, a) in channels.iter().enumerate() {
            if channels[i + 1..].contains(a) {
                return Err(invalid("wheels", format!("channel {} assigned twice", a)));
            }
        }

        Ok(())
    }

    /// Tick period
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.dt_ms)
    }

    /// Tick period in seconds, as used for integration
    pub fn dt_secs(&self) -> f64 {
        self.dt_ms as f64 / 1000.0
    }

    pub fn bus_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_timeout_ms)
    }
}
