// Data passed between the stages of one control tick

use serde::{Deserialize, Serialize};

/// Raw register values as returned by the IMU driver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawImuReading {
    pub accel_raw: (i16, i16, i16),
    pub gyro_raw: (i16, i16, i16),
}

impl RawImuReading {
    pub fn new(accel_raw: (i16, i16, i16), gyro_raw: (i16, i16, i16)) -> Self {
        Self { accel_raw, gyro_raw }
    }
}

/// Calibrated IMU sample: accel in g, gyro in deg/s
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImuSample {
    pub accel: (f64, f64, f64),
    pub gyro: (f64, f64, f64),
    pub timestamp_ms: u64,
}

/// Normalized per-wheel drive command in [-1, 1]
// Has default values so "stop" is just MotorCommand::default()
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MotorCommand {
    pub left: f64,
    pub right: f64,
}

impl MotorCommand {
    pub fn new(left: f64, right: f64) -> Self {
        Self { left, right }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    /// Same speed on both wheels
    pub fn both(speed: f64) -> Self {
        Self::new(speed, speed)
    }
}

/// Scheduler lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Uninitialized,
    Calibrating,
    Running,
    ShuttingDown,
    Stopped,
}

/// Snapshot of the last completed tick, published for read-only telemetry
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TickTelemetry {
    pub tick: u64,
    pub timestamp_ms: u64,
    pub angle: f64,
    pub acc_angle: f64,
    pub error: f64,
    pub output: f64,
    pub command: MotorCommand,
    pub tilt_cutoff: bool,
}

/// Diagnostics reported when the loop stops
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RunSummary {
    pub run_time_ms: u64,
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub overruns: u64,
    pub avg_tick_latency_us: f64,
    pub final_state: LoopState,
}

impl RunSummary {
    /// Wall time per iteration
    pub fn ms_per_tick(&self) -> f64 {
        if self.ticks == 0 {
            0.0
        } else {
            self.run_time_ms as f64 / self.ticks as f64
        }
    }
}
