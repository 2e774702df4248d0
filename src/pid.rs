// PID controller for the balance loop.
//
// Output is always clamped to [-1, 1]. The integral is clamped to
// `[-integral_limit, integral_limit]` so a robot held off-balance does not
// wind it up without bound.

use serde::Serialize;

use crate::config::BalanceConfig;

/// Controller memory, owned by the scheduler and reset at loop start
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ControllerState {
    pub integral: f64,
    pub prev_error: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct Pid {
    gains: PidGains,
    integral_limit: f64,
}

impl Pid {
    pub const OUTPUT_MIN: f64 = -1.0;
    pub const OUTPUT_MAX: f64 = 1.0;

    pub fn new(gains: PidGains, integral_limit: f64) -> Self {
        Self {
            gains,
            integral_limit: integral_limit.abs(),
        }
    }

    pub fn from_config(config: &BalanceConfig) -> Self {
        Self::new(
            PidGains {
                kp: config.kp,
                ki: config.ki,
                kd: config.kd,
            },
            config.integral_limit,
        )
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    pub fn reset(state: &mut ControllerState) {
        *state = ControllerState::default();
    }

    /// One controller step for `error = target - measurement`
    pub fn update(&self, state: &mut ControllerState, error: f64, dt: f64) -> f64 {
        state.integral = (state.integral + error * dt).clamp(-self.integral_limit, self.integral_limit);

        // dt == 0 contributes no derivative term
        let derivative = if dt > 0.0 {
            (error - state.prev_error) / dt
        } else {
            0.0
        };
        state.prev_error = error;

        let output =
            self.gains.kp * error + self.gains.ki * state.integral + self.gains.kd * derivative;
        output.clamp(Self::OUTPUT_MIN, Self::OUTPUT_MAX)
    }
}
