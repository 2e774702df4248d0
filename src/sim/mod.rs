// Hardware stand-ins.
//
// `mock` has scripted and recording fakes (test builds only); `pendulum` is a
// closed-loop rig for running the controller without a robot attached.

#[cfg(test)]
pub mod mock;
pub mod pendulum;

pub use pendulum::{PendulumParams, PendulumRig, SimImu, SimPwm};
