pub mod bridge;
pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod estimator;
pub mod imu;
pub mod messages;
pub mod motor;
pub mod pid;
pub mod runtime;
pub mod sim;

pub use config::BalanceConfig;
pub use runtime::{BalanceError, BalanceLoop};
