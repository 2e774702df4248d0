// Fixed-period balance loop
//
// Uninitialized -> Calibrating -> Running -> ShuttingDown -> Stopped
//
// Each tick runs sample -> estimate -> control -> actuate, strictly in that
// order. The stop signal is only checked between ticks, and every exit path
// goes through shutdown(), which zeroes the motors before anything is logged.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bridge::{BusError, SerialBridge};
use crate::clock::{Clock, TokioClock};
use crate::config::{AngleSeed, BalanceConfig, ConfigError};
use crate::estimator::{ComplementaryFilter, OrientationState};
use crate::imu::{CalibrationError, ImuDriver, ImuSampler, Mpu6050, SensorError};
use crate::messages::{LoopState, MotorCommand, RunSummary, TickTelemetry};
use crate::motor::{ActuationError, MotorDriver, PwmOutput};
use crate::pid::{ControllerState, Pid};
use crate::sim::{PendulumParams, PendulumRig};

// Upright
const TARGET_ANGLE: f64 = 0.0;

#[derive(Debug, thiserror::Error)]
pub enum BalanceError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Calibration failed: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("Sensor failure: {0}")]
    Sensor(#[from] SensorError),

    #[error("Actuation failure: {0}")]
    Actuation(#[from] ActuationError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Sets the stop signal; cheap to clone into signal handlers
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

/// Observed by the loop at every tick boundary
#[derive(Debug, Clone)]
pub struct StopToken {
    rx: watch::Receiver<bool>,
}

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once stop has been requested
    pub async fn stopped(&mut self) {
        if self.rx.wait_for(|&stopped| stopped).await.is_err() {
            // Every handle dropped: nobody can stop us any more
            std::future::pending::<()>().await;
        }
    }
}

pub fn stop_signal() -> (StopHandle, StopToken) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx: Arc::new(tx) }, StopToken { rx })
}

#[derive(Debug, Default)]
struct TickStats {
    started_ms: u64,
    ticks: u64,
    skipped: u64,
    overruns: u64,
    total_latency: Duration,
}

impl TickStats {
    fn record(&mut self, latency: Duration, period: Duration) {
        self.ticks += 1;
        self.total_latency += latency;
        if latency > period {
            self.overruns += 1;
        }
    }

    fn avg_latency_us(&self) -> f64 {
        if self.ticks == 0 {
            0.0
        } else {
            self.total_latency.as_secs_f64() * 1e6 / self.ticks as f64
        }
    }
}

/// The balance controller and everything it owns
pub struct BalanceLoop<D: ImuDriver, P: PwmOutput, C: Clock> {
    config: BalanceConfig,
    sampler: ImuSampler<D>,
    filter: ComplementaryFilter,
    pid: Pid,
    motors: MotorDriver<P>,
    clock: C,
    state: LoopState,
    orientation: OrientationState,
    controller: ControllerState,
    tilted: bool,
    stats: TickStats,
    telemetry: watch::Sender<Option<TickTelemetry>>,
}

impl<D: ImuDriver, P: PwmOutput, C: Clock> BalanceLoop<D, P, C> {
    pub fn new(config: BalanceConfig, imu: D, pwm: P, clock: C) -> Result<Self, BalanceError> {
        config.validate()?;
        let motors = MotorDriver::new(pwm, &config)?;
        let (telemetry, _) = watch::channel(None);

        Ok(Self {
            sampler: ImuSampler::new(imu, &config),
            filter: ComplementaryFilter::from_config(&config),
            pid: Pid::from_config(&config),
            motors,
            clock,
            state: LoopState::Uninitialized,
            orientation: OrientationState::default(),
            controller: ControllerState::default(),
            tilted: false,
            stats: TickStats::default(),
            telemetry,
            config,
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn config(&self) -> &BalanceConfig {
        &self.config
    }

    /// Read-only view of the last tick; publishing never blocks the loop
    pub fn subscribe(&self) -> watch::Receiver<Option<TickTelemetry>> {
        self.telemetry.subscribe()
    }

    /// Zero the motors, wake the IMU and take the stationary baseline
    ///
    /// On failure the motors are zeroed and the loop ends up Stopped.
    pub fn calibrate(&mut self) -> Result<(), BalanceError> {
        self.state = LoopState::Calibrating;

        let result = self.motors.initialize().map_err(BalanceError::from).and_then(|()| {
            self.sampler
                .driver_mut()
                .initialize()
                .map_err(CalibrationError::DeviceInit)?;
            self.sampler.calibrate(self.config.calibration_samples)?;
            Ok(())
        });

        match result {
            Ok(()) => {
                self.state = LoopState::Running;
                Ok(())
            }
            Err(e) => {
                self.state = LoopState::ShuttingDown;
                if let Err(stop_err) = self.motors.stop() {
                    error!("Failed to zero motors after calibration failure: {}", stop_err);
                }
                error!("Calibration failed, not entering closed-loop control: {}", e);
                self.state = LoopState::Stopped;
                Err(e)
            }
        }
    }

    /// Reset filter and controller memory for a fresh run
    fn reset(&mut self) {
        self.orientation = OrientationState::default();
        Pid::reset(&mut self.controller);
        self.tilted = false;
        self.stats = TickStats {
            started_ms: self.clock.now_ms(),
            ..Default::default()
        };
    }

    /// One control tick of `dt` seconds: sample, estimate, control, actuate
    pub fn tick(&mut self, dt: f64) -> Result<TickTelemetry, BalanceError> {
        let now = self.clock.now_ms();
        let sample = self.sampler.sample(now)?;

        if self.stats.ticks == 0 && self.config.angle_seed == AngleSeed::Accelerometer {
            self.orientation = self.filter.seed(AngleSeed::Accelerometer, &sample);
        }
        let estimate = self.filter.update(&mut self.orientation, &sample, dt);

        let error = TARGET_ANGLE - estimate.angle;
        let output = self.pid.update(&mut self.controller, error, dt);

        let tilt_cutoff = estimate.acc_angle.abs() >= self.config.tilt_cutoff_deg;
        let command = if tilt_cutoff {
            if !self.tilted {
                warn!("Too tilted ({:.1} deg), motors off", estimate.acc_angle);
            }
            MotorCommand::zero()
        } else {
            if self.tilted {
                info!("Back within {:.0} deg, resuming control", self.config.tilt_cutoff_deg);
            }
            // Positive pitch error needs a correction in the opposite direction
            MotorCommand::both(-output)
        };
        self.tilted = tilt_cutoff;

        self.motors.drive(command)?;

        let telemetry = TickTelemetry {
            tick: self.stats.ticks,
            timestamp_ms: now,
            angle: estimate.angle,
            acc_angle: estimate.acc_angle,
            error,
            output,
            command,
            tilt_cutoff,
        };
        debug!("{:?}", telemetry);
        self.telemetry.send_replace(Some(telemetry));
        Ok(telemetry)
    }

    /// Calibrate if needed, run until stopped (or `max_ticks`), then shut down
    pub async fn run(
        &mut self,
        mut stop: StopToken,
        max_ticks: Option<u64>,
    ) -> Result<RunSummary, BalanceError> {
        if self.state != LoopState::Running {
            self.calibrate()?;
        }

        self.reset();
        let result = self.run_ticks(&mut stop, max_ticks).await;
        self.shutdown(result)
    }

    async fn run_ticks(&mut self, stop: &mut StopToken, max_ticks: Option<u64>) -> Result<(), BalanceError> {
        if self.config.start_delay_ms > 0 {
            info!("Starting balance loop in {} ms...", self.config.start_delay_ms);
            tokio::select! {
                _ = stop.stopped() => return Ok(()),
                _ = sleep(Duration::from_millis(self.config.start_delay_ms)) => {}
            }
        }
        info!(
            "Balance loop running: {} ms period, Kp={} Ki={} Kd={}, cutoff {} deg",
            self.config.dt_ms, self.config.kp, self.config.ki, self.config.kd, self.config.tilt_cutoff_deg
        );

        let period = self.config.period();
        let mut ticker = interval(period);
        // A slow tick is late, not made up
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.stats.started_ms = self.clock.now_ms();
        let mut last_start: Option<u64> = None;

        loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => {
                    info!("Stop requested");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            // Woken early by the injected clock: wait out the rest of the period
            if let Some(previous) = last_start {
                loop {
                    let elapsed = self.clock.elapsed_ms(previous);
                    if elapsed >= self.config.dt_ms {
                        break;
                    }
                    self.stats.skipped += 1;
                    tokio::select! {
                        biased;
                        _ = stop.stopped() => {
                            info!("Stop requested");
                            return Ok(());
                        }
                        _ = sleep(Duration::from_millis(self.config.dt_ms - elapsed)) => {}
                    }
                    ticker.reset();
                }
            }

            let start = self.clock.now_ms();
            let dt_ms = last_start.map_or(self.config.dt_ms, |previous| self.clock.elapsed_ms(previous));
            last_start = Some(start);

            let started = Instant::now();
            self.tick(dt_ms as f64 / 1000.0)?;
            self.stats.record(started.elapsed(), period);

            if max_ticks.is_some_and(|n| self.stats.ticks >= n) {
                info!("Tick limit reached");
                return Ok(());
            }
        }
    }

    /// Zero the motors first, then report
    fn shutdown(&mut self, result: Result<(), BalanceError>) -> Result<RunSummary, BalanceError> {
        self.state = LoopState::ShuttingDown;
        let stopped = self.motors.stop();

        if let Err(e) = &result {
            error!("Control loop aborted: {}", e);
        }
        if let Err(e) = &stopped {
            error!("Failed to zero motors during shutdown: {}", e);
        }

        self.state = LoopState::Stopped;
        let summary = self.summary();
        info!("Done, motors off.");
        info!(
            "Total run time: {} ms, {} ticks ({:.2} ms per tick), avg tick latency {:.1} us, {} skipped, {} overruns",
            summary.run_time_ms,
            summary.ticks,
            summary.ms_per_tick(),
            summary.avg_tick_latency_us,
            summary.skipped_ticks,
            summary.overruns
        );

        result?;
        stopped?;
        Ok(summary)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_time_ms: self.clock.elapsed_ms(self.stats.started_ms),
            ticks: self.stats.ticks,
            skipped_ticks: self.stats.skipped,
            overruns: self.stats.overruns,
            avg_tick_latency_us: self.stats.avg_latency_us(),
            final_state: self.state,
        }
    }
}

/// Where the loop gets its IMU and PWM from
#[derive(Debug, Clone)]
pub enum Backend {
    /// Microcontroller bridge on a serial port
    Bridge { port: String },
    /// Inverted-pendulum simulation
    Simulated(PendulumParams),
}

/// Options for a full run from the command line
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub backend: Backend,
    pub max_ticks: Option<u64>,
    /// Telemetry log rate, 0 disables it
    pub telemetry_hz: u32,
}

/// Build the loop for the chosen backend and run it until Ctrl+C
pub async fn run(config: BalanceConfig, options: RunOptions) -> Result<RunSummary, BalanceError> {
    config.validate()?;

    let (handle, stop) = stop_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            handle.stop();
        }
    });

    match &options.backend {
        Backend::Bridge { port } => {
            info!("Opening serial bridge on {}", port);
            let bridge = SerialBridge::open(port, config.bus_timeout())?;
            let pwm = bridge.try_clone()?;

            // The IMU is woken in calibrate(), after the motors are zeroed
            let balance = BalanceLoop::new(config, Mpu6050::new(bridge), pwm, TokioClock::new())?;
            drive(balance, stop, &options).await
        }
        Backend::Simulated(params) => {
            info!("Running against simulated pendulum rig");
            let rig = PendulumRig::new(*params, &config);
            let balance = BalanceLoop::new(config, rig.imu(), rig.pwm(), TokioClock::new())?;
            let summary = drive(balance, stop, &options).await?;
            info!("Simulated rig final angle: {:.2} deg", rig.angle_deg());
            Ok(summary)
        }
    }
}

async fn drive<D: ImuDriver, P: PwmOutput, C: Clock>(
    mut balance: BalanceLoop<D, P, C>,
    stop: StopToken,
    options: &RunOptions,
) -> Result<RunSummary, BalanceError> {
    if options.telemetry_hz > 0 {
        spawn_telemetry_logger(balance.subscribe(), options.telemetry_hz);
    }
    balance.run(stop, options.max_ticks).await
}

/// Log the latest tick snapshot as JSON at a fixed rate; never touches loop state
fn spawn_telemetry_logger(mut rx: watch::Receiver<Option<TickTelemetry>>, hz: u32) {
    let period = Duration::from_secs_f64(1.0 / f64::from(hz));
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            if rx.has_changed().is_err() {
                break; // loop dropped its sender
            }
            let snapshot = *rx.borrow_and_update();
            if let Some(t) = snapshot {
                match serde_json::to_string(&t) {
                    Ok(json) => info!(target: "telemetry", "{}", json),
                    Err(e) => warn!("Failed to encode telemetry: {}", e),
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::messages::RawImuReading;
    use crate::sim::mock::{raw_tilt, RecordingPwm, RegisterMap, ScriptedImu};

    fn level() -> RawImuReading {
        raw_tilt(0.0, 16384.0)
    }

    fn test_config() -> BalanceConfig {
        BalanceConfig {
            start_delay_ms: 0,
            ..Default::default()
        }
    }

    /// Calibration readings followed by `then`
    fn script(config: &BalanceConfig, then: RawImuReading) -> ScriptedImu {
        let mut readings = vec![level(); config.calibration_samples];
        readings.push(then);
        ScriptedImu::sequence(readings)
    }

    fn balance_loop(
        config: BalanceConfig,
        imu: ScriptedImu,
    ) -> (BalanceLoop<ScriptedImu, RecordingPwm, TokioClock>, RecordingPwm) {
        let pwm = RecordingPwm::new(u16::MAX);
        let balance = BalanceLoop::new(config, imu, pwm.clone(), TokioClock::new()).unwrap();
        (balance, pwm)
    }

    fn all_zero(pwm: &RecordingPwm) -> bool {
        let duties = pwm.duties();
        !duties.is_empty() && duties.values().all(|&d| d == 0)
    }

    #[test]
    fn test_calibration_enters_running() {
        let config = test_config();
        let (mut balance, pwm) = balance_loop(config.clone(), script(&config, level()));
        assert_eq!(balance.state(), LoopState::Uninitialized);

        balance.calibrate().unwrap();
        assert_eq!(balance.state(), LoopState::Running);
        assert!(all_zero(&pwm));
    }

    #[test]
    fn test_tick_before_calibration_is_sensor_error() {
        let config = test_config();
        let (mut balance, _pwm) = balance_loop(config.clone(), script(&config, level()));
        assert!(matches!(
            balance.tick(0.005),
            Err(BalanceError::Sensor(SensorError::NotCalibrated))
        ));
    }

    #[test]
    fn test_tilt_cutoff_forces_zero_command() {
        let config = BalanceConfig {
            alpha: 0.0,
            ..test_config()
        };
        let (mut balance, pwm) = balance_loop(config.clone(), script(&config, raw_tilt(60.0, 16384.0)));
        balance.calibrate().unwrap();

        for _ in 0..5 {
            let t = balance.tick(0.005).unwrap();
            assert!(t.tilt_cutoff);
            assert_ne!(t.output, 0.0);
            assert_eq!(t.command, MotorCommand::zero());
            assert!(all_zero(&pwm));
        }
    }

    #[test]
    fn test_cutoff_is_inclusive_at_threshold() {
        // Level sensor, so acc_angle is exactly the mounting offset
        for (offset, cut) in [(-45.0, true), (45.0, true), (-44.9, false)] {
            let config = BalanceConfig {
                tilt_cutoff_deg: 45.0,
                mount_offset_deg: offset,
                ..test_config()
            };
            let (mut balance, _pwm) = balance_loop(config.clone(), script(&config, level()));
            balance.calibrate().unwrap();

            let t = balance.tick(0.005).unwrap();
            assert_eq!(t.acc_angle, offset);
            assert_eq!(t.tilt_cutoff, cut, "offset {}", offset);
        }
    }

    #[test]
    fn test_command_is_sign_inverted_output() {
        let config = test_config();
        let (mut balance, pwm) = balance_loop(config.clone(), script(&config, raw_tilt(10.0, 16384.0)));
        balance.calibrate().unwrap();

        let t = balance.tick(0.005).unwrap();
        assert!(!t.tilt_cutoff);
        assert!(t.angle > 0.0);
        assert!(t.output < 0.0);
        assert_eq!(t.command, MotorCommand::both(-t.output));

        let wheels = config.wheels;
        assert!(pwm.duty(wheels.left.forward) > 0);
        assert_eq!(pwm.duty(wheels.left.reverse), 0);
        assert_eq!(pwm.duty(wheels.left.forward), pwm.duty(wheels.right.forward));
    }

    #[test]
    fn test_tuned_scenario_drives_full_forward() {
        // alpha = 1 and zero gyro keep the angle at its previous value
        let config = BalanceConfig {
            kp: 0.5,
            ki: 0.0,
            kd: 0.1,
            alpha: 1.0,
            ..test_config()
        };
        let (mut balance, pwm) = balance_loop(config.clone(), script(&config, level()));
        balance.calibrate().unwrap();
        balance.orientation.angle = 10.0;
        balance.controller.prev_error = -8.0;

        let t = balance.tick(0.005).unwrap();
        assert_eq!(t.error, -10.0);
        assert_eq!(t.output, -1.0);
        assert_eq!(t.command, MotorCommand::new(1.0, 1.0));
        assert_eq!(pwm.duty(config.wheels.left.forward), config.max_duty);
        assert_eq!(pwm.duty(config.wheels.right.forward), config.max_duty);
    }

    #[test]
    fn test_accelerometer_seed_starts_at_first_tilt() {
        let config = BalanceConfig {
            angle_seed: AngleSeed::Accelerometer,
            ..test_config()
        };
        let (mut balance, _pwm) = balance_loop(config.clone(), script(&config, raw_tilt(8.0, 16384.0)));
        balance.calibrate().unwrap();

        let t = balance.tick(0.005).unwrap();
        assert!((t.angle - 8.0).abs() < 0.01, "angle = {}", t.angle);
    }

    #[test]
    fn test_calibration_failure_stops_with_motors_zeroed() {
        let config = test_config();
        let (mut balance, pwm) = balance_loop(config, ScriptedImu::failing_after(10));

        let err = balance.calibrate().unwrap_err();
        assert!(matches!(err, BalanceError::Calibration(_)));
        assert_eq!(balance.state(), LoopState::Stopped);
        assert!(all_zero(&pwm));
    }

    #[test]
    fn test_excessive_duty_ceiling_is_configuration_error() {
        let config = test_config();
        let pwm = RecordingPwm::new(20_000);
        let result = BalanceLoop::new(config.clone(), script(&config, level()), pwm, TokioClock::new());
        assert!(matches!(result, Err(BalanceError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_tick_limit_then_stops() {
        let config = test_config();
        let (mut balance, pwm) = balance_loop(config.clone(), script(&config, level()));
        let (_handle, stop) = stop_signal();

        let summary = balance.run(stop, Some(20)).await.unwrap();
        assert_eq!(summary.ticks, 20);
        assert_eq!(summary.final_state, LoopState::Stopped);
        assert_eq!(summary.skipped_ticks, 0);
        // First tick fires immediately, then one per period
        assert_eq!(summary.run_time_ms, 19 * config.dt_ms);
        assert_eq!(balance.state(), LoopState::Stopped);
        assert!(all_zero(&pwm));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_ends_run_with_zero_command() {
        let config = test_config();
        let (mut balance, pwm) = balance_loop(config.clone(), script(&config, raw_tilt(10.0, 16384.0)));
        let (handle, stop) = stop_signal();

        tokio::spawn(async move {
            sleep(Duration::from_millis(52)).await;
            handle.stop();
        });

        let summary = balance.run(stop, None).await.unwrap();
        assert!(summary.ticks >= 10, "ticks = {}", summary.ticks);
        assert!(summary.ticks <= 12, "ticks = {}", summary.ticks);
        assert_eq!(*pwm.writes().last().unwrap(), (config.wheels.right.reverse, 0));
        assert!(all_zero(&pwm));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_start_delay_skips_ticks() {
        let config = BalanceConfig {
            start_delay_ms: 3_000,
            ..test_config()
        };
        let (mut balance, _pwm) = balance_loop(config.clone(), script(&config, level()));
        let (handle, stop) = stop_signal();
        handle.stop();

        let summary = balance.run(stop, None).await.unwrap();
        assert_eq!(summary.ticks, 0);
        assert_eq!(summary.final_state, LoopState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_failure_shuts_down() {
        let config = test_config();
        let imu = script(&config, raw_tilt(10.0, 16384.0))
            .with_failure_after(config.calibration_samples + 5);
        let (mut balance, pwm) = balance_loop(config, imu);
        let (_handle, stop) = stop_signal();

        let err = balance.run(stop, Some(100)).await.unwrap_err();
        assert!(matches!(err, BalanceError::Sensor(SensorError::Bus(_))));
        assert_eq!(balance.state(), LoopState::Stopped);
        assert_eq!(balance.summary().ticks, 5);
        assert!(all_zero(&pwm));
    }

    #[tokio::test(start_paused = true)]
    async fn test_actuation_failure_shuts_down() {
        let config = test_config();
        let (mut balance, pwm) = balance_loop(config.clone(), script(&config, level()));
        balance.calibrate().unwrap();
        pwm.fail_writes(true);
        let (_handle, stop) = stop_signal();

        let err = balance.run(stop, Some(10)).await.unwrap_err();
        assert!(matches!(err, BalanceError::Actuation(_)));
        assert_eq!(balance.state(), LoopState::Stopped);
        assert_eq!(balance.summary().ticks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_ticks_are_skipped() {
        // A clock that never advances makes every tick after the first look early
        let config = test_config();
        let pwm = RecordingPwm::new(u16::MAX);
        let mut balance =
            BalanceLoop::new(config.clone(), script(&config, level()), pwm, ManualClock::new(0)).unwrap();
        let (handle, stop) = stop_signal();

        tokio::spawn(async move {
            sleep(Duration::from_millis(32)).await;
            handle.stop();
        });

        let summary = balance.run(stop, None).await.unwrap();
        assert_eq!(summary.ticks, 1);
        assert!(summary.skipped_ticks >= 5, "skipped = {}", summary.skipped_ticks);
    }

    /// Tokio time, except one instant reads 1 ms late (a delayed wake-up)
    struct LateWakeClock {
        inner: TokioClock,
        late_at_ms: u64,
    }

    impl Clock for LateWakeClock {
        fn now_ms(&self) -> u64 {
            let t = self.inner.now_ms();
            if t == self.late_at_ms { t + 1 } else { t }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_wake_does_not_stretch_next_period() {
        let config = test_config();
        let clock = LateWakeClock {
            inner: TokioClock::new(),
            late_at_ms: 5,
        };
        let pwm = RecordingPwm::new(u16::MAX);
        let mut balance = BalanceLoop::new(config.clone(), script(&config, level()), pwm, clock).unwrap();
        let rx = balance.subscribe();
        let (_handle, stop) = stop_signal();

        // Ticks at 0, 6 (late), 11, 16: the wake-up at 10 waits 1 ms instead of a full period
        let summary = balance.run(stop, Some(4)).await.unwrap();
        assert_eq!(summary.ticks, 4);
        assert_eq!(summary.skipped_ticks, 1);
        assert_eq!(summary.run_time_ms, 16);
        let last = (*rx.borrow()).map(|t| t.timestamp_ms);
        assert_eq!(last, Some(16));
    }

    #[test]
    fn test_imu_wake_failure_stops_with_motors_zeroed() {
        let config = test_config();
        let pwm = RecordingPwm::new(u16::MAX);
        // No device answers on the register bus
        let imu = Mpu6050::new(RegisterMap::new());
        let mut balance = BalanceLoop::new(config, imu, pwm.clone(), TokioClock::new()).unwrap();

        let err = balance.calibrate().unwrap_err();
        assert!(matches!(
            err,
            BalanceError::Calibration(CalibrationError::DeviceInit(BusError::Timeout { .. }))
        ));
        assert_eq!(balance.state(), LoopState::Stopped);
        assert!(all_zero(&pwm));
    }

    #[tokio::test(start_paused = true)]
    async fn test_telemetry_reflects_last_tick() {
        let config = test_config();
        let (mut balance, _pwm) = balance_loop(config.clone(), script(&config, raw_tilt(5.0, 16384.0)));
        let rx = balance.subscribe();
        let (_handle, stop) = stop_signal();

        balance.run(stop, Some(7)).await.unwrap();
        let last = *rx.borrow();
        let last = last.expect("telemetry published");
        assert_eq!(last.tick, 6);
        assert!(!last.tilt_cutoff);
    }

    #[tokio::test(start_paused = true)]
    async fn test_balances_simulated_rig() {
        let config = test_config();
        let rig = PendulumRig::new(PendulumParams::for_config(&config), &config);
        let mut balance =
            BalanceLoop::new(config, rig.imu(), rig.pwm(), TokioClock::new()).unwrap();
        let (_handle, stop) = stop_signal();

        let summary = balance.run(stop, Some(800)).await.unwrap();
        assert_eq!(summary.ticks, 800);
        assert!(!rig.has_fallen());
        assert!(rig.angle_deg().abs() < 1.0, "rig angle = {}", rig.angle_deg());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_on_simulated_backend() {
        let config = test_config();
        let options = RunOptions {
            backend: Backend::Simulated(PendulumParams::for_config(&config)),
            max_ticks: Some(50),
            telemetry_hz: 0,
        };

        let summary = run(config, options).await.unwrap();
        assert_eq!(summary.ticks, 50);
        assert_eq!(summary.final_state, LoopState::Stopped);
    }
}
