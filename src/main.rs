use std::path::PathBuf;
use std::time::Duration;

use balance_buggy::config::{BalanceConfig, DEFAULT_BRIDGE_PORT};
use balance_buggy::diagnostics;
use balance_buggy::runtime::{self, stop_signal, Backend, RunOptions};
use balance_buggy::sim::PendulumParams;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "balance-buggy")]
#[command(about = "Self-balancing two-wheeled robot controller", long_about = None)]
struct Cli {
    /// JSON configuration file (defaults are used when omitted)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Serial port of the microcontroller bridge
    #[arg(long, global = true, default_value = DEFAULT_BRIDGE_PORT)]
    port: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Calibrate, then balance until Ctrl+C
    Run(RunArgs),
    /// Print raw IMU counts (read-only, no movement)
    ImuRead {
        /// Number of readings (0 = until Ctrl+C)
        #[arg(long, default_value_t = 0)]
        count: u64,
        /// Interval between readings, ms
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
    /// Ramp both wheels forward then reverse (wheels off the ground!)
    MotorTest {
        /// Steps from stop to full duty
        #[arg(long, default_value_t = 10)]
        steps: u32,
        /// Time held at each step, ms
        #[arg(long, default_value_t = 200)]
        hold_ms: u64,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Run against the simulated pendulum instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Stop after this many ticks
    #[arg(long)]
    ticks: Option<u64>,

    /// Telemetry log rate in Hz (0 = off)
    #[arg(long, default_value_t = 0)]
    telemetry_hz: u32,

    #[arg(long)]
    kp: Option<f64>,
    #[arg(long)]
    ki: Option<f64>,
    #[arg(long)]
    kd: Option<f64>,
    #[arg(long)]
    alpha: Option<f64>,
    #[arg(long)]
    dt_ms: Option<u64>,
    #[arg(long, allow_hyphen_values = true)]
    tilt_cutoff_deg: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    mount_offset_deg: Option<f64>,
    #[arg(long)]
    max_duty: Option<u16>,
}

impl RunArgs {
    fn apply(&self, config: &mut BalanceConfig) {
        let overrides = [
            (self.kp, &mut config.kp),
            (self.ki, &mut config.ki),
            (self.kd, &mut config.kd),
            (self.alpha, &mut config.alpha),
            (self.tilt_cutoff_deg, &mut config.tilt_cutoff_deg),
            (self.mount_offset_deg, &mut config.mount_offset_deg),
        ];
        for (value, field) in overrides {
            if let Some(v) = value {
                *field = v;
            }
        }
        if let Some(dt) = self.dt_ms {
            config.dt_ms = dt;
        }
        if let Some(duty) = self.max_duty {
            config.max_duty = duty;
        }
    }
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => BalanceConfig::load(path)?,
        None => BalanceConfig::default(),
    };

    match cli.command {
        Command::Run(args) => {
            args.apply(&mut config);
            config.validate()?;

            let backend = if args.simulate {
                Backend::Simulated(PendulumParams::for_config(&config))
            } else {
                Backend::Bridge { port: cli.port }
            };
            let options = RunOptions {
                backend,
                max_ticks: args.ticks,
                telemetry_hz: args.telemetry_hz,
            };
            let summary = runtime::run(config, options).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::ImuRead { count, interval_ms } => {
            config.validate()?;
            let mut imu = diagnostics::open_imu(&cli.port, &config)?;
            let stop = ctrl_c_stop();
            let reads =
                diagnostics::imu_read(&mut imu, count, Duration::from_millis(interval_ms.max(1)), stop)
                    .await?;
            info!("{} readings", reads);
        }
        Command::MotorTest { steps, hold_ms } => {
            config.validate()?;
            let mut motors = diagnostics::open_motors(&cli.port, &config)?;
            let stop = ctrl_c_stop();
            diagnostics::motor_ramp(&mut motors, steps, Duration::from_millis(hold_ms), stop).await?;
        }
    }
    Ok(())
}

fn ctrl_c_stop() -> runtime::StopToken {
    let (handle, stop) = stop_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.stop();
        }
    });
    stop
}
