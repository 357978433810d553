mod devices;
mod experiment;

use clap::Parser;
use experiment::{LoggerConfig, RunSummary};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{Level, error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::fmt;

/// Log voltage, current, power, energy and capacity from two bench multimeters.
#[derive(Parser, Debug)]
#[command(name = "dmm-power-logger", version)]
struct Cli {
    /// CSV file to append samples to
    #[arg(default_value = "voltage_current_capacity_log.csv")]
    output: PathBuf,

    /// Serial port of the meter measuring DC voltage
    #[arg(long, default_value = "/dev/ttyUSB0")]
    voltage_port: String,

    /// Serial port of the meter measuring DC current
    #[arg(long, default_value = "/dev/ttyUSB1")]
    current_port: String,

    #[arg(long, default_value_t = 9600)]
    baud: u32,

    /// Sampling interval in seconds
    #[arg(long, default_value_t = 1.0)]
    interval: f64,

    /// Longest wait for one meter reply, in seconds
    #[arg(long, default_value_t = 1.0)]
    read_timeout: f64,

    /// Manual voltage range in V
    #[arg(long, default_value_t = 20.0)]
    voltage_range: f64,

    /// Manual current range in A
    #[arg(long, default_value_t = 0.02)]
    current_range: f64,
}

impl Cli {
    fn into_config(self) -> Result<LoggerConfig, String> {
        let interval = Duration::try_from_secs_f64(self.interval)
            .map_err(|e| format!("Invalid interval {}: {}", self.interval, e))?;
        let read_timeout = Duration::try_from_secs_f64(self.read_timeout)
            .map_err(|e| format!("Invalid read timeout {}: {}", self.read_timeout, e))?;
        if interval.is_zero() {
            return Err("Sampling interval must be positive".into());
        }

        Ok(LoggerConfig {
            voltage_port: self.voltage_port,
            current_port: self.current_port,
            baud_rate: self.baud,
            read_timeout,
            interval,
            output: self.output,
            voltage_range: self.voltage_range,
            current_range: self.current_range,
            ..LoggerConfig::default()
        })
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Keep the guard alive so buffered log lines are flushed on exit
    let _guard = setup_logging();
    info!("Starting application");

    // Errors are reported once here; main itself only hands back the exit status
    match run(cli) {
        Ok(summary) => {
            println!("Logging stopped by user.");
            println!(
                "{} samples, {:.6} Wh, {:.2} mAh",
                summary.cycles, summary.totals.energy_wh, summary.totals.capacity_mah
            );
            info!("Application shutting down");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Logging failed: {}", e);
            eprintln!("Logging failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<RunSummary, Box<dyn std::error::Error>> {
    let config = cli.into_config()?;

    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })?;

    Ok(experiment::run_logging(config, &stop)?)
}

fn setup_logging() -> WorkerGuard {
    // Daily-rotated log file next to the working directory
    let file_appender = rolling::daily("logs", "app.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    fmt()
        .with_writer(non_blocking)
        .with_ansi(false) // Disable ANSI colors in log files
        .with_level(true)
        .with_max_level(Level::INFO)
        .init();
    guard
}
