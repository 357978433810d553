pub mod data;
pub mod fallback;
pub mod integrator;

use crate::devices::meter::MeterTiming;
use crate::devices::{LineLink, LinkError, Meter, MeterError, Quantity, SerialLink};
use chrono::{Local, NaiveDateTime, SubsecRound, TimeDelta};
use data::{CsvSink, Sample, Sink, SinkError};
use fallback::FallbackWarning;
use integrator::IntegratorState;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Configuration for a logging run
#[derive(Debug, Clone, Serialize)]
pub struct LoggerConfig {
    pub voltage_port: String,     // serial port of the meter in DC voltage mode
    pub current_port: String,     // serial port of the meter in DC current mode
    pub baud_rate: u32,
    pub read_timeout: Duration,   // ceiling for one fetch, per meter
    pub interval: Duration,       // sampling period, also the integration step
    pub output: PathBuf,          // CSV file samples are appended to
    pub voltage_range: f64,       // manual range in V
    pub current_range: f64,       // manual range in A
    pub connect_settle: Duration, // wait after opening the ports
    pub meter_timing: MeterTiming,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            voltage_port: "/dev/ttyUSB0".to_string(),
            current_port: "/dev/ttyUSB1".to_string(),
            baud_rate: 9600,
            read_timeout: Duration::from_secs(1),
            interval: Duration::from_secs(1),
            output: PathBuf::from("voltage_current_capacity_log.csv"),
            voltage_range: 20.0,
            current_range: 0.02,
            connect_settle: Duration::from_secs(2),
            meter_timing: MeterTiming::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Failed to open {quantity} meter on {port}: {source}")]
    Open {
        quantity: Quantity,
        port: String,
        #[source]
        source: LinkError,
    },

    #[error(transparent)]
    Meter(#[from] MeterError),

    #[error("Failed to persist sample: {0}")]
    Sink(#[from] SinkError),
}

/// What a finished run leaves behind.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub cycles: u64,
    pub totals: IntegratorState,
}

/// Microsecond timestamps read off the monotonic clock.
///
/// The wall clock is consulted once, when the run starts; later steps of the system
/// clock (NTP, DST) do not move the stamps. Two stamps inside the same microsecond are
/// pushed apart by 1 µs.
#[derive(Debug)]
struct Timestamper {
    wall_anchor: NaiveDateTime,
    anchor: Instant,
    last: Option<NaiveDateTime>,
}

impl Timestamper {
    fn start() -> Self {
        Self::anchored(Local::now().naive_local(), Instant::now())
    }

    fn anchored(wall_anchor: NaiveDateTime, anchor: Instant) -> Self {
        Timestamper {
            wall_anchor,
            anchor,
            last: None,
        }
    }

    fn stamp(&mut self, at: Instant) -> NaiveDateTime {
        let elapsed = TimeDelta::from_std(at.saturating_duration_since(self.anchor))
            .unwrap_or(TimeDelta::zero());
        let now = (self.wall_anchor + elapsed).trunc_subsecs(6);
        let stamp = match self.last {
            Some(last) if now <= last => last + TimeDelta::microseconds(1),
            _ => now,
        };
        self.last = Some(stamp);
        stamp
    }
}

/// Sleep needed after a cycle that took `elapsed` to hold the sampling period.
fn pace(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

/// Drives both meters at a fixed cadence and keeps the running totals.
///
/// The meters are owned here, so every way out of a run (stop request, transport
/// failure, sink failure) drops them and restores their displays.
pub struct Logger<L: LineLink, S: Sink> {
    voltage: Meter<L>,
    current: Meter<L>,
    sink: S,
    read_timeout: Duration,
    interval: Duration,
    last_voltage: Option<f64>,
    last_current: Option<f64>,
    totals: IntegratorState,
    clock: Timestamper,
}

impl<L: LineLink, S: Sink> Logger<L, S> {
    /// Settle, identify and configure freshly opened meters.
    ///
    /// Identity and setup problems are logged and otherwise ignored; a meter that is
    /// really gone will fail on its first fetch.
    pub fn connect(
        mut voltage: Meter<L>,
        mut current: Meter<L>,
        sink: S,
        config: &LoggerConfig,
    ) -> Self {
        std::thread::sleep(config.connect_settle);

        for meter in [&mut voltage, &mut current] {
            match meter.identify() {
                Some(id) => {
                    info!("{} meter identified: {}", meter.quantity(), id);
                    println!("{} meter ID: {}", meter.quantity(), id);
                }
                None => warn!("{} meter did not identify itself", meter.quantity()),
            }
        }

        for (meter, range) in [
            (&mut voltage, config.voltage_range),
            (&mut current, config.current_range),
        ] {
            if let Err(e) = meter.configure(range) {
                warn!("Setup of {} meter incomplete: {}", meter.quantity(), e);
            }
        }

        Logger {
            voltage,
            current,
            sink,
            read_timeout: config.read_timeout,
            interval: config.interval,
            last_voltage: None,
            last_current: None,
            totals: IntegratorState::default(),
            clock: Timestamper::start(),
        }
    }

    pub fn totals(&self) -> IntegratorState {
        self.totals
    }

    /// Read both meters once, integrate, print and persist the sample.
    ///
    /// A transport failure returns before anything is persisted.
    pub fn run_cycle(&mut self) -> Result<Sample, LoggerError> {
        let voltage_reading = self.voltage.fetch(self.read_timeout)?;
        let current_reading = self.current.fetch(self.read_timeout)?;

        let voltage =
            apply_fallback(Quantity::Voltage, voltage_reading, &mut self.last_voltage);
        let current =
            apply_fallback(Quantity::Current, current_reading, &mut self.last_current);

        let (power, totals) = integrator::integrate(
            voltage,
            current,
            self.interval.as_secs_f64(),
            self.totals,
        );
        self.totals = totals;

        let timestamp = self.clock.stamp(Instant::now());
        let sample = Sample {
            timestamp: timestamp.format(TIMESTAMP_FORMAT).to_string(),
            voltage,
            current,
            power,
            energy_wh: totals.energy_wh,
            capacity_mah: totals.capacity_mah,
        };

        println!("{}", sample.console_line());
        self.sink.append(&sample)?;
        Ok(sample)
    }

    /// Run cycles until `stop` is observed between two cycles.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<u64, LoggerError> {
        let mut cycles = 0;
        while !stop.load(Ordering::SeqCst) {
            let cycle_start = Instant::now();
            self.run_cycle()?;
            cycles += 1;

            let elapsed = cycle_start.elapsed();
            let pause = pace(self.interval, elapsed);
            if pause.is_zero() {
                debug!(
                    "Cycle took {:?}, longer than the {:?} interval",
                    elapsed, self.interval
                );
            }
            std::thread::sleep(pause);
        }
        info!("Stop requested after {} cycles", cycles);
        Ok(cycles)
    }
}

fn apply_fallback(
    quantity: Quantity,
    reading: Option<f64>,
    last_good: &mut Option<f64>,
) -> f64 {
    let resolved = fallback::resolve(reading, *last_good);
    *last_good = resolved.last_good;

    match resolved.warning {
        Some(FallbackWarning::StaleSubstituted) => {
            warn!("No valid {} reading, reusing {}", quantity, resolved.value);
            println!("Warning: no new valid {} reading; using last valid value.", quantity);
        }
        Some(FallbackWarning::NoData) => {
            warn!("No {} reading available", quantity);
            println!("Warning: no {} reading available.", quantity);
        }
        None => {}
    }
    resolved.value
}

fn open_meter(
    quantity: Quantity,
    port: &str,
    config: &LoggerConfig,
) -> Result<Meter<SerialLink>, LoggerError> {
    let link = SerialLink::open(port, config.baud_rate, config.read_timeout).map_err(|source| {
        LoggerError::Open {
            quantity,
            port: port.to_string(),
            source,
        }
    })?;
    Ok(Meter::new(quantity, link, config.meter_timing))
}

/// Open both meters, log until `stop` is set or something fails, then release the meters.
pub fn run_logging(config: LoggerConfig, stop: &AtomicBool) -> Result<RunSummary, LoggerError> {
    match serde_json::to_string(&config) {
        Ok(json) => info!("Starting logging with configuration: {}", json),
        Err(_) => info!("Starting logging with configuration: {:?}", config),
    }

    let voltage = open_meter(Quantity::Voltage, &config.voltage_port, &config)?;
    let current = open_meter(Quantity::Current, &config.current_port, &config)?;
    println!(
        "Connected to {} (Voltage) and {} (Current)",
        config.voltage_port, config.current_port
    );

    let sink = CsvSink::new(&config.output);
    let output =
        std::path::absolute(sink.path()).unwrap_or_else(|_| sink.path().to_path_buf());
    println!("CSV logging will be stored at: {}", output.display());

    let mut logger = Logger::connect(voltage, current, sink, &config);

    println!("Logging voltage, current, power (W), energy (Wh) and capacity (mAh).");
    println!("Press Ctrl+C to stop.");

    let outcome = logger.run(stop);
    let totals = logger.totals();
    drop(logger);
    println!("Serial ports closed.");

    match outcome {
        Ok(cycles) => {
            info!(
                "Logging finished: {} samples, {:.6} Wh, {:.2} mAh",
                cycles, totals.energy_wh, totals.capacity_mah
            );
            Ok(RunSummary { cycles, totals })
        }
        Err(e) => {
            error!("Logging aborted: {}", e);
            Err(e)
        }
    }
}
