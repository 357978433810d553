use super::{LineLink, LinkError};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const TERMINATOR: &str = "\r\n";

const ECHO_OFF: &str = "SYST:COMM:ECHO OFF";
const IDENTIFY: &str = "*IDN?";
const FETCH: &str = ":FETCh?";
const DISPLAY_ON: &str = ":DISP:ENAB 1";

/// Which quantity a meter is set up to measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Voltage,
    Current,
}

impl Quantity {
    pub fn label(self) -> &'static str {
        match self {
            Quantity::Voltage => "voltage",
            Quantity::Current => "current",
        }
    }

    fn function_command(self) -> &'static str {
        match self {
            Quantity::Voltage => ":FUNC VOLT:DC",
            Quantity::Current => ":FUNC CURR:DC",
        }
    }

    fn range_command(self, range: f64) -> String {
        match self {
            Quantity::Voltage => format!(":VOLT:DC:RANG {}", range),
            Quantity::Current => format!(":CURR:DC:RANG {}", range),
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Error, Debug)]
pub enum MeterError {
    #[error("{quantity} meter transport failure: {source}")]
    Transport {
        quantity: Quantity,
        #[source]
        source: LinkError,
    },
}

/// Delays the meters need between commands and replies.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MeterTiming {
    pub response_delay: Duration, // after :FETCh? before the first poll
    pub poll_backoff: Duration,   // between polls that returned nothing
    pub command_settle: Duration, // after each setup command
    pub identify_delay: Duration, // after *IDN? before reading the reply
}

impl Default for MeterTiming {
    fn default() -> Self {
        Self {
            response_delay: Duration::from_millis(200),
            poll_backoff: Duration::from_millis(50),
            command_settle: Duration::from_millis(300),
            identify_delay: Duration::from_millis(500),
        }
    }
}

/// A SCPI bench multimeter measuring one quantity.
///
/// Dropping the meter re-enables its front panel display; the link closes with it.
pub struct Meter<L: LineLink> {
    quantity: Quantity,
    link: L,
    timing: MeterTiming,
}

impl<L: LineLink> Meter<L> {
    pub fn new(quantity: Quantity, link: L, timing: MeterTiming) -> Self {
        info!("Initializing {} meter", quantity);
        Meter {
            quantity,
            link,
            timing,
        }
    }

    pub fn quantity(&self) -> Quantity {
        self.quantity
    }

    fn transport(&self, source: LinkError) -> MeterError {
        MeterError::Transport {
            quantity: self.quantity,
            source,
        }
    }

    pub fn send(&mut self, command: &str) -> Result<(), MeterError> {
        debug!("Sending command to {} meter: {}", self.quantity, command);
        let line = format!("{}{}", command, TERMINATOR);
        self.link
            .write_all(line.as_bytes())
            .map_err(|e| self.transport(e))
    }

    /// Ask for the instrument identity. Any failure just yields `None`.
    pub fn identify(&mut self) -> Option<String> {
        if let Err(e) = self.send(IDENTIFY) {
            warn!("Identity query failed: {}", e);
            return None;
        }
        std::thread::sleep(self.timing.identify_delay);
        match self.link.read_line(self.timing.identify_delay) {
            Ok(Some(id)) if !id.is_empty() => Some(id),
            Ok(_) => None,
            Err(e) => {
                warn!("Failed to read {} meter identity: {}", self.quantity, e);
                None
            }
        }
    }

    /// Disable echo, select the DC function for this quantity and fix the range.
    pub fn configure(&mut self, range: f64) -> Result<(), MeterError> {
        info!("Configuring {} meter, range {}", self.quantity, range);
        let range_command = self.quantity.range_command(range);
        for command in [ECHO_OFF, self.quantity.function_command(), range_command.as_str()] {
            self.send(command)?;
            std::thread::sleep(self.timing.command_settle);
        }
        Ok(())
    }

    /// Fetch one reading, waiting at most `max_wait` for a line that parses as a number.
    ///
    /// Returns `Ok(None)` when the window closes without a usable reply. Unparseable
    /// lines are skipped. Only a failure of the link itself is an error.
    pub fn fetch(&mut self, max_wait: Duration) -> Result<Option<f64>, MeterError> {
        let start = Instant::now();

        self.link.clear_input().map_err(|e| self.transport(e))?;
        self.send(FETCH)?;
        std::thread::sleep(self.timing.response_delay.min(max_wait));

        loop {
            let remaining = max_wait.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                debug!("No {} reading within {:?}", self.quantity, max_wait);
                return Ok(None);
            }

            match self.link.read_line(remaining).map_err(|e| self.transport(e))? {
                Some(line) => match parse_reading(&line) {
                    Some(value) => return Ok(Some(value)),
                    None => {
                        debug!("Discarding malformed {} reply: {:?}", self.quantity, line)
                    }
                },
                None => {
                    let remaining = max_wait.saturating_sub(start.elapsed());
                    std::thread::sleep(self.timing.poll_backoff.min(remaining));
                }
            }
        }
    }

    pub fn restore_display(&mut self) -> Result<(), MeterError> {
        self.send(DISPLAY_ON)
    }
}

impl<L: LineLink> Drop for Meter<L> {
    fn drop(&mut self) {
        match self.restore_display() {
            Ok(()) => info!("{} meter display restored, closing port", self.quantity),
            Err(e) => warn!("Failed to restore {} meter display: {}", self.quantity, e),
        }
    }
}

fn parse_reading(line: &str) -> Option<f64> {
    line.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::mock::ScriptedLink;

    fn quick_timing() -> MeterTiming {
        MeterTiming {
            response_delay: Duration::ZERO,
            poll_backoff: Duration::from_millis(2),
            command_settle: Duration::ZERO,
            identify_delay: Duration::ZERO,
        }
    }

    #[test]
    fn parses_instrument_number_formats() {
        assert_eq!(parse_reading("+5.00123E+00\r"), Some(5.00123));
        assert_eq!(parse_reading(" -0.0100 "), Some(-0.01));
        assert_eq!(parse_reading("1.2.3"), None);
        assert_eq!(parse_reading(""), None);
        assert_eq!(parse_reading("NaN"), None);
        assert_eq!(parse_reading("inf"), None);
    }

    #[test]
    fn fetch_returns_first_numeric_line() {
        let link = ScriptedLink::new().respond(&["garbage", ":FETCh?", "4.98"]);
        let mut meter = Meter::new(Quantity::Voltage, link, quick_timing());

        let value = meter.fetch(Duration::from_millis(200)).unwrap();
        assert_eq!(value, Some(4.98));
    }

    #[test]
    fn fetch_clears_stale_input_before_requesting() {
        let link = ScriptedLink::new().respond(&["0.01"]);
        let log = link.log();
        let input = link.input();
        input.lock().unwrap().push_back("9.99".to_string());
        let mut meter = Meter::new(Quantity::Current, link, quick_timing());

        assert_eq!(meter.fetch(Duration::from_millis(200)).unwrap(), Some(0.01));
        assert!(input.lock().unwrap().is_empty());
        assert_eq!(log.lock().unwrap().first().map(String::as_str), Some(":FETCh?"));
    }

    #[test]
    fn fetch_gives_up_after_window() {
        let link = ScriptedLink::new().respond(&[]);
        let mut meter = Meter::new(Quantity::Voltage, link, quick_timing());

        let start = Instant::now();
        let value = meter.fetch(Duration::from_millis(40)).unwrap();
        let elapsed = start.elapsed();

        assert_eq!(value, None);
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(500), "took {:?}", elapsed);
    }

    #[test]
    fn endless_malformed_lines_do_not_extend_window() {
        let link = ScriptedLink::new().flood_with("#?!");
        let mut meter = Meter::new(Quantity::Current, link, quick_timing());

        let start = Instant::now();
        let value = meter.fetch(Duration::from_millis(40)).unwrap();

        assert_eq!(value, None);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn write_failure_is_a_transport_error() {
        let link = ScriptedLink::new().failing();
        let mut meter = Meter::new(Quantity::Current, link, quick_timing());

        match meter.fetch(Duration::from_millis(40)) {
            Err(MeterError::Transport { quantity, .. }) => {
                assert_eq!(quantity, Quantity::Current)
            }
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[test]
    fn configure_sends_setup_sequence() {
        let link = ScriptedLink::new();
        let log = link.log();
        let mut meter = Meter::new(Quantity::Voltage, link, quick_timing());

        meter.configure(20.0).unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["SYST:COMM:ECHO OFF", ":FUNC VOLT:DC", ":VOLT:DC:RANG 20"]
        );

        let link = ScriptedLink::new();
        let log = link.log();
        let mut meter = Meter::new(Quantity::Current, link, quick_timing());
        meter.configure(0.02).unwrap();
        assert_eq!(log.lock().unwrap()[2], ":CURR:DC:RANG 0.02");
    }

    #[test]
    fn identify_is_best_effort() {
        let link = ScriptedLink::new().identity("KEITHLEY INSTRUMENTS,MODEL 2110");
        let mut meter = Meter::new(Quantity::Voltage, link, quick_timing());
        assert_eq!(
            meter.identify().as_deref(),
            Some("KEITHLEY INSTRUMENTS,MODEL 2110")
        );

        let mut silent = Meter::new(Quantity::Voltage, ScriptedLink::new(), quick_timing());
        assert_eq!(silent.identify(), None);
    }

    #[test]
    fn drop_restores_display() {
        let link = ScriptedLink::new();
        let log = link.log();
        drop(Meter::new(Quantity::Voltage, link, quick_timing()));

        assert_eq!(log.lock().unwrap().last().map(String::as_str), Some(":DISP:ENAB 1"));
    }
}
