pub mod meter;
pub mod serial;

#[cfg(test)]
pub mod mock;

use std::time::Duration;
use thiserror::Error;

pub use meter::{Meter, MeterError, Quantity};
pub use serial::SerialLink;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

/// Byte-oriented duplex connection to one instrument.
///
/// `read_line` must return within `timeout`. `Ok(None)` means nothing arrived in time;
/// only failures of the transport itself are reported as errors.
pub trait LineLink {
    fn clear_input(&mut self) -> Result<(), LinkError>;

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, LinkError>;
}
