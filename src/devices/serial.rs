use super::{LineLink, LinkError};
use serialport::{ClearBuffer, SerialPort};
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A multimeter attached to a serial port, read one line at a time.
pub struct SerialLink {
    port: Box<dyn SerialPort>,
    path: String,
    pending: Vec<u8>,
}

impl SerialLink {
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self, LinkError> {
        info!("Opening serial port {} at {} baud", path, baud_rate);
        let port = serialport::new(path, baud_rate).timeout(timeout).open()?;
        Ok(Self::from_port(port, path))
    }

    pub fn from_port(port: Box<dyn SerialPort>, path: &str) -> Self {
        SerialLink {
            port,
            path: path.to_string(),
            pending: Vec::new(),
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }
}

impl LineLink for SerialLink {
    fn clear_input(&mut self) -> Result<(), LinkError> {
        self.pending.clear();
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, LinkError> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0_u8; 256];

        loop {
            if let Some(line) = self.take_line() {
                debug!("Received line from {}: {}", self.path, line);
                return Ok(Some(line));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            self.port.set_timeout(remaining)?;

            match self.port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        // Unterminated bytes stay pending until the rest of the line arrives or
        // clear_input drops them; they are never a reading on their own.
        if !self.pending.is_empty() {
            debug!(
                "{} bytes of an unfinished line pending on {}",
                self.pending.len(),
                self.path
            );
        }
        Ok(None)
    }
}
