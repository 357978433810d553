use serde::Serialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// One logged cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    #[serde(rename = "Timestamp")]
    pub timestamp: String, // local time, microsecond resolution
    #[serde(rename = "Voltage (V)")]
    pub voltage: f64,
    #[serde(rename = "Current (A)")]
    pub current: f64,
    #[serde(rename = "Power (W)")]
    pub power: f64,
    #[serde(rename = "Energy (Wh)")]
    pub energy_wh: f64,
    #[serde(rename = "Capacity (mAh)")]
    pub capacity_mah: f64,
}

impl Sample {
    pub fn console_line(&self) -> String {
        format!(
            "{} - Voltage: {:.6} V, Current: {:.6} A, Power: {:.6} W, \
             Energy: {:.6} Wh, Capacity: {:.2} mAh",
            self.timestamp,
            self.voltage,
            self.current,
            self.power,
            self.energy_wh,
            self.capacity_mah
        )
    }
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Durable, append-only destination for samples.
pub trait Sink {
    fn append(&mut self, sample: &Sample) -> Result<(), SinkError>;
}

/// Appends samples to a CSV file, writing the header only when the file is new or empty.
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        info!("Samples will be appended to {}", path.display());
        CsvSink { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> SinkError {
        SinkError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl Sink for CsvSink {
    fn append(&mut self, sample: &Sample) -> Result<(), SinkError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        let is_empty = file.metadata().map_err(|e| self.io_error(e))?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(is_empty)
            .from_writer(file);
        writer.serialize(sample)?;
        writer.flush().map_err(|e| self.io_error(e))?;
        Ok(())
    }
}
