use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Local;
use thiserror::Error;
use tracing::info;

use crate::sequencer::Measurement;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("no run in progress")]
    NoRun,
}

/// Receives measurements as they are produced. Rows are flushed per point so
/// a crashed or stopped run keeps everything recorded up to that moment.
pub trait MeasurementSink: Send {
    fn begin_run(&mut self, run_id: u64) -> Result<(), SinkError>;
    fn append(&mut self, measurement: &Measurement) -> Result<(), SinkError>;
}

pub type SharedSink = Arc<Mutex<dyn MeasurementSink>>;

const RUN_COUNTER_FILE: &str = ".run_counter";

/// CSV files named `test_run_<nnn>_<yymmdd_hhmmss>_temp.csv` inside the
/// export directory, with a hidden counter file carrying the run number
/// across restarts.
pub struct CsvSink {
    dir: PathBuf,
    writer: Option<csv::Writer<fs::File>>,
}

impl CsvSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), writer: None }
    }

    fn next_run_number(dir: &Path) -> Result<u32, SinkError> {
        let counter_path = dir.join(RUN_COUNTER_FILE);
        let number = match fs::read_to_string(&counter_path) {
            Ok(text) => text.trim().parse::<u32>().unwrap_or(0) + 1,
            Err(_) => 1,
        };
        fs::write(&counter_path, number.to_string())?;
        Ok(number)
    }
}

impl MeasurementSink for CsvSink {
    fn begin_run(&mut self, run_id: u64) -> Result<(), SinkError> {
        fs::create_dir_all(&self.dir)?;
        let number = Self::next_run_number(&self.dir)?;
        let stamp = Local::now().format("%y%m%d_%H%M%S");
        let path = self.dir.join(format!("test_run_{:03}_{}_temp.csv", number, stamp));

        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(["timestamp", "target_angle", "measured_angle", "temperature"])?;
        writer.flush()?;

        info!("run {} recording to {}", run_id, path.display());
        self.writer = Some(writer);
        Ok(())
    }

    fn append(&mut self, measurement: &Measurement) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::NoRun)?;
        writer.write_record([
            measurement.timestamp.format("%y%m%d_%H%M%S").to_string(),
            format!("{:.2}", measurement.target_deg),
            format!("{:.2}", measurement.measured_deg),
            format!("{:.2}", measurement.temperature_c),
        ])?;
        writer.flush()?;
        Ok(())
    }
}

/// Keeps rows in memory; the test double for sink assertions.
#[cfg(test)]
#[derive(Default)]
pub struct MemorySink {
    pub rows: Vec<Measurement>,
    pub runs_started: u32,
}

#[cfg(test)]
impl MeasurementSink for MemorySink {
    fn begin_run(&mut self, _run_id: u64) -> Result<(), SinkError> {
        self.runs_started += 1;
        Ok(())
    }

    fn append(&mut self, measurement: &Measurement) -> Result<(), SinkError> {
        self.rows.push(measurement.clone());
        Ok(())
    }
}
