//! Observer interfaces for the engine and the temperature monitor.
//!
//! The engine never knows how updates reach an operator. It calls a [`ProgressSink`] with
//! display strings and hands the run's temperature history to a [`GraphSink`]. Any marshaling
//! onto another thread or event loop belongs to the sink.

use crate::error::HelixResult;
use crate::protocol::state::TemperatureHistory;
use chrono::Local;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Four display callbacks. Each callback's calls arrive in issue order; there is no ordering
/// across callbacks.
pub trait ProgressSink: Send + Sync {
    /// Stage/cycle/step position, e.g. `"Stage 2\tCycle 5\tStep 1"`.
    fn step_progress(&self, text: &str);
    /// Current lid temperature, e.g. `"104.9 °C"`.
    fn lid_temperature(&self, text: &str);
    /// Current plate temperature.
    fn plate_temperature(&self, text: &str);
    /// Device-reported remaining hold time, e.g. `"12.0 secs"`.
    fn time_remaining(&self, text: &str);
}

/// Receives the accumulated history when a plan reaches `EndAndGraph`.
pub trait GraphSink: Send + Sync {
    fn emit(&self, title: &str, history: TemperatureHistory) -> HelixResult<()>;
}

/// Logs every update through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn step_progress(&self, text: &str) {
        info!(target: "helix::progress", "{}", text.replace('\t', "  "));
    }

    fn lid_temperature(&self, text: &str) {
        debug!(target: "helix::progress", lid = text);
    }

    fn plate_temperature(&self, text: &str) {
        debug!(target: "helix::progress", plate = text);
    }

    fn time_remaining(&self, text: &str) {
        debug!(target: "helix::progress", remaining = text);
    }
}

/// A single progress update as posted on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum ProgressUpdate {
    Step(String),
    Lid(String),
    Plate(String),
    TimeRemaining(String),
}

/// Posts updates on an unbounded tokio channel for an async observer.
///
/// Sending never blocks the engine; updates are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ChannelProgressSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn post(&self, update: ProgressUpdate) {
        let _ = self.tx.send(update);
    }
}

impl ProgressSink for ChannelProgressSink {
    fn step_progress(&self, text: &str) {
        self.post(ProgressUpdate::Step(text.to_string()));
    }

    fn lid_temperature(&self, text: &str) {
        self.post(ProgressUpdate::Lid(text.to_string()));
    }

    fn plate_temperature(&self, text: &str) {
        self.post(ProgressUpdate::Plate(text.to_string()));
    }

    fn time_remaining(&self, text: &str) {
        self.post(ProgressUpdate::TimeRemaining(text.to_string()));
    }
}

/// Discards the history.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullGraphSink;

impl GraphSink for NullGraphSink {
    fn emit(&self, title: &str, history: TemperatureHistory) -> HelixResult<()> {
        debug!(title, samples = history.len(), "Discarding temperature history");
        Ok(())
    }
}

/// Writes the history as CSV to `<dir>/<title>-<YYYYmmdd_HHMMSS>.csv`.
///
/// An existing file is never overwritten: a `-1`, `-2`, ... suffix is added to the stem instead.
/// Columns: `minutes,lid_c,plate_c,hold_s`.
#[derive(Debug, Clone)]
pub struct CsvGraphSink {
    dir: PathBuf,
}

impl CsvGraphSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_stem(title: &str) -> String {
        let title: String = title
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let title = if title.is_empty() { "run".to_string() } else { title };
        format!("{}-{}", title, Local::now().format("%Y%m%d_%H%M%S"))
    }

    /// Create a new history file, picking the first free name for `stem`.
    fn create_unique(&self, stem: &str) -> HelixResult<(PathBuf, File)> {
        let mut suffix = 0u32;
        loop {
            let name = match suffix {
                0 => format!("{}.csv", stem),
                n => format!("{}-{}.csv", stem, n),
            };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl GraphSink for CsvGraphSink {
    fn emit(&self, title: &str, history: TemperatureHistory) -> HelixResult<()> {
        fs::create_dir_all(&self.dir)?;
        let (path, file) = self.create_unique(&Self::file_stem(title))?;

        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(["minutes", "lid_c", "plate_c", "hold_s"])?;
        for sample in history.samples() {
            writer.write_record([
                format!("{:.4}", sample.elapsed_minutes),
                sample.lid_celsius.to_string(),
                sample.plate_celsius.to_string(),
                sample.hold_seconds.to_string(),
            ])?;
        }
        writer.flush()?;

        info!(path = %path.display(), samples = history.len(), "Temperature history written");
        Ok(())
    }
}
