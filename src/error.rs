//! Custom error types for the thermocycler controller.
//!
//! `HelixError` is the single error type used across the library. It is built with
//! `thiserror` and groups failures into the classes the protocol engine cares about:
//!
//! - **Transport class** (`Transport`, `Io`, `NotConnected`, `DeviceUnresponsive`): the link to
//!   the device failed or stopped answering. Inside a step's polling loop these skip the
//!   current step; anywhere else they fault the run.
//! - **Plan data** (`PlanData`): a numeric field or the plan shape is wrong. Never retried,
//!   always aborts the run.
//! - **Control flow** (`EmergencyStop`): an operator stop unwinding the engine. Not a failure.
//! - **Setup** (`Connect`, `Config`, `Csv`, `RunInProgress`, `SessionPoisoned`).

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type HelixResult<T> = std::result::Result<T, HelixError>;

#[derive(Error, Debug)]
pub enum HelixError {
    #[error("Failed to open serial port '{port}': {reason}")]
    Connect { port: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port not connected")]
    NotConnected,

    #[error("Device did not answer {query} after {attempts} attempts")]
    DeviceUnresponsive { query: &'static str, attempts: u32 },

    #[error("Protocol data error: {0}")]
    PlanData(String),

    #[error("Emergency stop requested")]
    EmergencyStop,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("A protocol run is already in progress")]
    RunInProgress,

    #[error("Hardware session lock poisoned by a panicked worker")]
    SessionPoisoned,
}

impl HelixError {
    /// True for failures of the link to the device.
    ///
    /// The engine treats these as "skip the current step" inside a polling loop.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            HelixError::Transport(_)
                | HelixError::Io(_)
                | HelixError::NotConnected
                | HelixError::DeviceUnresponsive { .. }
        )
    }

    /// True for malformed plan or numeric data.
    pub fn is_plan_data(&self) -> bool {
        matches!(self, HelixError::PlanData(_))
    }
}

impl From<serialport::Error> for HelixError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(kind) => {
                HelixError::Io(std::io::Error::new(kind, err.description))
            }
            _ => HelixError::Transport(err.description),
        }
    }
}

impl From<figment::Error> for HelixError {
    fn from(err: figment::Error) -> Self {
        HelixError::Config(err.to_string())
    }
}
