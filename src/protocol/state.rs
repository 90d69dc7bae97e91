//! Engine state, run reports and the recorded temperature history.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Protocol engine lifecycle.
///
/// ```text
/// Idle ──run()──> Running ──┬──> Completed   all stages done
///                           ├──> Stopped     emergency stop observed
///                           └──> Faulted     unrecovered error
/// ```
///
/// The three terminal states are reported once per run; `run()` always returns in one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Idle,
    Running,
    Completed,
    Stopped,
    Faulted,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "Idle"),
            EngineState::Running => write!(f, "Running"),
            EngineState::Completed => write!(f, "Completed"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Faulted => write!(f, "Faulted"),
        }
    }
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineState::Completed | EngineState::Stopped | EngineState::Faulted
        )
    }
}

/// One telemetry sample taken during a timed step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSample {
    /// Minutes since the run started.
    pub elapsed_minutes: f64,
    pub lid_celsius: f64,
    pub plate_celsius: f64,
    /// The step's programmed hold time, not the remaining time.
    pub hold_seconds: f64,
}

/// Samples in recording order; elapsed time never decreases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemperatureHistory {
    samples: Vec<TemperatureSample>,
}

impl TemperatureHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sample: TemperatureSample) {
        self.samples.push(sample);
    }

    pub fn samples(&self) -> &[TemperatureSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The most recent sample.
    pub fn latest(&self) -> Option<&TemperatureSample> {
        self.samples.last()
    }
}

/// Outcome of one engine run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub state: EngineState,
    /// Error text for a `Faulted` run.
    pub error: Option<String>,
    /// Steps started, counting every cycle repetition.
    pub steps_executed: u64,
    /// Steps abandoned through skip requests or transport errors.
    pub steps_skipped: u64,
    pub samples_recorded: usize,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.state == EngineState::Completed
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {:.1} s: {} steps executed, {} skipped, {} samples",
            self.state,
            self.elapsed.as_secs_f64(),
            self.steps_executed,
            self.steps_skipped,
            self.samples_recorded
        )?;
        if let Some(error) = &self.error {
            write!(f, " ({})", error)?;
        }
        Ok(())
    }
}
