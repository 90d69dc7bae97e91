//! Mock Hardware Implementations
//!
//! Test doubles for running the stack without a physical thermocycler.
//!
//! # Available Mocks
//!
//! - `ScriptedTransport` - replays canned response lines and records every write
//! - `MockThermocycler` - records engine calls and counts down hold time per poll
//!
//! Both are deterministic: nothing sleeps, so tests measure behaviour in call counts rather
//! than wall-clock time. For a device that behaves in real time see
//! [`SimulatedThermocycler`](crate::hardware::simulator::SimulatedThermocycler).

use crate::error::{HelixError, HelixResult};
use crate::hardware::capabilities::Thermocycler;
use crate::hardware::telemetry::{PlateReading, RemainingTime};
use crate::hardware::transport::Transport;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

// =============================================================================
// ScriptedTransport - canned response lines
// =============================================================================

#[derive(Default)]
struct ScriptState {
    responses: VecDeque<String>,
    repeat: Option<String>,
    written: Vec<String>,
    reads: usize,
    input_resets: usize,
    fail_reads_after: Option<usize>,
    fail_writes: bool,
}

/// Transport that answers reads from a script.
///
/// Clones share state, so a test can keep one handle while the session owns another.
/// When the script runs dry a read returns `""` (no data before the timeout), unless a
/// repeating line was configured.
///
/// # Example
///
/// ```rust
/// use helix_cycler::hardware::mock::ScriptedTransport;
/// use helix_cycler::hardware::transport::Transport;
/// use std::time::Duration;
///
/// let mut transport = ScriptedTransport::new(["T:95.0 C:94.1 H:3.0\r\n"]);
/// transport.write("\r\nM105\r\n").unwrap();
/// assert_eq!(transport.read_line(Duration::ZERO).unwrap(), "T:95.0 C:94.1 H:3.0\r\n");
/// assert_eq!(transport.read_line(Duration::ZERO).unwrap(), "");
/// assert_eq!(transport.written(), vec!["\r\nM105\r\n".to_string()]);
/// ```
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedTransport {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let transport = Self::default();
        transport.lock().responses = lines.into_iter().map(Into::into).collect();
        transport
    }

    /// Answer every read with `line`.
    pub fn repeating(line: impl Into<String>) -> Self {
        let transport = Self::default();
        transport.lock().repeat = Some(line.into());
        transport
    }

    /// Reads after the first `reads` fail with a transport error.
    pub fn fail_reads_after(self, reads: usize) -> Self {
        self.lock().fail_reads_after = Some(reads);
        self
    }

    /// Every write fails with a transport error.
    pub fn fail_writes(self) -> Self {
        self.lock().fail_writes = true;
        self
    }

    /// Queue another response line.
    pub fn push_line(&self, line: impl Into<String>) {
        self.lock().responses.push_back(line.into());
    }

    /// Everything written so far, one entry per write.
    pub fn written(&self) -> Vec<String> {
        self.lock().written.clone()
    }

    /// Number of read attempts, failed ones included.
    pub fn reads(&self) -> usize {
        self.lock().reads
    }

    pub fn input_resets(&self) -> usize {
        self.lock().input_resets
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Transport for ScriptedTransport {
    fn write(&mut self, data: &str) -> HelixResult<()> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(HelixError::Transport("scripted write failure".into()));
        }
        state.written.push(data.to_string());
        Ok(())
    }

    fn read_line(&mut self, _timeout: Duration) -> HelixResult<String> {
        let mut state = self.lock();
        state.reads += 1;
        if let Some(limit) = state.fail_reads_after {
            if state.reads > limit {
                return Err(HelixError::Transport("scripted read failure".into()));
            }
        }
        if let Some(line) = state.responses.pop_front() {
            return Ok(line);
        }
        Ok(state.repeat.clone().unwrap_or_default())
    }

    fn reset_input_buffer(&mut self) -> HelixResult<()> {
        self.lock().input_resets += 1;
        Ok(())
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

// =============================================================================
// MockThermocycler - recording engine double
// =============================================================================

/// One recorded call on a [`MockThermocycler`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    SetLidTemperature(f64),
    SetPlateTemperature {
        target: f64,
        hold_seconds: Option<f64>,
        well_volume: Option<f64>,
    },
    GetLidTemperature,
    GetPlateInfo,
    DeactivateAll,
}

type ErrorFactory = Box<dyn Fn() -> HelixError + Send>;
type PollHook = Box<dyn FnMut(usize) + Send>;

/// Thermocycler double that records calls and needs no transport.
///
/// Temperatures jump straight to their targets. A timed plate set-point counts down
/// in `polls_per_hold` equal decrements, one per `get_plate_info` call; without a hold the
/// device reports `0` remaining.
pub struct MockThermocycler {
    connected: bool,
    calls: Vec<Call>,
    lid_target: f64,
    plate_target: f64,
    hold_seconds: f64,
    remaining: f64,
    polls_per_hold: u32,
    plate_polls: usize,
    remaining_override: Option<String>,
    plate_failure: Option<(usize, ErrorFactory)>,
    plate_hook: Option<PollHook>,
}

impl MockThermocycler {
    pub fn new() -> Self {
        Self {
            connected: true,
            calls: Vec::new(),
            lid_target: 25.0,
            plate_target: 25.0,
            hold_seconds: 0.0,
            remaining: 0.0,
            polls_per_hold: 3,
            plate_polls: 0,
            remaining_override: None,
            plate_failure: None,
            plate_hook: None,
        }
    }

    pub fn disconnected() -> Self {
        Self {
            connected: false,
            ..Self::new()
        }
    }

    /// Number of plate polls a timed step takes to count down to zero.
    pub fn with_polls_per_hold(mut self, polls: u32) -> Self {
        self.polls_per_hold = polls.max(1);
        self
    }

    /// Report `token` as the remaining time on every plate poll.
    pub fn with_remaining_token(mut self, token: impl Into<String>) -> Self {
        self.remaining_override = Some(token.into());
        self
    }

    /// Fail the `call`-th `get_plate_info` (1-based, counted over the whole run).
    pub fn fail_plate_info_on<F>(mut self, call: usize, error: F) -> Self
    where
        F: Fn() -> HelixError + Send + 'static,
    {
        self.plate_failure = Some((call, Box::new(error)));
        self
    }

    /// Run `hook` with the 1-based poll number before each `get_plate_info` answers.
    pub fn on_plate_poll<F>(mut self, hook: F) -> Self
    where
        F: FnMut(usize) + Send + 'static,
    {
        self.plate_hook = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn plate_polls(&self) -> usize {
        self.plate_polls
    }

    /// Recorded calls without the telemetry queries.
    pub fn set_points(&self) -> Vec<Call> {
        self.calls
            .iter()
            .filter(|call| !matches!(call, Call::GetLidTemperature | Call::GetPlateInfo))
            .cloned()
            .collect()
    }
}

impl Default for MockThermocycler {
    fn default() -> Self {
        Self::new()
    }
}

impl Thermocycler for MockThermocycler {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn set_lid_temperature(&mut self, target: f64) -> HelixResult<()> {
        self.calls.push(Call::SetLidTemperature(target));
        self.lid_target = target;
        Ok(())
    }

    fn set_plate_temperature(
        &mut self,
        target: f64,
        hold_seconds: Option<f64>,
        well_volume: Option<f64>,
    ) -> HelixResult<()> {
        self.calls.push(Call::SetPlateTemperature {
            target,
            hold_seconds,
            well_volume,
        });
        self.plate_target = target;
        self.hold_seconds = hold_seconds.unwrap_or(0.0);
        self.remaining = self.hold_seconds;
        Ok(())
    }

    fn get_lid_temperature(&mut self) -> HelixResult<f64> {
        self.calls.push(Call::GetLidTemperature);
        Ok(self.lid_target)
    }

    fn get_plate_info(&mut self) -> HelixResult<PlateReading> {
        self.calls.push(Call::GetPlateInfo);
        self.plate_polls += 1;

        if let Some(hook) = self.plate_hook.as_mut() {
            hook(self.plate_polls);
        }
        if let Some((call, error)) = &self.plate_failure {
            if *call == self.plate_polls {
                return Err(error());
            }
        }

        let decrement = self.hold_seconds / f64::from(self.polls_per_hold);
        self.remaining = (self.remaining - decrement).max(0.0);

        let token = self
            .remaining_override
            .clone()
            .unwrap_or_else(|| format!("{}", self.remaining));
        Ok(PlateReading {
            temperature_celsius: self.plate_target,
            seconds_remaining: RemainingTime::new(token),
        })
    }

    fn deactivate_all(&mut self) -> HelixResult<()> {
        self.calls.push(Call::DeactivateAll);
        Ok(())
    }
}
