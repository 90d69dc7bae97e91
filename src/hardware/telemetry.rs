//! Telemetry parsing and the bounded query/retry loop.
//!
//! The device answers temperature queries with lines such as
//!
//! ```text
//! T:95.000 C:94.512 H:12.0     plate query (M105): target, current, seconds of hold left
//! T:105.000 C:104.90           lid query (M141): no hold marker
//! ```
//!
//! but the stream also carries blank keep-alive lines, unsolicited status lines and the
//! occasional truncated reply after a device reset. [`classify`] sorts a single line into a
//! typed reading or a retry kind; [`TelemetryReader`] drives the query loop on top of it and
//! gives up with `HelixError::DeviceUnresponsive` after a fixed number of attempts or once its
//! time budget is spent, instead of spinning forever on a dead link.

use crate::error::{HelixError, HelixResult};
use crate::hardware::commands::{encode, Command};
use crate::hardware::transport::Transport;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const TEMPERATURE_MARKER: char = 'T';
const CURRENT_MARKER: &str = "C:";
const HOLD_MARKER: &str = " H:";

/// A lid temperature reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LidReading {
    pub temperature_celsius: f64,
}

/// The device's remaining-hold-time token, kept exactly as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemainingTime(String);

impl RemainingTime {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token for display.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Interpret the token as seconds.
    ///
    /// Only the first whitespace-separated field is considered, since some firmware revisions
    /// append further fields after the hold time.
    ///
    /// # Errors
    /// `HelixError::PlanData` when the token is not a number.
    pub fn as_seconds(&self) -> HelixResult<f64> {
        let field = self.0.split_whitespace().next().unwrap_or("");
        field.parse::<f64>().map_err(|_| {
            HelixError::PlanData(format!("remaining time '{}' is not a number", self.0))
        })
    }
}

impl fmt::Display for RemainingTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A plate temperature reply.
#[derive(Debug, Clone, PartialEq)]
pub struct PlateReading {
    pub temperature_celsius: f64,
    pub seconds_remaining: RemainingTime,
}

/// Why a line did not yield a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    /// Blank line or a line that is not a temperature reply; keep reading.
    Unrelated,
    /// Looked like a temperature reply but the fields did not parse; re-issue the query.
    Malformed,
}

/// Result of classifying one response line.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Lid(LidReading),
    Plate(PlateReading),
    Retry(RetryKind),
}

/// Classify a raw response line.
///
/// A line is a temperature reply only if it starts with `T`. The presence of the ` H:` marker
/// makes it a plate reply, its absence a lid reply.
pub fn classify(line: &str) -> Classified {
    if !line.starts_with(TEMPERATURE_MARKER) {
        return Classified::Retry(RetryKind::Unrelated);
    }

    if line.contains(HOLD_MARKER) {
        parse_plate(line).map_or(Classified::Retry(RetryKind::Malformed), Classified::Plate)
    } else {
        parse_lid(line).map_or(Classified::Retry(RetryKind::Malformed), Classified::Lid)
    }
}

fn parse_lid(line: &str) -> Option<LidReading> {
    let (_, current) = line.split_once(CURRENT_MARKER)?;
    let temperature_celsius = current.trim().parse().ok()?;
    Some(LidReading {
        temperature_celsius,
    })
}

fn parse_plate(line: &str) -> Option<PlateReading> {
    let (_, after_current) = line.split_once(CURRENT_MARKER)?;
    let (current, _) = after_current.split_once(HOLD_MARKER)?;
    let temperature_celsius = current.trim().parse().ok()?;

    let (_, hold) = line.split_once("H:")?;
    let token = hold.split('\r').next().unwrap_or("").trim();
    if token.is_empty() {
        return None;
    }

    Some(PlateReading {
        temperature_celsius,
        seconds_remaining: RemainingTime::new(token),
    })
}

/// Which reading a query is after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryQuery {
    Lid,
    Plate,
}

impl TelemetryQuery {
    pub fn command(self) -> Command {
        match self {
            TelemetryQuery::Lid => Command::GetLidTemp,
            TelemetryQuery::Plate => Command::GetPlateTemp,
        }
    }

    fn name(self) -> &'static str {
        match self {
            TelemetryQuery::Lid => "lid temperature query",
            TelemetryQuery::Plate => "plate temperature query",
        }
    }
}

/// Drives a telemetry query against a transport with a bounded retry budget.
#[derive(Debug, Clone)]
pub struct TelemetryReader {
    max_attempts: u32,
    read_timeout: Duration,
    max_wait: Option<Duration>,
}

impl TelemetryReader {
    /// `max_attempts` counts every line examined, including the first.
    pub fn new(max_attempts: u32, read_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            read_timeout,
            max_wait: None,
        }
    }

    /// Cap the wall-clock time one query may take, whatever attempts remain.
    ///
    /// A link that keeps timing out would otherwise cost `max_attempts` full read timeouts.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait
    }

    pub fn read_lid(&self, transport: &mut dyn Transport) -> HelixResult<LidReading> {
        self.query(transport, TelemetryQuery::Lid, |classified| match classified {
            Classified::Lid(reading) => Some(*reading),
            _ => None,
        })
    }

    pub fn read_plate(&self, transport: &mut dyn Transport) -> HelixResult<PlateReading> {
        self.query(transport, TelemetryQuery::Plate, |classified| match classified {
            Classified::Plate(reading) => Some(reading.clone()),
            _ => None,
        })
    }

    /// Send the query and read lines until `accept` picks the wanted reading.
    ///
    /// Lines of the other reading type, blank lines and unrelated status lines are skipped.
    /// A malformed temperature line causes the query to be re-issued. Every examined line uses
    /// one attempt. With a `max_wait` set, no read waits past the deadline. Transport failures
    /// propagate immediately and are never retried here.
    fn query<R>(
        &self,
        transport: &mut dyn Transport,
        query: TelemetryQuery,
        accept: impl Fn(&Classified) -> Option<R>,
    ) -> HelixResult<R> {
        let command = encode(query.command(), "");
        let started = Instant::now();
        let deadline = self.max_wait.map(|wait| started + wait);
        transport.write(&command)?;

        let mut attempts = 0;
        while attempts < self.max_attempts {
            let timeout = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => self.read_timeout.min(left),
                    _ => break,
                },
                None => self.read_timeout,
            };

            attempts += 1;
            let line = transport.read_line(timeout)?;
            let classified = classify(&line);
            trace!(
                attempt = attempts,
                line = %line.escape_default(),
                ?classified,
                "Telemetry line"
            );

            if let Some(reading) = accept(&classified) {
                transport.reset_input_buffer()?;
                if attempts > 1 {
                    debug!(attempt = attempts, "{} answered after retries", query.name());
                }
                return Ok(reading);
            }

            let malformed = classified == Classified::Retry(RetryKind::Malformed);
            if malformed && attempts < self.max_attempts {
                transport.write(&command)?;
            }
        }

        warn!(
            attempts,
            elapsed_ms = started.elapsed().as_millis() as u64,
            transport = %transport.describe(),
            "{} unanswered",
            query.name()
        );
        Err(HelixError::DeviceUnresponsive {
            query: query.command().wire_token(),
            attempts,
        })
    }
}
