//! Simulated thermocycler device
//!
//! An in-process [`Transport`] that speaks the controller's wire protocol, so the whole stack
//! (session, telemetry parser, engine, monitor) can run without hardware.
//!
//! Behaviour:
//! - Plate and lid temperatures ramp toward their targets at a configurable rate and drift
//!   back to ambient when their heater is off.
//! - A timed plate set-point (`M104 S.. H..`) starts counting down once the plate is within
//!   0.5 °C of the target; `M105` reports the remaining seconds.
//! - Optionally a blank keep-alive line is emitted before every Nth reply, and the link can be
//!   made to drop after a number of writes to exercise disconnect handling.

use crate::error::{HelixError, HelixResult};
use crate::hardware::commands::Command;
use crate::hardware::transport::Transport;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::trace;

const AMBIENT_CELSIUS: f64 = 25.0;
const AT_TARGET_BAND: f64 = 0.5;

struct SimState {
    plate_temp: f64,
    plate_target: Option<f64>,
    hold_total: Option<f64>,
    hold_started: Option<Instant>,
    lid_temp: f64,
    lid_target: Option<f64>,
    lid_open: bool,
    latch_open: bool,
    shake_rpm: u32,
    ramp_rate: f64,
    last_update: Instant,
    pending: VecDeque<String>,
    keepalive_every: Option<u32>,
    replies_sent: u32,
    received: Vec<String>,
    drop_after_writes: Option<usize>,
    writes: usize,
}

impl SimState {
    fn link_down(&self) -> bool {
        matches!(self.drop_after_writes, Some(limit) if self.writes > limit)
    }

    /// Advance temperatures and hold timers to now.
    fn advance(&mut self) {
        let previous = self.last_update;
        let now = Instant::now();
        let dt = now.duration_since(previous).as_secs_f64();
        self.last_update = now;

        let step = self.ramp_rate * dt;
        let plate_goal = self.plate_target.unwrap_or(AMBIENT_CELSIUS);
        let distance = (plate_goal - self.plate_temp).abs();

        if self.plate_target.is_some() && self.hold_total.is_some() && self.hold_started.is_none() {
            if distance <= AT_TARGET_BAND {
                self.hold_started = Some(previous);
            } else if distance <= step && self.ramp_rate > 0.0 {
                let reached_after = (distance - AT_TARGET_BAND) / self.ramp_rate;
                self.hold_started = Some(previous + Duration::from_secs_f64(reached_after));
            }
        }

        self.plate_temp = approach(self.plate_temp, plate_goal, step);
        self.lid_temp = approach(self.lid_temp, self.lid_target.unwrap_or(AMBIENT_CELSIUS), step);
    }

    fn remaining_hold(&self) -> f64 {
        match (self.hold_total, self.hold_started) {
            (Some(total), Some(started)) => (total - started.elapsed().as_secs_f64()).max(0.0),
            (Some(total), None) => total,
            (None, _) => 0.0,
        }
    }

    fn reply(&mut self, line: String) {
        if let Some(every) = self.keepalive_every {
            if every > 0 && self.replies_sent % every == every - 1 {
                self.pending.push_back("\r\n".to_string());
            }
        }
        self.replies_sent += 1;
        self.pending.push_back(line);
    }

    fn handle(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        self.received.push(line.to_string());
        self.advance();

        let (command, args) = match Command::from_wire_token(line) {
            Some(command) => (command, ""),
            None => {
                let (token, args) = line.split_once(' ').unwrap_or((line, ""));
                match Command::from_wire_token(token) {
                    Some(command) => (command, args),
                    None => {
                        self.reply(format!("ERR:unknown command {}\r\n", token));
                        return;
                    }
                }
            }
        };

        match command {
            Command::SetPlateTemp => {
                self.plate_target = argument(args, 'S');
                self.hold_total = argument(args, 'H');
                self.hold_started = None;
                self.advance();
            }
            Command::GetPlateTemp => {
                let reply = format!(
                    "T:{:.3} C:{:.3} H:{:.1}\r\n",
                    self.plate_target.unwrap_or(0.0),
                    self.plate_temp,
                    self.remaining_hold()
                );
                self.reply(reply);
            }
            Command::SetLidTemp => self.lid_target = argument(args, 'S'),
            Command::GetLidTemp => {
                let reply = format!(
                    "T:{:.3} C:{:.3}\r\n",
                    self.lid_target.unwrap_or(0.0),
                    self.lid_temp
                );
                self.reply(reply);
            }
            Command::DeactivateAll => {
                self.plate_target = None;
                self.hold_total = None;
                self.hold_started = None;
                self.lid_target = None;
                self.shake_rpm = 0;
            }
            Command::DeactivateBlock | Command::DeactivateHeating => {
                self.plate_target = None;
                self.hold_total = None;
                self.hold_started = None;
            }
            Command::DeactivateLid => self.lid_target = None,
            Command::OpenLid => self.lid_open = true,
            Command::CloseLid => self.lid_open = false,
            Command::GetLidStatus => {
                let state = if self.lid_open { "open" } else { "closed" };
                self.reply(format!("Lid:{}\r\n", state));
            }
            Command::OpenLatch => self.latch_open = true,
            Command::CloseLatch => self.latch_open = false,
            Command::SetShakeSpeed => {
                self.shake_rpm = argument(args, 'S').map_or(0, |rpm| rpm.max(0.0) as u32)
            }
            Command::GetShakeSpeed => {
                let reply = format!("S:{}\r\n", self.shake_rpm);
                self.reply(reply);
            }
            Command::DeactivateShake => self.shake_rpm = 0,
            Command::DeviceInfo => self.reply("FW:helix-sim serial:SIM0001\r\n".to_string()),
            Command::EditPidParams
            | Command::SetRampRate
            | Command::EnterProgramming
            | Command::EnterDebugMode
            | Command::ExitDebug => {}
        }
    }
}

fn approach(current: f64, target: f64, step: f64) -> f64 {
    if (target - current).abs() <= step {
        target
    } else if target > current {
        current + step
    } else {
        current - step
    }
}

/// Value of an `S95.0` style argument, if present and numeric.
fn argument(args: &str, prefix: char) -> Option<f64> {
    args.split_whitespace()
        .find_map(|word| word.strip_prefix(prefix))
        .and_then(|value| value.parse().ok())
}

/// In-process device speaking the thermocycler wire protocol.
///
/// Clones share one device, so a test can hold a handle for inspection while the session
/// owns the transport.
#[derive(Clone)]
pub struct SimulatedThermocycler {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedThermocycler {
    /// Device at ambient temperature ramping at 4 °C/s.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                plate_temp: AMBIENT_CELSIUS,
                plate_target: None,
                hold_total: None,
                hold_started: None,
                lid_temp: AMBIENT_CELSIUS,
                lid_target: None,
                lid_open: false,
                latch_open: false,
                shake_rpm: 0,
                ramp_rate: 4.0,
                last_update: Instant::now(),
                pending: VecDeque::new(),
                keepalive_every: None,
                replies_sent: 0,
                received: Vec::new(),
                drop_after_writes: None,
                writes: 0,
            })),
        }
    }

    /// Heating/cooling rate in °C per second.
    pub fn with_ramp_rate(self, celsius_per_second: f64) -> Self {
        self.lock().ramp_rate = celsius_per_second.max(0.0);
        self
    }

    /// Emit a blank line before every `every`-th reply.
    pub fn with_keepalives(self, every: u32) -> Self {
        self.lock().keepalive_every = Some(every);
        self
    }

    /// Fail all I/O once more than `writes` commands have been written.
    pub fn drop_link_after(self, writes: usize) -> Self {
        self.lock().drop_after_writes = Some(writes);
        self
    }

    pub fn plate_target(&self) -> Option<f64> {
        self.lock().plate_target
    }

    pub fn lid_target(&self) -> Option<f64> {
        self.lock().lid_target
    }

    pub fn lid_open(&self) -> bool {
        self.lock().lid_open
    }

    pub fn latch_open(&self) -> bool {
        self.lock().latch_open
    }

    pub fn shake_rpm(&self) -> u32 {
        self.lock().shake_rpm
    }

    /// Every command line received, without framing.
    pub fn received(&self) -> Vec<String> {
        self.lock().received.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SimulatedThermocycler {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimulatedThermocycler {
    fn write(&mut self, data: &str) -> HelixResult<()> {
        let mut state = self.lock();
        state.writes += 1;
        if state.link_down() {
            return Err(HelixError::Transport("simulated device unplugged".into()));
        }
        for line in data.split("\r\n") {
            state.handle(line);
        }
        Ok(())
    }

    fn read_line(&mut self, _timeout: Duration) -> HelixResult<String> {
        let mut state = self.lock();
        if state.link_down() {
            return Err(HelixError::Transport("simulated device unplugged".into()));
        }
        let line = state.pending.pop_front().unwrap_or_default();
        trace!(line = %line.escape_default(), "Simulator reply");
        Ok(line)
    }

    fn reset_input_buffer(&mut self) -> HelixResult<()> {
        self.lock().pending.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        "simulator".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::telemetry::{classify, Classified};

    fn send(sim: &mut SimulatedThermocycler, line: &str) {
        sim.write(&format!("\r\n{}\r\n", line)).unwrap();
    }

    fn next_line(sim: &mut SimulatedThermocycler) -> String {
        sim.read_line(Duration::ZERO).unwrap()
    }

    #[test]
    fn answers_plate_and_lid_queries() {
        let mut sim = SimulatedThermocycler::new().with_ramp_rate(100_000.0);
        send(&mut sim, "M104 S95.0 H30.0");
        send(&mut sim, "M140 S105.0");
        std::thread::sleep(Duration::from_millis(5));

        send(&mut sim, "M105");
        match classify(&next_line(&mut sim)) {
            Classified::Plate(plate) => {
                assert_eq!(plate.temperature_celsius, 95.0);
                let remaining = plate.seconds_remaining.as_seconds().unwrap();
                assert!(remaining <= 30.0 && remaining > 29.0);
            }
            other => panic!("expected plate reading, got {other:?}"),
        }

        send(&mut sim, "M141");
        match classify(&next_line(&mut sim)) {
            Classified::Lid(lid) => assert_eq!(lid.temperature_celsius, 105.0),
            other => panic!("expected lid reading, got {other:?}"),
        }
    }

    #[test]
    fn hold_counts_down_to_zero() {
        let mut sim = SimulatedThermocycler::new().with_ramp_rate(10_000.0);
        send(&mut sim, "M104 S60.0 H0.05");
        std::thread::sleep(Duration::from_millis(80));
        send(&mut sim, "M105");
        assert!(next_line(&mut sim).ends_with("H:0.0\r\n"));
    }

    #[test]
    fn deactivate_all_clears_targets() {
        let mut sim = SimulatedThermocycler::new();
        send(&mut sim, "M104 S95.0");
        send(&mut sim, "M140 S105.0");
        send(&mut sim, "M3 S900");
        send(&mut sim, "M18");
        assert_eq!(sim.plate_target(), None);
        assert_eq!(sim.lid_target(), None);
        assert_eq!(sim.shake_rpm(), 0);
    }

    #[test]
    fn emits_keepalives_and_drops_link() {
        let mut sim = SimulatedThermocycler::new()
            .with_keepalives(1)
            .drop_link_after(2);
        send(&mut sim, "M141");
        assert_eq!(next_line(&mut sim), "\r\n");
        assert!(next_line(&mut sim).starts_with('T'));

        send(&mut sim, "M126");
        assert!(sim.lid_open());
        assert!(sim.write("\r\nM127\r\n").is_err());
        assert!(sim.read_line(Duration::ZERO).is_err());
    }

    #[test]
    fn multi_word_catalog_token_is_recognised() {
        let mut sim = SimulatedThermocycler::new();
        send(&mut sim, "M111 S0");
        send(&mut sim, "M999");
        assert_eq!(sim.received(), vec!["M111 S0", "M999"]);
        assert!(next_line(&mut sim).starts_with("ERR:"));
    }
}
