//! Idle temperature monitor.
//!
//! While no protocol is running, a background thread polls lid and plate telemetry through the
//! shared session every `interval` and reports it to a [`ProgressSink`]. The monitor and the
//! engine must never use the session at the same time; the orchestrator stops and joins the
//! monitor before a run starts.
//!
//! # Example
//!
//! ```rust
//! use helix_cycler::config::Settings;
//! use helix_cycler::hardware::{HardwareSession, SimulatedThermocycler};
//! use helix_cycler::monitor::TemperatureMonitor;
//! use helix_cycler::protocol::TracingProgressSink;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let mut session = HardwareSession::new(&Settings::default());
//! session.attach(Box::new(SimulatedThermocycler::new()));
//!
//! let monitor = TemperatureMonitor::spawn(
//!     session.into_shared(),
//!     Arc::new(TracingProgressSink),
//!     Duration::from_millis(20),
//! );
//! std::thread::sleep(Duration::from_millis(50));
//! monitor.stop();
//! ```

use crate::hardware::commands::format_number;
use crate::hardware::SharedSession;
use crate::protocol::sink::ProgressSink;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Handle to a running monitor thread. Dropping it stops the thread.
pub struct MonitorHandle {
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Wake the monitor, ask it to exit and wait until it has.
    pub fn stop(mut self) {
        self.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|thread| !thread.is_finished())
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Temperature monitor thread panicked");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Periodic lid/plate reporter.
pub struct TemperatureMonitor;

impl TemperatureMonitor {
    /// Start polling on a dedicated thread.
    pub fn spawn(
        session: SharedSession,
        sink: Arc<dyn ProgressSink>,
        interval: Duration,
    ) -> MonitorHandle {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let spawned = thread::Builder::new()
            .name("helix-monitor".into())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "Temperature monitor started");
                loop {
                    poll_once(&session, sink.as_ref());
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("Temperature monitor stopped");
            });

        let thread = match spawned {
            Ok(thread) => Some(thread),
            Err(err) => {
                warn!(error = %err, "Could not start temperature monitor thread");
                None
            }
        };

        MonitorHandle {
            stop_tx: Some(stop_tx),
            thread,
        }
    }
}

fn poll_once(session: &SharedSession, sink: &dyn ProgressSink) {
    let mut session = match session.lock() {
        Ok(guard) => guard,
        Err(_) => {
            warn!("Session lock poisoned, skipping monitor poll");
            return;
        }
    };
    if !session.is_connected() {
        debug!("Monitor idle: not connected");
        return;
    }

    match session.get_lid_temperature() {
        Ok(lid) => sink.lid_temperature(&format!("{} °C", format_number(lid))),
        Err(err) => {
            warn!(error = %err, "Monitor lid query failed");
            return;
        }
    }
    match session.get_plate_info() {
        Ok(plate) => {
            sink.plate_temperature(&format!("{} °C", format_number(plate.temperature_celsius)));
            sink.time_remaining(&format!("{} secs", plate.seconds_remaining));
        }
        Err(err) => warn!(error = %err, "Monitor plate query failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::hardware::mock::ScriptedTransport;
    use crate::hardware::HardwareSession;
    use crate::protocol::sink::{ChannelProgressSink, ProgressUpdate};
    use std::time::Instant;

    #[test]
    fn reports_readings_until_stopped() {
        let transport = ScriptedTransport::new([
            "T:105.0 C:104.5\r\n",
            "T:95.0 C:94.0 H:0\r\n",
        ]);
        let mut session = HardwareSession::new(&Settings::default());
        session.attach(Box::new(transport.clone()));
        let (sink, mut rx) = ChannelProgressSink::new();

        let interval = Duration::from_secs(60);
        let monitor = TemperatureMonitor::spawn(session.into_shared(), Arc::new(sink), interval);
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut updates = Vec::new();
        while updates.len() < 3 && Instant::now() < deadline {
            match rx.try_recv() {
                Ok(update) => updates.push(update),
                Err(_) => thread::sleep(Duration::from_millis(5)),
            }
        }

        let started = Instant::now();
        monitor.stop();
        assert!(started.elapsed() < Duration::from_secs(1), "stop must wake the monitor early");

        assert_eq!(
            updates,
            vec![
                ProgressUpdate::Lid("104.5 °C".into()),
                ProgressUpdate::Plate("94.0 °C".into()),
                ProgressUpdate::TimeRemaining("0 secs".into()),
            ]
        );
        assert_eq!(transport.written(), vec!["\r\nM141\r\n", "\r\nM105\r\n"]);
    }

    #[test]
    fn idles_when_disconnected() {
        let session = HardwareSession::new(&Settings::default()).into_shared();
        let (sink, mut rx) = ChannelProgressSink::new();
        let monitor = TemperatureMonitor::spawn(session, Arc::new(sink), Duration::from_millis(5));
        thread::sleep(Duration::from_millis(30));
        assert!(monitor.is_running());
        monitor.stop();
        assert!(rx.try_recv().is_err());
    }
}
