//! Run lifecycle and session exclusivity.
//!
//! The orchestrator owns the shared [`HardwareSession`], the operator [`RunControl`] and the
//! optional [`TemperatureMonitor`]. It guarantees that at most one of these touches the session
//! at a time:
//!
//! - starting a run stops and joins the monitor before the engine issues its first command
//! - the run worker holds the session lock for the whole run
//! - the monitor is only restarted on request, and never while a run thread is alive
//! - manual operations (`with_session`) are refused while a run is active
//!
//! # Example
//!
//! ```rust
//! use helix_cycler::config::Settings;
//! use helix_cycler::hardware::SimulatedThermocycler;
//! use helix_cycler::orchestrator::Orchestrator;
//! use helix_cycler::protocol::{
//!     EngineState, NullGraphSink, ProtocolPlan, Stage, Step, TracingProgressSink,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), helix_cycler::error::HelixError> {
//! let mut orchestrator = Orchestrator::new(Settings::default());
//! orchestrator.with_session(|session| {
//!     session.attach(Box::new(SimulatedThermocycler::new()));
//!     Ok(())
//! })?;
//!
//! let plan = ProtocolPlan::new(vec![Stage::new(1, vec![Step::DeactivateAll])]);
//! let run = orchestrator.start_run(
//!     plan,
//!     "demo",
//!     Arc::new(TracingProgressSink),
//!     Arc::new(NullGraphSink),
//! )?;
//! let report = run.wait()?;
//! assert_eq!(report.state, EngineState::Completed);
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use crate::error::{HelixError, HelixResult};
use crate::hardware::{HardwareSession, SharedSession};
use crate::monitor::{MonitorHandle, TemperatureMonitor};
use crate::protocol::{
    EngineState, GraphSink, ProgressSink, ProtocolEngine, ProtocolPlan, RunControl, RunReport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// Clears the "run active" flag when the worker exits, panics included.
struct ActiveRun(Arc<AtomicBool>);

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Coordinates the session between protocol runs, the monitor and manual controls.
pub struct Orchestrator {
    settings: Settings,
    session: SharedSession,
    control: RunControl,
    monitor: Option<MonitorHandle>,
    run_active: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(settings: Settings) -> Self {
        let session = HardwareSession::new(&settings).into_shared();
        Self::with_shared_session(settings, session)
    }

    pub fn with_shared_session(settings: Settings, session: SharedSession) -> Self {
        Self {
            settings,
            session,
            control: RunControl::new(),
            monitor: None,
            run_active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    pub fn is_run_active(&self) -> bool {
        self.run_active.load(Ordering::SeqCst)
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.as_ref().is_some_and(MonitorHandle::is_running)
    }

    /// Run `f` with exclusive access to the session.
    ///
    /// Refused while a run is active. A transport failure inside `f` disconnects the session so
    /// no half-open handle is left behind.
    pub fn with_session<R, F>(&self, f: F) -> HelixResult<R>
    where
        F: FnOnce(&mut HardwareSession) -> HelixResult<R>,
    {
        if self.is_run_active() {
            return Err(HelixError::RunInProgress);
        }
        let mut session = self.session.lock().map_err(|_| HelixError::SessionPoisoned)?;
        let result = f(&mut session);
        if let Err(err) = &result {
            if err.is_transport() && session.is_connected() {
                warn!(error = %err, "Transport failure during manual operation, disconnecting");
                session.disconnect();
            }
        }
        result
    }

    /// Start the idle temperature monitor. No-op if it is already running.
    pub fn start_monitor(&mut self, sink: Arc<dyn ProgressSink>) -> HelixResult<()> {
        if self.is_run_active() {
            return Err(HelixError::RunInProgress);
        }
        if self.is_monitoring() {
            return Ok(());
        }
        self.monitor = Some(TemperatureMonitor::spawn(
            Arc::clone(&self.session),
            sink,
            self.settings.monitor.interval(),
        ));
        Ok(())
    }

    /// Stop the monitor and wait for its thread to exit.
    pub fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
    }

    /// Start `plan` on a worker thread.
    ///
    /// Stops the monitor first and clears the stop/skip flags. After a stopped run the worker
    /// switches every heater off before releasing the session.
    pub fn start_run(
        &mut self,
        plan: ProtocolPlan,
        title: &str,
        progress: Arc<dyn ProgressSink>,
        graph: Arc<dyn GraphSink>,
    ) -> HelixResult<RunHandle> {
        if self
            .run_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(HelixError::RunInProgress);
        }
        let active = ActiveRun(Arc::clone(&self.run_active));

        self.stop_monitor();
        self.control.clear();

        let session = Arc::clone(&self.session);
        let mut engine = ProtocolEngine::new(
            self.settings.engine.clone(),
            self.control.clone(),
            progress,
            graph,
        )
        .with_title(title);

        let thread = thread::Builder::new()
            .name("helix-run".into())
            .spawn(move || {
                let _active = active;
                run_worker(&session, &mut engine, &plan)
            })?;

        info!(title, "Protocol run started");
        Ok(RunHandle {
            thread,
            control: self.control.clone(),
        })
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if self.is_run_active() {
            self.control.emergency_stop();
        }
        self.stop_monitor();
    }
}

fn run_worker(
    session: &SharedSession,
    engine: &mut ProtocolEngine,
    plan: &ProtocolPlan,
) -> RunReport {
    let mut session = match session.lock() {
        Ok(guard) => guard,
        Err(_) => {
            error!("Session lock poisoned, run not started");
            return RunReport {
                state: EngineState::Faulted,
                error: Some(HelixError::SessionPoisoned.to_string()),
                steps_executed: 0,
                steps_skipped: 0,
                samples_recorded: 0,
                elapsed: std::time::Duration::ZERO,
            };
        }
    };

    let report = engine.run(&mut *session, plan);

    if report.state == EngineState::Stopped && session.is_connected() {
        if let Err(err) = session.deactivate_all() {
            warn!(error = %err, "Deactivate after stop failed, disconnecting");
            session.disconnect();
        }
    }
    report
}

/// Handle to a running protocol.
pub struct RunHandle {
    thread: JoinHandle<RunReport>,
    control: RunControl,
}

impl RunHandle {
    pub fn emergency_stop(&self) {
        self.control.emergency_stop();
    }

    pub fn skip_step(&self) {
        self.control.skip_step();
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until the run ends and return its report.
    pub fn wait(self) -> HelixResult<RunReport> {
        self.thread.join().map_err(|_| HelixError::SessionPoisoned)
    }
}
