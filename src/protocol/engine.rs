//! Protocol engine
//!
//! Walks a [`ProtocolPlan`] against any [`Thermocycler`]: every stage in order, each stage's
//! steps repeated `cycles` times. Runs synchronously on the caller's thread; the orchestrator
//! puts it on a dedicated worker.
//!
//! # Step handling
//!
//! - `Incubate` sets the lid (if given) and the plate, then polls lid and plate telemetry every
//!   `poll_interval`. A timed step ends when the device-reported remaining time drops to
//!   `completion_epsilon` or below; an indefinite hold ends only on stop or skip.
//! - `DeactivateAll` switches everything off and moves on.
//! - `EndAndGraph` hands the recorded history to the [`GraphSink`] and holds at the last
//!   recorded plate temperature.
//!
//! # Errors
//!
//! | where                   | error class        | result                   |
//! |-------------------------|--------------------|--------------------------|
//! | inside a polling loop   | transport          | step skipped, run goes on|
//! | anywhere                | plan data          | `Faulted`                |
//! | outside a polling loop  | transport          | `Faulted`                |
//! | any checkpoint          | stop flag raised   | `Stopped`                |
//!
//! # Example
//!
//! ```rust
//! use helix_cycler::config::EngineConfig;
//! use helix_cycler::hardware::mock::MockThermocycler;
//! use helix_cycler::protocol::{
//!     EngineState, Incubation, NullGraphSink, ProtocolEngine, ProtocolPlan, RunControl, Stage,
//!     Step, TracingProgressSink,
//! };
//! use std::sync::Arc;
//!
//! let plan = ProtocolPlan::new(vec![Stage::new(
//!     2,
//!     vec![Step::Incubate(Incubation::timed(95.0, 30.0)), Step::DeactivateAll],
//! )]);
//! let config = EngineConfig { poll_interval_ms: 1, ..EngineConfig::default() };
//!
//! let mut engine = ProtocolEngine::new(
//!     config,
//!     RunControl::new(),
//!     Arc::new(TracingProgressSink),
//!     Arc::new(NullGraphSink),
//! );
//! let mut device = MockThermocycler::new();
//! let report = engine.run(&mut device, &plan);
//! assert_eq!(report.state, EngineState::Completed);
//! ```

use crate::config::EngineConfig;
use crate::error::{HelixError, HelixResult};
use crate::hardware::capabilities::Thermocycler;
use crate::hardware::commands::format_number;
use crate::hardware::telemetry::PlateReading;
use crate::protocol::control::RunControl;
use crate::protocol::plan::{Incubation, ProtocolPlan, Step};
use crate::protocol::sink::{GraphSink, ProgressSink};
use crate::protocol::state::{EngineState, RunReport, TemperatureHistory, TemperatureSample};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// How a polling loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Finished,
    Skipped,
}

/// Per-run bookkeeping, dropped when the run returns.
struct RunContext {
    started: Instant,
    history: TemperatureHistory,
    last_plate_temp: Option<f64>,
    steps_executed: u64,
    steps_skipped: u64,
    samples_recorded: usize,
}

impl RunContext {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            history: TemperatureHistory::new(),
            last_plate_temp: None,
            steps_executed: 0,
            steps_skipped: 0,
            samples_recorded: 0,
        }
    }

    fn report(&self, state: EngineState, error: Option<String>) -> RunReport {
        RunReport {
            state,
            error,
            steps_executed: self.steps_executed,
            steps_skipped: self.steps_skipped,
            samples_recorded: self.samples_recorded,
            elapsed: self.started.elapsed(),
        }
    }
}

/// Executes protocol plans against a thermocycler.
pub struct ProtocolEngine {
    config: EngineConfig,
    control: RunControl,
    progress: Arc<dyn ProgressSink>,
    graph: Arc<dyn GraphSink>,
    title: String,
    state: EngineState,
}

impl ProtocolEngine {
    pub fn new(
        config: EngineConfig,
        control: RunControl,
        progress: Arc<dyn ProgressSink>,
        graph: Arc<dyn GraphSink>,
    ) -> Self {
        Self {
            config,
            control,
            progress,
            graph,
            title: "run".to_string(),
            state: EngineState::Idle,
        }
    }

    /// Title passed to the graph sink.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    /// Run `plan` to a terminal state.
    ///
    /// Always returns exactly one report whose state is `Completed`, `Stopped` or `Faulted`.
    /// An empty plan completes without touching the device.
    pub fn run<D>(&mut self, device: &mut D, plan: &ProtocolPlan) -> RunReport
    where
        D: Thermocycler + ?Sized,
    {
        let mut ctx = RunContext::new();

        if plan.is_empty() {
            info!("Empty protocol, nothing to run");
            return self.finish(&ctx, EngineState::Completed, None);
        }
        if !device.is_connected() {
            error!("Cannot start protocol: thermocycler not connected");
            self.progress.step_progress("Error: Not Connected");
            return self.finish(&ctx, EngineState::Faulted, Some(HelixError::NotConnected));
        }
        if let Err(err) = plan.validate() {
            return self.finish(&ctx, EngineState::Faulted, Some(err));
        }

        self.state = EngineState::Running;
        info!(
            title = %self.title,
            stages = plan.stages.len(),
            steps = plan.total_steps(),
            "Protocol started"
        );

        match self.execute(device, plan, &mut ctx) {
            Ok(()) => self.finish(&ctx, EngineState::Completed, None),
            Err(HelixError::EmergencyStop) => self.finish(&ctx, EngineState::Stopped, None),
            Err(err) => self.finish(&ctx, EngineState::Faulted, Some(err)),
        }
    }

    fn finish(
        &mut self,
        ctx: &RunContext,
        state: EngineState,
        err: Option<HelixError>,
    ) -> RunReport {
        self.state = state;
        let report = ctx.report(state, err.map(|e| e.to_string()));
        match state {
            EngineState::Faulted => error!(%report, "Protocol faulted"),
            EngineState::Stopped => warn!(%report, "Protocol stopped"),
            _ => info!(%report, "Protocol finished"),
        }
        report
    }

    fn execute<D>(
        &self,
        device: &mut D,
        plan: &ProtocolPlan,
        ctx: &mut RunContext,
    ) -> HelixResult<()>
    where
        D: Thermocycler + ?Sized,
    {
        for (stage_index, stage) in plan.stages.iter().enumerate() {
            self.check_stop()?;
            for cycle in 1..=stage.cycles {
                self.check_stop()?;
                for (step_index, step) in stage.steps.iter().enumerate() {
                    self.check_stop()?;
                    let (stage_no, step_no) = (stage_index + 1, step_index + 1);

                    self.progress.step_progress(&format!(
                        "Stage {}\tCycle {}\tStep {}",
                        stage_no, cycle, step_no
                    ));
                    debug!(stage = stage_no, cycle, step = step_no, %step, "Step started");
                    ctx.steps_executed += 1;

                    if self.run_step(device, step, ctx)? == StepOutcome::Skipped {
                        ctx.steps_skipped += 1;
                        info!(stage = stage_no, cycle, step = step_no, "Step skipped");
                    }
                }
            }
        }
        // A stop raised during the last step must not read as completion.
        self.check_stop()
    }

    fn run_step<D>(
        &self,
        device: &mut D,
        step: &Step,
        ctx: &mut RunContext,
    ) -> HelixResult<StepOutcome>
    where
        D: Thermocycler + ?Sized,
    {
        match step {
            Step::Incubate(incubation) => self.incubate(device, incubation, ctx),
            Step::DeactivateAll => {
                device.deactivate_all()?;
                Ok(StepOutcome::Finished)
            }
            Step::EndAndGraph => {
                let target = ctx.last_plate_temp.ok_or_else(|| {
                    HelixError::PlanData(
                        "END&GRAPH reached before any plate temperature was recorded".into(),
                    )
                })?;
                let history = std::mem::take(&mut ctx.history);
                if let Err(err) = self.graph.emit(&self.title, history) {
                    warn!(error = %err, "Graph sink failed, continuing with final hold");
                }
                self.incubate(device, &Incubation::hold(target), ctx)
            }
        }
    }

    fn incubate<D>(
        &self,
        device: &mut D,
        incubation: &Incubation,
        ctx: &mut RunContext,
    ) -> HelixResult<StepOutcome>
    where
        D: Thermocycler + ?Sized,
    {
        if let Some(lid) = incubation.lid_temp {
            device.set_lid_temperature(lid)?;
        }

        match incubation.hold_seconds {
            Some(hold) => {
                let volume = self.config.well_volume;
                device.set_plate_temperature(incubation.plate_temp, Some(hold), volume)?;
                self.timed_hold(device, hold, ctx)
            }
            None => {
                device.set_plate_temperature(incubation.plate_temp, None, None)?;
                self.indefinite_hold(device)
            }
        }
    }

    /// Poll until the device reports the hold as done.
    fn timed_hold<D>(
        &self,
        device: &mut D,
        hold: f64,
        ctx: &mut RunContext,
    ) -> HelixResult<StepOutcome>
    where
        D: Thermocycler + ?Sized,
    {
        let mut remaining = hold;
        while remaining > self.config.completion_epsilon {
            if self.checkpoint()? {
                return Ok(StepOutcome::Skipped);
            }

            let (lid, plate) = match self.poll(device) {
                Ok(readings) => readings,
                Err(err) if err.is_transport() => {
                    self.check_stop()?;
                    warn!(error = %err, "Telemetry failed during timed step, skipping step");
                    return Ok(StepOutcome::Skipped);
                }
                Err(err) => return Err(err),
            };

            ctx.history.record(TemperatureSample {
                elapsed_minutes: ctx.started.elapsed().as_secs_f64() / 60.0,
                lid_celsius: lid,
                plate_celsius: plate.temperature_celsius,
                hold_seconds: hold,
            });
            ctx.samples_recorded += 1;
            ctx.last_plate_temp = Some(plate.temperature_celsius);

            self.pause();
            remaining = plate.seconds_remaining.as_seconds()?;
        }
        Ok(StepOutcome::Finished)
    }

    /// Poll until stopped or skipped.
    fn indefinite_hold<D>(&self, device: &mut D) -> HelixResult<StepOutcome>
    where
        D: Thermocycler + ?Sized,
    {
        loop {
            if self.checkpoint()? {
                return Ok(StepOutcome::Skipped);
            }
            if let Err(err) = self.poll(device) {
                if err.is_transport() {
                    self.check_stop()?;
                    warn!(error = %err, "Telemetry failed during hold, skipping step");
                    return Ok(StepOutcome::Skipped);
                }
                return Err(err);
            }
            self.pause();
        }
    }

    /// Read lid and plate telemetry and report it.
    fn poll<D>(&self, device: &mut D) -> HelixResult<(f64, PlateReading)>
    where
        D: Thermocycler + ?Sized,
    {
        let lid = device.get_lid_temperature()?;
        let plate = device.get_plate_info()?;

        self.progress.lid_temperature(&format!("{} °C", format_number(lid)));
        self.progress
            .plate_temperature(&format!("{} °C", format_number(plate.temperature_celsius)));
        self.progress
            .time_remaining(&format!("{} secs", plate.seconds_remaining));
        Ok((lid, plate))
    }

    fn check_stop(&self) -> HelixResult<()> {
        if self.control.is_stopped() {
            Err(HelixError::EmergencyStop)
        } else {
            Ok(())
        }
    }

    /// Polling-loop checkpoint: `Err` on stop, `Ok(true)` when a skip was consumed.
    fn checkpoint(&self) -> HelixResult<bool> {
        self.check_stop()?;
        Ok(self.control.take_skip())
    }

    /// Sleep one poll interval, waking early on a stop or skip request.
    fn pause(&self) {
        let deadline = Instant::now() + self.config.poll_interval();
        loop {
            if self.control.is_stopped() || self.control.skip_requested() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{Call, MockThermocycler};
    use crate::protocol::plan::Stage;
    use crate::protocol::sink::{ChannelProgressSink, NullGraphSink, ProgressUpdate};

    fn fast_config() -> EngineConfig {
        EngineConfig {
            poll_interval_ms: 1,
            ..EngineConfig::default()
        }
    }

    fn engine() -> ProtocolEngine {
        ProtocolEngine::new(
            fast_config(),
            RunControl::new(),
            Arc::new(crate::protocol::sink::TracingProgressSink),
            Arc::new(NullGraphSink),
        )
    }

    fn single_step(step: Incubation) -> ProtocolPlan {
        ProtocolPlan::new(vec![Stage::new(1, vec![Step::Incubate(step)])])
    }

    #[test]
    fn empty_plan_completes_without_device_calls() {
        let mut device = MockThermocycler::disconnected();
        let mut engine = engine();
        assert_eq!(engine.state(), EngineState::Idle);

        let report = engine.run(&mut device, &ProtocolPlan::default());
        assert_eq!(report.state, EngineState::Completed);
        assert_eq!(engine.state(), EngineState::Completed);
        assert!(device.calls().is_empty());
    }

    #[test]
    fn disconnected_device_faults() {
        let plan = ProtocolPlan::new(vec![Stage::new(1, vec![Step::DeactivateAll])]);
        let mut device = MockThermocycler::disconnected();
        let report = engine().run(&mut device, &plan);
        assert_eq!(report.state, EngineState::Faulted);
        assert_eq!(report.error.as_deref(), Some("Serial port not connected"));
        assert!(device.calls().is_empty());
    }

    #[test]
    fn lid_is_set_before_plate() {
        let plan = ProtocolPlan::new(vec![Stage::new(
            1,
            vec![Step::Incubate(Incubation::timed(95.0, 3.0).with_lid(105.0))],
        )]);
        let mut device = MockThermocycler::new();
        let mut engine = ProtocolEngine::new(
            EngineConfig {
                well_volume: Some(25.0),
                ..fast_config()
            },
            RunControl::new(),
            Arc::new(SilentProgress),
            Arc::new(NullGraphSink),
        );
        engine.run(&mut device, &plan);

        assert_eq!(
            &device.calls()[..2],
            &[
                Call::SetLidTemperature(105.0),
                Call::SetPlateTemperature {
                    target: 95.0,
                    hold_seconds: Some(3.0),
                    well_volume: Some(25.0)
                }
            ]
        );
    }

    #[test]
    fn zero_hold_does_not_poll() {
        let plan = single_step(Incubation::timed(20.0, 0.0));
        let mut device = MockThermocycler::new();
        let report = engine().run(&mut device, &plan);
        assert!(report.is_success());
        assert_eq!(device.plate_polls(), 0);
    }

    #[test]
    fn reports_progress_text() {
        let plan = single_step(Incubation::timed(95.0, 3.0));
        let (sink, mut rx) = ChannelProgressSink::new();
        let mut engine = ProtocolEngine::new(
            fast_config(),
            RunControl::new(),
            Arc::new(sink),
            Arc::new(NullGraphSink),
        );
        let mut device = MockThermocycler::new().with_polls_per_hold(1);
        engine.run(&mut device, &plan);

        let updates: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            updates,
            vec![
                ProgressUpdate::Step("Stage 1\tCycle 1\tStep 1".into()),
                ProgressUpdate::Lid("25.0 °C".into()),
                ProgressUpdate::Plate("95.0 °C".into()),
                ProgressUpdate::TimeRemaining("0 secs".into()),
            ]
        );
    }

    #[test]
    fn unparseable_remaining_time_faults() {
        let plan = single_step(Incubation::timed(95.0, 3.0));
        let mut device = MockThermocycler::new().with_remaining_token("--");
        let report = engine().run(&mut device, &plan);
        assert_eq!(report.state, EngineState::Faulted);
        assert!(report.error.unwrap().contains("not a number"));
        assert_eq!(device.plate_polls(), 1);
    }

    struct SilentProgress;

    impl ProgressSink for SilentProgress {
        fn step_progress(&self, _: &str) {}
        fn lid_temperature(&self, _: &str) {}
        fn plate_temperature(&self, _: &str) {}
        fn time_remaining(&self, _: &str) {}
    }
}
