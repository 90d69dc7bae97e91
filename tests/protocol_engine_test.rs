//! Integration tests for the protocol engine
//!
//! These run the engine against `MockThermocycler`, which counts down hold time per plate poll
//! instead of in wall-clock time, so every assertion is in terms of call counts.

use helix_cycler::config::EngineConfig;
use helix_cycler::error::{HelixError, HelixResult};
use helix_cycler::hardware::mock::{Call, MockThermocycler};
use helix_cycler::protocol::{
    EngineState, GraphSink, Incubation, NullGraphSink, ProgressSink, ProtocolEngine, ProtocolPlan,
    RunControl, Stage, Step, TemperatureHistory,
};
use std::sync::{Arc, Mutex};
use tracing_test::traced_test;

struct QuietProgress;

impl ProgressSink for QuietProgress {
    fn step_progress(&self, _: &str) {}
    fn lid_temperature(&self, _: &str) {}
    fn plate_temperature(&self, _: &str) {}
    fn time_remaining(&self, _: &str) {}
}

/// Keeps every history handed over at `EndAndGraph`.
#[derive(Default)]
struct RecordingGraph {
    emitted: Mutex<Vec<(String, TemperatureHistory)>>,
}

impl GraphSink for RecordingGraph {
    fn emit(&self, title: &str, history: TemperatureHistory) -> HelixResult<()> {
        if let Ok(mut emitted) = self.emitted.lock() {
            emitted.push((title.to_string(), history));
        }
        Ok(())
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        poll_interval_ms: 1,
        ..EngineConfig::default()
    }
}

fn engine_with(control: RunControl) -> ProtocolEngine {
    ProtocolEngine::new(fast_config(), control, Arc::new(QuietProgress), Arc::new(NullGraphSink))
}

fn timed(plate: f64, hold: f64) -> Step {
    Step::Incubate(Incubation::timed(plate, hold))
}

fn plate_set(target: f64, hold_seconds: Option<f64>) -> Call {
    Call::SetPlateTemperature {
        target,
        hold_seconds,
        well_volume: None,
    }
}

// =============================================================================
// Step ordering
// =============================================================================

#[test]
fn test_steps_repeat_per_cycle_in_order() {
    let plan = ProtocolPlan::new(vec![Stage::new(2, vec![timed(95.0, 30.0), Step::DeactivateAll])]);
    let mut device = MockThermocycler::new().with_polls_per_hold(3);

    let report = engine_with(RunControl::new()).run(&mut device, &plan);
    assert_eq!(report.state, EngineState::Completed);
    assert_eq!(report.steps_executed, 4);
    assert_eq!(report.samples_recorded, 6);

    let poll = [Call::GetLidTemperature, Call::GetPlateInfo];
    let mut expected = Vec::new();
    for _ in 0..2 {
        expected.push(plate_set(95.0, Some(30.0)));
        for _ in 0..3 {
            expected.extend_from_slice(&poll);
        }
        expected.push(Call::DeactivateAll);
    }
    assert_eq!(device.calls(), expected.as_slice());
}

#[test]
fn test_stages_run_in_plan_order() {
    let plan = ProtocolPlan::new(vec![
        Stage::new(1, vec![timed(95.0, 10.0)]),
        Stage::new(3, vec![timed(60.0, 10.0), timed(72.0, 10.0)]),
        Stage::new(1, vec![Step::DeactivateAll]),
    ]);
    let mut device = MockThermocycler::new().with_polls_per_hold(1);

    let report = engine_with(RunControl::new()).run(&mut device, &plan);
    assert!(report.is_success());

    let targets: Vec<f64> = device
        .set_points()
        .iter()
        .filter_map(|call| match call {
            Call::SetPlateTemperature { target, .. } => Some(*target),
            _ => None,
        })
        .collect();
    assert_eq!(targets, vec![95.0, 60.0, 72.0, 60.0, 72.0, 60.0, 72.0]);
    assert_eq!(device.set_points().last(), Some(&Call::DeactivateAll));
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn test_stop_during_hold_takes_effect_within_one_poll() {
    let control = RunControl::new();
    let trigger = control.clone();
    let plan = ProtocolPlan::new(vec![Stage::new(
        1,
        vec![Step::Incubate(Incubation::hold(4.0)), Step::DeactivateAll],
    )]);
    let mut device = MockThermocycler::new().on_plate_poll(move |poll| {
        if poll == 5 {
            trigger.emergency_stop();
        }
    });

    let mut engine = engine_with(control);
    let report = engine.run(&mut device, &plan);

    assert_eq!(report.state, EngineState::Stopped);
    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(report.error.is_none());
    assert!(device.plate_polls() - 5 <= 1);
    assert!(!device.set_points().contains(&Call::DeactivateAll));
}

#[test]
fn test_stop_before_run_touches_nothing() {
    let control = RunControl::new();
    control.emergency_stop();
    let plan = ProtocolPlan::new(vec![Stage::new(1, vec![Step::DeactivateAll])]);
    let mut device = MockThermocycler::new();

    let report = engine_with(control).run(&mut device, &plan);
    assert_eq!(report.state, EngineState::Stopped);
    assert_eq!(report.steps_executed, 0);
    assert!(device.calls().is_empty());
}

#[test]
fn test_stop_between_cycles() {
    let control = RunControl::new();
    let trigger = control.clone();
    let plan = ProtocolPlan::new(vec![Stage::new(5, vec![timed(95.0, 3.0)])]);
    // Three polls per step: the last poll of the second cycle raises the stop.
    let mut device = MockThermocycler::new().on_plate_poll(move |poll| {
        if poll == 6 {
            trigger.emergency_stop();
        }
    });

    let report = engine_with(control).run(&mut device, &plan);
    assert_eq!(report.state, EngineState::Stopped);
    assert_eq!(report.steps_executed, 2);
    assert_eq!(device.plate_polls(), 6);
}

#[test]
fn test_stop_during_failed_query_is_not_lost() {
    let control = RunControl::new();
    let trigger = control.clone();
    let plan = ProtocolPlan::new(vec![Stage::new(1, vec![Step::Incubate(Incubation::hold(4.0))])]);
    let mut device = MockThermocycler::new()
        .on_plate_poll(move |_| trigger.emergency_stop())
        .fail_plate_info_on(1, || HelixError::Transport("device unplugged".into()));

    let report = engine_with(control).run(&mut device, &plan);

    assert_eq!(report.state, EngineState::Stopped);
    assert_eq!(report.steps_skipped, 0);
    assert!(report.error.is_none());
    assert_eq!(device.plate_polls(), 1);
}

#[test]
fn test_stop_wins_over_unresponsive_last_step() {
    let control = RunControl::new();
    let trigger = control.clone();
    let plan = ProtocolPlan::new(vec![Stage::new(
        1,
        vec![Step::DeactivateAll, timed(95.0, 30.0)],
    )]);
    let mut device = MockThermocycler::new()
        .on_plate_poll(move |poll| {
            if poll == 2 {
                trigger.emergency_stop();
            }
        })
        .fail_plate_info_on(2, || HelixError::DeviceUnresponsive {
            query: "M105",
            attempts: 25,
        });

    let report = engine_with(control).run(&mut device, &plan);

    assert_eq!(report.state, EngineState::Stopped);
    assert_eq!(report.steps_executed, 2);
}

#[test]
fn test_stop_raised_during_final_step_is_reported() {
    let control = RunControl::new();
    let trigger = control.clone();
    let plan = ProtocolPlan::new(vec![Stage::new(1, vec![timed(95.0, 3.0)])]);
    // The last poll of the only step finishes the hold and raises the stop.
    let mut device = MockThermocycler::new().on_plate_poll(move |poll| {
        if poll == 3 {
            trigger.emergency_stop();
        }
    });

    let report = engine_with(control).run(&mut device, &plan);
    assert_eq!(report.state, EngineState::Stopped);
    assert_eq!(report.steps_executed, 1);
}

// =============================================================================
// Skip semantics
// =============================================================================

#[test]
#[traced_test]
fn test_transport_error_skips_only_the_current_step() {
    let plan = ProtocolPlan::new(vec![Stage::new(
        1,
        vec![timed(95.0, 30.0), timed(60.0, 30.0), Step::DeactivateAll],
    )]);
    let mut device = MockThermocycler::new()
        .with_polls_per_hold(5)
        .fail_plate_info_on(3, || HelixError::Transport("device unplugged".into()));

    let report = engine_with(RunControl::new()).run(&mut device, &plan);

    assert_eq!(report.state, EngineState::Completed);
    assert_eq!(report.steps_executed, 3);
    assert_eq!(report.steps_skipped, 1);
    assert_eq!(
        device.set_points(),
        vec![plate_set(95.0, Some(30.0)), plate_set(60.0, Some(30.0)), Call::DeactivateAll]
    );
    assert_eq!(device.plate_polls(), 3 + 5);
    assert!(logs_contain("skipping step"));
}

#[test]
fn test_unresponsive_device_skips_step() {
    let plan = ProtocolPlan::new(vec![Stage::new(1, vec![timed(95.0, 30.0), Step::DeactivateAll])]);
    let mut device = MockThermocycler::new().fail_plate_info_on(1, || {
        HelixError::DeviceUnresponsive {
            query: "M105",
            attempts: 25,
        }
    });

    let report = engine_with(RunControl::new()).run(&mut device, &plan);
    assert_eq!(report.state, EngineState::Completed);
    assert_eq!(report.steps_skipped, 1);
    assert_eq!(device.set_points().last(), Some(&Call::DeactivateAll));
}

#[test]
fn test_plan_data_error_faults_the_run() {
    let plan = ProtocolPlan::new(vec![Stage::new(
        1,
        vec![timed(95.0, 30.0), timed(60.0, 30.0), Step::DeactivateAll],
    )]);
    let mut device = MockThermocycler::new()
        .with_polls_per_hold(5)
        .fail_plate_info_on(3, || HelixError::PlanData("hold time 'abc' is not a number".into()));

    let report = engine_with(RunControl::new()).run(&mut device, &plan);

    assert_eq!(report.state, EngineState::Faulted);
    assert_eq!(
        report.error.as_deref(),
        Some("Protocol data error: hold time 'abc' is not a number")
    );
    assert_eq!(device.set_points(), vec![plate_set(95.0, Some(30.0))]);
}

#[test]
fn test_operator_skip_moves_to_next_step() {
    let control = RunControl::new();
    let trigger = control.clone();
    let plan = ProtocolPlan::new(vec![Stage::new(
        1,
        vec![Step::Incubate(Incubation::hold(25.0)), Step::DeactivateAll],
    )]);
    let mut device = MockThermocycler::new().on_plate_poll(move |poll| {
        if poll == 3 {
            trigger.skip_step();
        }
    });

    let report = engine_with(control.clone()).run(&mut device, &plan);
    assert_eq!(report.state, EngineState::Completed);
    assert_eq!(report.steps_skipped, 1);
    assert_eq!(device.plate_polls(), 3);
    assert_eq!(device.set_points().last(), Some(&Call::DeactivateAll));
    assert!(!control.take_skip(), "skip request must be consumed");
}

#[test]
fn test_skip_during_timed_step() {
    let control = RunControl::new();
    let trigger = control.clone();
    let plan = ProtocolPlan::new(vec![Stage::new(1, vec![timed(95.0, 100.0), timed(4.0, 10.0)])]);
    let mut device = MockThermocycler::new()
        .with_polls_per_hold(10)
        .on_plate_poll(move |poll| {
            if poll == 2 {
                trigger.skip_step();
            }
        });

    let report = engine_with(control).run(&mut device, &plan);
    assert!(report.is_success());
    assert_eq!(report.steps_skipped, 1);
    assert_eq!(device.plate_polls(), 2 + 10);
}

// =============================================================================
// EndAndGraph
// =============================================================================

#[test]
fn test_end_and_graph_without_history_is_plan_error() {
    let plan = ProtocolPlan::new(vec![Stage::new(1, vec![Step::DeactivateAll, Step::EndAndGraph])]);
    let mut device = MockThermocycler::new();

    let report = engine_with(RunControl::new()).run(&mut device, &plan);
    assert_eq!(report.state, EngineState::Faulted);
    assert!(report.error.unwrap().contains("END&GRAPH"));
    assert_eq!(device.calls(), &[Call::DeactivateAll]);
}

#[test]
fn test_end_and_graph_hands_over_history_then_holds() {
    let control = RunControl::new();
    let trigger = control.clone();
    let graph = Arc::new(RecordingGraph::default());
    let plan = ProtocolPlan::new(vec![
        Stage::new(1, vec![timed(95.0, 30.0)]),
        Stage::new(1, vec![timed(72.0, 30.0), Step::EndAndGraph]),
    ]);
    let mut device = MockThermocycler::new()
        .with_polls_per_hold(3)
        .on_plate_poll(move |poll| {
            if poll == 8 {
                trigger.emergency_stop();
            }
        });

    let progress = Arc::new(QuietProgress);
    let mut engine =
        ProtocolEngine::new(fast_config(), control, progress, graph.clone()).with_title("PCR");
    let report = engine.run(&mut device, &plan);

    assert_eq!(report.state, EngineState::Stopped);
    assert_eq!(report.samples_recorded, 6);

    let emitted = graph.emitted.lock().unwrap();
    assert_eq!(emitted.len(), 1);
    let (title, history) = &emitted[0];
    assert_eq!(title, "PCR");
    assert_eq!(history.len(), 6);
    assert_eq!(history.latest().map(|s| s.plate_celsius), Some(72.0));
    assert_eq!(history.latest().map(|s| s.hold_seconds), Some(30.0));
    assert!(history
        .samples()
        .windows(2)
        .all(|pair| pair[0].elapsed_minutes <= pair[1].elapsed_minutes));

    assert_eq!(device.set_points().last(), Some(&plate_set(72.0, None)));
}

// =============================================================================
// Preconditions
// =============================================================================

#[test]
fn test_invalid_plan_faults_before_any_command() {
    let plan = ProtocolPlan::new(vec![Stage::new(0, vec![Step::DeactivateAll])]);
    let mut device = MockThermocycler::new();

    let report = engine_with(RunControl::new()).run(&mut device, &plan);
    assert_eq!(report.state, EngineState::Faulted);
    assert!(device.calls().is_empty());
}

#[test]
fn test_engine_runs_behind_trait_object() {
    let plan = ProtocolPlan::new(vec![Stage::new(1, vec![timed(37.0, 3.0)])]);
    let mut device: Box<dyn helix_cycler::hardware::Thermocycler> =
        Box::new(MockThermocycler::new());

    let report = engine_with(RunControl::new()).run(device.as_mut(), &plan);
    assert!(report.is_success());
    assert_eq!(report.samples_recorded, 3);
}
