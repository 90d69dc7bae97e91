//! Protocol plan data model.
//!
//! A plan is an ordered list of stages. Each stage repeats its steps `cycles` times:
//!
//! ```text
//! ProtocolPlan
//!   └── Stage 1 (cycles = 1)   Incubate 95 °C / 180 s
//!   └── Stage 2 (cycles = 30)  Incubate 95 °C / 15 s, 60 °C / 30 s, 72 °C / 30 s
//!   └── Stage 3 (cycles = 1)   DeactivateAll, EndAndGraph
//! ```
//!
//! Plans are produced by [`loader`](crate::protocol::loader) (or built directly) and are read-only
//! once handed to the engine. Stage numbers are 1-based positions in `stages`.

use crate::error::{HelixError, HelixResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A temperature/time incubation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Incubation {
    /// Plate target in °C.
    pub plate_temp: f64,
    /// Hold time in seconds. `None` holds indefinitely.
    pub hold_seconds: Option<f64>,
    /// Lid target in °C, set before the plate when present.
    pub lid_temp: Option<f64>,
}

impl Incubation {
    pub fn timed(plate_temp: f64, hold_seconds: f64) -> Self {
        Self {
            plate_temp,
            hold_seconds: Some(hold_seconds),
            lid_temp: None,
        }
    }

    pub fn hold(plate_temp: f64) -> Self {
        Self {
            plate_temp,
            hold_seconds: None,
            lid_temp: None,
        }
    }

    pub fn with_lid(mut self, lid_temp: f64) -> Self {
        self.lid_temp = Some(lid_temp);
        self
    }
}

/// One entry in a stage's step list.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    Incubate(Incubation),
    DeactivateAll,
    /// Hand the recorded history to the graph sink, then hold at the last plate temperature.
    EndAndGraph,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Incubate(inc) => {
                write!(f, "Incubate {} °C", inc.plate_temp)?;
                match inc.hold_seconds {
                    Some(hold) => write!(f, " for {} s", hold)?,
                    None => write!(f, " (hold)")?,
                }
                if let Some(lid) = inc.lid_temp {
                    write!(f, ", lid {} °C", lid)?;
                }
                Ok(())
            }
            Step::DeactivateAll => write!(f, "Deactivate All"),
            Step::EndAndGraph => write!(f, "End Protocol"),
        }
    }
}

/// A group of steps repeated `cycles` times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub cycles: u32,
    pub steps: Vec<Step>,
}

impl Stage {
    pub fn new(cycles: u32, steps: Vec<Step>) -> Self {
        Self { cycles, steps }
    }
}

/// The full stage → cycle → step plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolPlan {
    pub stages: Vec<Stage>,
}

impl ProtocolPlan {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Number of steps executed by a complete run, counting every cycle repetition.
    pub fn total_steps(&self) -> u64 {
        self.stages
            .iter()
            .map(|stage| u64::from(stage.cycles) * stage.steps.len() as u64)
            .sum()
    }

    /// Check the shape invariants: every stage has at least one cycle and one step, and
    /// every temperature and hold time is a finite number (holds also non-negative).
    pub fn validate(&self) -> HelixResult<()> {
        for (index, stage) in self.stages.iter().enumerate() {
            let number = index + 1;
            if stage.cycles == 0 {
                return Err(HelixError::PlanData(format!(
                    "stage {} has a cycle count of 0",
                    number
                )));
            }
            if stage.steps.is_empty() {
                return Err(HelixError::PlanData(format!("stage {} has no steps", number)));
            }
            for (step_index, step) in stage.steps.iter().enumerate() {
                if let Step::Incubate(inc) = step {
                    let bad_temp = !inc.plate_temp.is_finite()
                        || inc.lid_temp.is_some_and(|lid| !lid.is_finite());
                    let bad_hold = inc
                        .hold_seconds
                        .is_some_and(|hold| !hold.is_finite() || hold < 0.0);
                    if bad_temp || bad_hold {
                        return Err(HelixError::PlanData(format!(
                            "stage {} step {}: invalid incubation values",
                            number,
                            step_index + 1
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Human-readable stage/step table.
    ///
    /// ```text
    /// Stage 1 - Cycles 30
    ///   Step  Plate (°C)  Time (s)  Lid (°C)
    ///   1     95          15        105
    ///   2     60          Hold
    ///   3     Deactivate All
    /// ```
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for (index, stage) in self.stages.iter().enumerate() {
            if index > 0 {
                out.push('\n');
            }
            out.push_str(&format!("Stage {} - Cycles {}\n", index + 1, stage.cycles));
            out.push_str("  Step  Plate (°C)  Time (s)  Lid (°C)\n");
            for (step_index, step) in stage.steps.iter().enumerate() {
                let number = step_index + 1;
                let row = match step {
                    Step::Incubate(inc) => {
                        let time = inc
                            .hold_seconds
                            .map_or_else(|| "Hold".to_string(), |hold| hold.to_string());
                        let lid = inc.lid_temp.map_or_else(String::new, |lid| lid.to_string());
                        format!("{:<5} {:<11} {:<9} {}", number, inc.plate_temp, time, lid)
                    }
                    Step::DeactivateAll => format!("{:<5} Deactivate All", number),
                    Step::EndAndGraph => format!("{:<5} End Protocol", number),
                };
                out.push_str("  ");
                out.push_str(row.trim_end());
                out.push('\n');
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcr() -> ProtocolPlan {
        ProtocolPlan::new(vec![
            Stage::new(1, vec![Step::Incubate(Incubation::timed(95.0, 180.0).with_lid(105.0))]),
            Stage::new(
                30,
                vec![
                    Step::Incubate(Incubation::timed(95.0, 15.0)),
                    Step::Incubate(Incubation::timed(60.0, 30.0)),
                    Step::Incubate(Incubation::timed(72.0, 30.0)),
                ],
            ),
            Stage::new(1, vec![Step::DeactivateAll, Step::EndAndGraph]),
        ])
    }

    fn single_step(step: Incubation) -> ProtocolPlan {
        ProtocolPlan::new(vec![Stage::new(1, vec![Step::Incubate(step)])])
    }

    #[test]
    fn counts_steps_across_cycles() {
        assert_eq!(pcr().total_steps(), 1 + 90 + 2);
        assert_eq!(ProtocolPlan::default().total_steps(), 0);
    }

    #[test]
    fn empty_plan_is_valid() {
        assert!(ProtocolPlan::default().validate().is_ok());
        assert!(pcr().validate().is_ok());
    }

    #[test]
    fn rejects_shape_violations() {
        let zero_cycles = ProtocolPlan::new(vec![Stage::new(0, vec![Step::DeactivateAll])]);
        assert!(zero_cycles.validate().unwrap_err().is_plan_data());

        let no_steps = ProtocolPlan::new(vec![Stage::new(2, vec![])]);
        assert!(no_steps.validate().unwrap_err().is_plan_data());

        let negative_hold = single_step(Incubation::timed(95.0, -1.0));
        assert!(negative_hold.validate().is_err());

        let nan_temp = single_step(Incubation::hold(f64::NAN));
        assert!(nan_temp.validate().is_err());
    }

    #[test]
    fn summary_lists_every_stage() {
        let summary = pcr().summary();
        assert!(summary.contains("Stage 1 - Cycles 1"));
        assert!(summary.contains("Stage 2 - Cycles 30"));
        assert!(summary.contains("Deactivate All"));
        assert!(summary.contains("End Protocol"));
        assert!(summary.contains("105"));
    }

    #[test]
    fn hold_steps_show_hold() {
        let plan = single_step(Incubation::hold(4.0));
        assert!(plan.summary().contains("Hold"));
        assert_eq!(Step::Incubate(Incubation::hold(4.0)).to_string(), "Incubate 4 °C (hold)");
    }

    #[test]
    fn serializes_with_step_kind_tag() {
        let json = serde_json::to_string(&Step::DeactivateAll).unwrap();
        assert_eq!(json, r#"{"kind":"deactivate_all"}"#);
        let json = serde_json::to_string(&pcr()).unwrap();
        let plan: ProtocolPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(plan, pcr());
    }
}
