//! CSV protocol files.
//!
//! Four record kinds, one per line, no header:
//!
//! ```text
//! CYCLES,30                 open a new stage repeated 30 times
//! STEP,1,95,15,105          plate 95 °C, hold 15 s, lid 105 °C (second column unused)
//! STEP,2,60,,               plate 60 °C, indefinite hold, lid unchanged
//! DEACTIVATE_ALL
//! END&GRAPH
//! ```
//!
//! Only the shape is checked: numbers must parse and every step must belong to a stage.
//! Unknown record kinds are logged and skipped.

use crate::error::{HelixError, HelixResult};
use crate::protocol::plan::{Incubation, ProtocolPlan, Stage, Step};
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

const CYCLES: &str = "CYCLES";
const STEP: &str = "STEP";
const DEACTIVATE_ALL: &str = "DEACTIVATE_ALL";
const END_AND_GRAPH: &str = "END&GRAPH";

/// Load and validate a protocol file.
pub fn load_protocol<P: AsRef<Path>>(path: P) -> HelixResult<ProtocolPlan> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)?;
    let plan = parse_protocol(file)?;
    debug!(
        path = %path.display(),
        stages = plan.stages.len(),
        steps = plan.total_steps(),
        "Protocol loaded"
    );
    Ok(plan)
}

/// Parse protocol records from any reader.
pub fn parse_protocol<R: Read>(input: R) -> HelixResult<ProtocolPlan> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input);

    let mut stages: Vec<Stage> = Vec::new();
    for result in reader.records() {
        let record = result?;
        let line = record.position().map_or(0, |pos| pos.line());
        let kind = record.get(0).unwrap_or("");

        match kind {
            "" => continue,
            CYCLES => {
                let cycles = record
                    .get(1)
                    .and_then(|field| field.parse::<u32>().ok())
                    .filter(|cycles| *cycles > 0)
                    .ok_or_else(|| {
                        HelixError::PlanData(format!(
                            "line {}: CYCLES needs a positive whole number",
                            line
                        ))
                    })?;
                stages.push(Stage::new(cycles, Vec::new()));
            }
            STEP => {
                let plate_temp = required_number(&record, 2, "plate temperature", line)?;
                let hold_seconds = optional_number(&record, 3, "hold time", line)?;
                let lid_temp = optional_number(&record, 4, "lid temperature", line)?;
                current_stage(&mut stages, kind, line)?.steps.push(Step::Incubate(Incubation {
                    plate_temp,
                    hold_seconds,
                    lid_temp,
                }));
            }
            DEACTIVATE_ALL => {
                current_stage(&mut stages, kind, line)?.steps.push(Step::DeactivateAll)
            }
            END_AND_GRAPH => current_stage(&mut stages, kind, line)?.steps.push(Step::EndAndGraph),
            other => warn!(line, record = other, "Ignoring unknown protocol record"),
        }
    }

    let plan = ProtocolPlan::new(stages);
    plan.validate()?;
    Ok(plan)
}

fn current_stage<'a>(stages: &'a mut [Stage], kind: &str, line: u64) -> HelixResult<&'a mut Stage> {
    stages.last_mut().ok_or_else(|| {
        HelixError::PlanData(format!("line {}: {} appears before any CYCLES record", line, kind))
    })
}

fn required_number(
    record: &csv::StringRecord,
    index: usize,
    what: &str,
    line: u64,
) -> HelixResult<f64> {
    optional_number(record, index, what, line)?
        .ok_or_else(|| HelixError::PlanData(format!("line {}: missing {}", line, what)))
}

fn optional_number(
    record: &csv::StringRecord,
    index: usize,
    what: &str,
    line: u64,
) -> HelixResult<Option<f64>> {
    match record.get(index) {
        None | Some("") => Ok(None),
        Some(field) => field.parse::<f64>().map(Some).map_err(|_| {
            HelixError::PlanData(format!("line {}: {} '{}' is not a number", line, what, field))
        }),
    }
}
