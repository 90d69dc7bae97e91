//! Protocol plans and their execution.
//!
//! - `plan`: the stage → cycle → step data model
//! - `loader`: CSV protocol files into plans
//! - `engine`: runs a plan against a thermocycler
//! - `control`: stop/skip flags shared with operators
//! - `sink`: progress and graph observers
//! - `state`: engine states, run reports, temperature history

pub mod control;
pub mod engine;
pub mod loader;
pub mod plan;
pub mod sink;
pub mod state;

pub use control::RunControl;
pub use engine::ProtocolEngine;
pub use loader::{load_protocol, parse_protocol};
pub use plan::{Incubation, ProtocolPlan, Stage, Step};
pub use sink::{
    ChannelProgressSink, CsvGraphSink, GraphSink, NullGraphSink, ProgressSink, ProgressUpdate,
    TracingProgressSink,
};
pub use state::{EngineState, RunReport, TemperatureHistory, TemperatureSample};
