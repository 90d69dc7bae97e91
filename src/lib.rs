//! # Helix Cycler Core Library
//!
//! Control of a laboratory thermocycler / heater-shaker over a serial link: a textual
//! command/response exchange with the embedded controller, a telemetry parser that tolerates a
//! noisy half-duplex line stream, and a protocol engine that walks a stage/cycle/step plan with
//! cooperative cancellation and per-step fault recovery.
//!
//! ## Crate Structure
//!
//! - **`config`**: layered `Settings` (defaults, TOML file, `HELIX_` environment) via `figment`.
//! - **`error`**: the `HelixError` taxonomy shared by every module.
//! - **`logging`**: `tracing-subscriber` setup in pretty, compact or JSON form.
//! - **`hardware`**: command catalog, serial transport, telemetry parser, the `HardwareSession`
//!   and the `Thermocycler` capability trait, plus a simulated device and test doubles.
//! - **`protocol`**: plan model, CSV loader, the `ProtocolEngine`, run control flags and the
//!   progress/graph sinks.
//! - **`monitor`**: background temperature polling while no run is active.
//! - **`orchestrator`**: owns the shared session and keeps runs, the monitor and manual
//!   operations from using it at the same time.
//!
//! ```text
//! ProtocolPlan + RunControl ──> ProtocolEngine ──> Thermocycler (HardwareSession)
//!                                    │                     │
//!                                    ▼                     ▼
//!                       ProgressSink / GraphSink      Transport (serial / simulator)
//! ```

pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod monitor;
pub mod orchestrator;
pub mod protocol;

pub use error::{HelixError, HelixResult};
