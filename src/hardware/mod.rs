//! Thermocycler hardware layer
//!
//! - `commands`: the closed wire command catalog and line framing
//! - `transport`: byte-level link (serial port) behind the
//!   [`Transport`](transport::Transport) trait
//! - `telemetry`: reply classification and the bounded query/retry loop
//! - `session`: [`HardwareSession`], the single owner of the live link
//! - `capabilities`: the [`Thermocycler`](capabilities::Thermocycler) seam used by the engine
//! - `simulator`: an in-process device speaking the wire protocol
//! - `mock`: deterministic test doubles

pub mod capabilities;
pub mod commands;
pub mod mock;
pub mod session;
pub mod simulator;
pub mod telemetry;
pub mod transport;

pub use capabilities::Thermocycler;
pub use session::{HardwareSession, SharedSession};
pub use simulator::SimulatedThermocycler;
