//! Thermocycler capability seam
//!
//! The protocol engine and the temperature monitor only need a handful of device operations.
//! They are expressed as the [`Thermocycler`] trait so the engine can drive the real
//! [`HardwareSession`](crate::hardware::session::HardwareSession), the in-process simulator,
//! or a recording mock in tests.
//!
//! # Contract
//! - Set-point methods are fire-and-forget: they return once the command is written and never
//!   wait for the device to reach the target.
//! - Query methods return a typed reading or an error; transport-class errors
//!   (`HelixError::is_transport`) mean the link failed, anything else means the data was bad.
//! - Implementations are `Send` so a run can execute on a worker thread.

use crate::error::HelixResult;
use crate::hardware::telemetry::PlateReading;

/// Device operations used by the protocol engine.
pub trait Thermocycler: Send {
    /// Whether a live connection is held.
    fn is_connected(&self) -> bool;

    /// Set the heated lid target (°C).
    fn set_lid_temperature(&mut self, target: f64) -> HelixResult<()>;

    /// Set the plate target (°C), optionally with a hold time (s) and well volume (µL).
    fn set_plate_temperature(
        &mut self,
        target: f64,
        hold_seconds: Option<f64>,
        well_volume: Option<f64>,
    ) -> HelixResult<()>;

    /// Current lid temperature (°C).
    fn get_lid_temperature(&mut self) -> HelixResult<f64>;

    /// Current plate temperature and the device's remaining hold time.
    fn get_plate_info(&mut self) -> HelixResult<PlateReading>;

    /// Switch off every heater and motor.
    fn deactivate_all(&mut self) -> HelixResult<()>;
}

impl<T: Thermocycler + ?Sized> Thermocycler for Box<T> {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn set_lid_temperature(&mut self, target: f64) -> HelixResult<()> {
        (**self).set_lid_temperature(target)
    }

    fn set_plate_temperature(
        &mut self,
        target: f64,
        hold_seconds: Option<f64>,
        well_volume: Option<f64>,
    ) -> HelixResult<()> {
        (**self).set_plate_temperature(target, hold_seconds, well_volume)
    }

    fn get_lid_temperature(&mut self) -> HelixResult<f64> {
        (**self).get_lid_temperature()
    }

    fn get_plate_info(&mut self) -> HelixResult<PlateReading> {
        (**self).get_plate_info()
    }

    fn deactivate_all(&mut self) -> HelixResult<()> {
        (**self).deactivate_all()
    }
}
