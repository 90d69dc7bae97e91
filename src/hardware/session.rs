//! Hardware session for the thermocycler / heater-shaker controller.
//!
//! `HardwareSession` is the only owner of the live transport. It composes the transport, the
//! command catalog and the telemetry reader into named device operations. Set-point commands
//! are fire-and-forget; temperature queries go through the bounded retry loop of
//! [`TelemetryReader`].
//!
//! # Example
//!
//! ```no_run
//! use helix_cycler::config::Settings;
//! use helix_cycler::hardware::HardwareSession;
//!
//! # fn main() -> Result<(), helix_cycler::error::HelixError> {
//! let mut session = HardwareSession::new(&Settings::default());
//! session.connect("/dev/ttyACM0")?;
//!
//! session.close_lid()?;
//! session.set_lid_temperature(105.0)?;
//! session.set_plate_temperature(95.0, Some(30.0), None)?;
//!
//! let plate = session.get_plate_info()?;
//! println!("{} °C, {} s left", plate.temperature_celsius, plate.seconds_remaining);
//!
//! session.deactivate_all()?;
//! session.disconnect();
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use crate::error::{HelixError, HelixResult};
use crate::hardware::capabilities::Thermocycler;
use crate::hardware::commands::{encode, format_number, Command};
use crate::hardware::telemetry::{PlateReading, TelemetryReader};
use crate::hardware::transport::{self, SerialTransport, Transport};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// A session shared between the run worker, the monitor and manual controls.
pub type SharedSession = Arc<Mutex<HardwareSession>>;

/// Session with a single thermocycler over one transport.
pub struct HardwareSession {
    transport: Option<Box<dyn Transport>>,
    telemetry: TelemetryReader,
    baud_rate: u32,
    timeout: Duration,
}

impl HardwareSession {
    /// Create a disconnected session.
    pub fn new(settings: &Settings) -> Self {
        Self {
            transport: None,
            telemetry: TelemetryReader::new(
                settings.telemetry.max_attempts,
                settings.serial.timeout(),
            )
            .with_max_wait(settings.telemetry.max_wait()),
            baud_rate: settings.serial.baud_rate,
            timeout: settings.serial.timeout(),
        }
    }

    /// Candidate serial device paths; empty when none are present.
    pub fn get_available_ports() -> Vec<String> {
        transport::available_ports()
    }

    /// Open `port_name` and take ownership of the handle.
    ///
    /// Any previous connection is closed first. On failure the session stays disconnected.
    pub fn connect(&mut self, port_name: &str) -> HelixResult<()> {
        self.disconnect();
        let serial = SerialTransport::open(port_name, self.baud_rate, self.timeout)?;
        info!(port = port_name, "Connected to thermocycler");
        self.transport = Some(Box::new(serial));
        Ok(())
    }

    /// Use an already open transport (simulator, test double).
    pub fn attach(&mut self, transport: Box<dyn Transport>) {
        self.disconnect();
        info!(transport = %transport.describe(), "Transport attached");
        self.transport = Some(transport);
    }

    /// Release the handle. Safe to call any number of times.
    pub fn disconnect(&mut self) {
        if let Some(transport) = self.transport.take() {
            info!(transport = %transport.describe(), "Disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn into_shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    fn transport(&mut self) -> HelixResult<&mut Box<dyn Transport>> {
        self.transport.as_mut().ok_or(HelixError::NotConnected)
    }

    /// Send a command without waiting for any reply.
    fn command(&mut self, command: Command, extra: &str) -> HelixResult<()> {
        debug!(command = command.wire_token(), args = extra, "Sending");
        let line = encode(command, extra);
        self.transport()?.write(&line)
    }

    pub fn open_lid(&mut self) -> HelixResult<()> {
        self.command(Command::OpenLid, "")
    }

    pub fn close_lid(&mut self) -> HelixResult<()> {
        self.command(Command::CloseLid, "")
    }

    pub fn get_lid_temperature(&mut self) -> HelixResult<f64> {
        let transport = self.transport.as_mut().ok_or(HelixError::NotConnected)?;
        Ok(self.telemetry.read_lid(transport.as_mut())?.temperature_celsius)
    }

    pub fn get_plate_info(&mut self) -> HelixResult<PlateReading> {
        let transport = self.transport.as_mut().ok_or(HelixError::NotConnected)?;
        self.telemetry.read_plate(transport.as_mut())
    }

    /// Set the lid target. Does not wait for the lid to get there.
    pub fn set_lid_temperature(&mut self, target: f64) -> HelixResult<()> {
        self.command(Command::SetLidTemp, &format!(" S{}", format_number(target)))
    }

    /// Set the plate target; `H<seconds>` and `V<volume>` are only sent when given.
    pub fn set_plate_temperature(
        &mut self,
        target: f64,
        hold_seconds: Option<f64>,
        well_volume: Option<f64>,
    ) -> HelixResult<()> {
        let mut args = format!(" S{}", format_number(target));
        if let Some(hold) = hold_seconds {
            args.push_str(&format!(" H{}", format_number(hold)));
        }
        if let Some(volume) = well_volume {
            args.push_str(&format!(" V{}", format_number(volume)));
        }
        self.command(Command::SetPlateTemp, &args)
    }

    pub fn deactivate_all(&mut self) -> HelixResult<()> {
        self.command(Command::DeactivateAll, "")
    }

    pub fn deactivate_plate(&mut self) -> HelixResult<()> {
        self.command(Command::DeactivateBlock, "")
    }

    pub fn deactivate_lid(&mut self) -> HelixResult<()> {
        self.command(Command::DeactivateLid, "")
    }

    /// Stop the shaker motor and its heater.
    pub fn deactivate_shaker(&mut self) -> HelixResult<()> {
        self.command(Command::DeactivateShake, "")?;
        self.command(Command::DeactivateHeating, "")
    }

    pub fn open_latch(&mut self) -> HelixResult<()> {
        self.command(Command::OpenLatch, "")
    }

    pub fn close_latch(&mut self) -> HelixResult<()> {
        self.command(Command::CloseLatch, "")
    }

    pub fn set_shake_speed(&mut self, rpm: u32) -> HelixResult<()> {
        self.command(Command::SetShakeSpeed, &format!(" S{}", rpm))
    }
}

impl Thermocycler for HardwareSession {
    fn is_connected(&self) -> bool {
        HardwareSession::is_connected(self)
    }

    fn set_lid_temperature(&mut self, target: f64) -> HelixResult<()> {
        HardwareSession::set_lid_temperature(self, target)
    }

    fn set_plate_temperature(
        &mut self,
        target: f64,
        hold_seconds: Option<f64>,
        well_volume: Option<f64>,
    ) -> HelixResult<()> {
        HardwareSession::set_plate_temperature(self, target, hold_seconds, well_volume)
    }

    fn get_lid_temperature(&mut self) -> HelixResult<f64> {
        HardwareSession::get_lid_temperature(self)
    }

    fn get_plate_info(&mut self) -> HelixResult<PlateReading> {
        HardwareSession::get_plate_info(self)
    }

    fn deactivate_all(&mut self) -> HelixResult<()> {
        HardwareSession::deactivate_all(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::ScriptedTransport;

    fn attached(transport: &ScriptedTransport) -> HardwareSession {
        let mut session = HardwareSession::new(&Settings::default());
        session.attach(Box::new(transport.clone()));
        session
    }

    #[test]
    fn starts_disconnected() {
        let mut session = HardwareSession::new(&Settings::default());
        assert!(!session.is_connected());
        assert!(matches!(session.open_lid(), Err(HelixError::NotConnected)));
        assert!(matches!(
            session.get_lid_temperature(),
            Err(HelixError::NotConnected)
        ));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let transport = ScriptedTransport::new(Vec::<String>::new());
        let mut session = attached(&transport);
        assert!(session.is_connected());

        session.disconnect();
        session.disconnect();
        assert!(!session.is_connected());
    }

    #[test]
    fn failed_connect_leaves_session_disconnected() {
        let mut session = HardwareSession::new(&Settings::default());
        let err = session.connect("/dev/helix-missing").unwrap_err();
        assert!(matches!(err, HelixError::Connect { .. }));
        assert!(!session.is_connected());
    }

    #[test]
    fn set_plate_appends_only_given_arguments() {
        let transport = ScriptedTransport::new(Vec::<String>::new());
        let mut session = attached(&transport);

        session.set_plate_temperature(95.0, None, None).unwrap();
        session.set_plate_temperature(95.0, Some(30.0), None).unwrap();
        session.set_plate_temperature(72.5, Some(30.0), Some(50.0)).unwrap();
        session.set_plate_temperature(4.0, None, Some(20.0)).unwrap();

        assert_eq!(
            transport.written(),
            vec![
                "\r\nM104 S95.0\r\n",
                "\r\nM104 S95.0 H30.0\r\n",
                "\r\nM104 S72.5 H30.0 V50.0\r\n",
                "\r\nM104 S4.0 V20.0\r\n",
            ]
        );
    }

    #[test]
    fn fire_and_forget_commands_use_catalog_tokens() {
        let transport = ScriptedTransport::new(Vec::<String>::new());
        let mut session = attached(&transport);

        session.open_lid().unwrap();
        session.close_lid().unwrap();
        session.set_lid_temperature(105.0).unwrap();
        session.deactivate_all().unwrap();
        session.deactivate_plate().unwrap();
        session.deactivate_lid().unwrap();
        session.deactivate_shaker().unwrap();
        session.open_latch().unwrap();
        session.close_latch().unwrap();
        session.set_shake_speed(1200).unwrap();

        assert_eq!(
            transport.written(),
            vec![
                "\r\nM126\r\n",
                "\r\nM127\r\n",
                "\r\nM140 S105.0\r\n",
                "\r\nM18\r\n",
                "\r\nM14\r\n",
                "\r\nM108\r\n",
                "\r\nG28\r\n",
                "\r\nM106\r\n",
                "\r\nM242\r\n",
                "\r\nM243\r\n",
                "\r\nM3 S1200\r\n",
            ]
        );
    }

    #[test]
    fn reads_telemetry_through_parser() {
        let transport = ScriptedTransport::new([
            "T:105.0 C:99.5\r\n",
            "\r\n",
            "T:95.0 C:94.25 H:17.3\r\n",
        ]);
        let mut session = attached(&transport);

        assert_eq!(session.get_lid_temperature().unwrap(), 99.5);
        let plate = session.get_plate_info().unwrap();
        assert_eq!(plate.temperature_celsius, 94.25);
        assert_eq!(plate.seconds_remaining.as_seconds().unwrap(), 17.3);
    }

    #[test]
    fn write_failure_surfaces_as_transport_error() {
        let transport = ScriptedTransport::new(Vec::<String>::new()).fail_writes();
        let mut session = attached(&transport);
        let err = session.deactivate_all().unwrap_err();
        assert!(err.is_transport());
    }
}
