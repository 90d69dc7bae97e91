//! Thermocycler command catalog
//!
//! Protocol Overview:
//! - Format: ASCII G-code style lines over USB serial
//! - Baud: 115200, 8N1
//! - Framing: every command is bracketed by CRLF, `\r\n<TOKEN>[ <arg>...]\r\n`
//! - Temperature queries (`M105`, `M141`) answer with a `T... C:<temp>[ H:<time>]` line
//!
//! The catalog is closed: every command the controller knows is a variant of [`Command`],
//! so an unknown command is a compile error rather than a runtime condition.

use std::fmt;

/// Line terminator used on both sides of every outbound command.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Every command understood by the device firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    OpenLid,
    CloseLid,
    GetLidStatus,
    SetLidTemp,
    GetLidTemp,
    EditPidParams,
    SetPlateTemp,
    GetPlateTemp,
    SetRampRate,
    DeactivateAll,
    DeactivateHeating,
    SetShakeSpeed,
    GetShakeSpeed,
    DeactivateShake,
    OpenLatch,
    CloseLatch,
    DeactivateLid,
    DeactivateBlock,
    DeviceInfo,
    EnterProgramming,
    EnterDebugMode,
    ExitDebug,
}

impl Command {
    /// All catalog entries, in firmware documentation order.
    pub const ALL: [Command; 22] = [
        Command::OpenLid,
        Command::CloseLid,
        Command::GetLidStatus,
        Command::SetLidTemp,
        Command::GetLidTemp,
        Command::EditPidParams,
        Command::SetPlateTemp,
        Command::GetPlateTemp,
        Command::SetRampRate,
        Command::DeactivateAll,
        Command::DeactivateHeating,
        Command::SetShakeSpeed,
        Command::GetShakeSpeed,
        Command::DeactivateShake,
        Command::OpenLatch,
        Command::CloseLatch,
        Command::DeactivateLid,
        Command::DeactivateBlock,
        Command::DeviceInfo,
        Command::EnterProgramming,
        Command::EnterDebugMode,
        Command::ExitDebug,
    ];

    /// The wire token the firmware expects for this command.
    pub const fn wire_token(self) -> &'static str {
        match self {
            Command::OpenLid => "M126",
            Command::CloseLid => "M127",
            Command::GetLidStatus => "M119",
            Command::SetLidTemp => "M140",
            Command::GetLidTemp => "M141",
            Command::EditPidParams => "M301",
            Command::SetPlateTemp => "M104",
            Command::GetPlateTemp => "M105",
            Command::SetRampRate => "M566",
            Command::DeactivateAll => "M18",
            Command::DeactivateHeating => "M106",
            Command::SetShakeSpeed => "M3",
            Command::GetShakeSpeed => "M123",
            Command::DeactivateShake => "G28",
            Command::OpenLatch => "M242",
            Command::CloseLatch => "M243",
            Command::DeactivateLid => "M108",
            Command::DeactivateBlock => "M14",
            Command::DeviceInfo => "M115",
            Command::EnterProgramming => "dfu",
            Command::EnterDebugMode => "M111",
            Command::ExitDebug => "M111 S0",
        }
    }

    /// Look a command up by its wire token.
    pub fn from_wire_token(token: &str) -> Option<Command> {
        Command::ALL
            .iter()
            .copied()
            .find(|command| command.wire_token() == token)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_token())
    }
}

/// Frame a command and its argument string as one outbound line.
///
/// `extra` is appended verbatim and must carry its own leading space,
/// e.g. `encode(Command::SetPlateTemp, " S95.0 H30.0")`.
pub fn encode(command: Command, extra: &str) -> String {
    format!(
        "{LINE_TERMINATOR}{}{}{LINE_TERMINATOR}",
        command.wire_token(),
        extra
    )
}

/// Render a numeric argument the way the firmware has always received it:
/// integral values keep one fractional digit (`95.0`), others print in shortest form.
pub fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn encodes_set_plate_with_arguments() {
        let line = encode(Command::SetPlateTemp, " S95.0 H30 V50");
        assert_eq!(line, "\r\nM104 S95.0 H30 V50\r\n");
    }

    #[test]
    fn encodes_bare_command() {
        assert_eq!(encode(Command::DeactivateAll, ""), "\r\nM18\r\n");
        assert_eq!(encode(Command::ExitDebug, ""), "\r\nM111 S0\r\n");
    }

    #[test]
    fn tokens_are_unique_and_resolvable() {
        let tokens: HashSet<_> = Command::ALL.iter().map(|c| c.wire_token()).collect();
        assert_eq!(tokens.len(), Command::ALL.len());

        for command in Command::ALL {
            assert_eq!(Command::from_wire_token(command.wire_token()), Some(command));
        }
        assert_eq!(Command::from_wire_token("M999"), None);
    }

    #[test]
    fn numbers_keep_a_fractional_digit() {
        assert_eq!(format_number(95.0), "95.0");
        assert_eq!(format_number(30.0), "30.0");
        assert_eq!(format_number(72.5), "72.5");
        assert_eq!(format_number(0.25), "0.25");
        assert_eq!(format_number(-4.0), "-4.0");
    }
}
