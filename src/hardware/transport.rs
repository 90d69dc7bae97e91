//! Line-oriented serial transport.
//!
//! The transport owns the byte stream and nothing else: it writes fully framed command
//! strings, hands back one decoded line at a time, and can discard unread input. It has no
//! knowledge of what the commands mean.

use crate::error::{HelixError, HelixResult};
use serialport::{ClearBuffer, SerialPort};
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Fixed link speed of the thermocycler firmware.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// A half-duplex, newline-terminated text link to the device.
pub trait Transport: Send {
    /// Write one fully formed command string.
    fn write(&mut self, data: &str) -> HelixResult<()>;

    /// Read the next line, waiting at most `timeout`.
    ///
    /// `Ok("")` means nothing arrived in time (or a blank keep-alive line). Callers treat that
    /// as "try again", not as a failure. Undecodable bytes are replaced, never rejected.
    fn read_line(&mut self, timeout: Duration) -> HelixResult<String>;

    /// Discard any bytes received but not yet read.
    fn reset_input_buffer(&mut self) -> HelixResult<()>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String {
        "transport".to_string()
    }
}

/// [`Transport`] over a real serial port.
pub struct SerialTransport {
    port_name: String,
    port: Box<dyn SerialPort>,
    /// Bytes read past the end of the last returned line
    read_buf: Vec<u8>,
}

impl SerialTransport {
    /// Open `port_name` at `baud_rate` with `timeout` for reads and writes.
    ///
    /// # Errors
    /// `HelixError::Connect` if the device path does not exist or cannot be opened.
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> HelixResult<Self> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(|e| HelixError::Connect {
                port: port_name.to_string(),
                reason: e.to_string(),
            })?;

        debug!(port = port_name, baud_rate, "Serial port opened");
        Ok(Self {
            port_name: port_name.to_string(),
            port,
            read_buf: Vec::with_capacity(128),
        })
    }

    /// Split the first complete line off the read buffer, if there is one.
    fn take_line(&mut self) -> Option<String> {
        let end = self.read_buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.read_buf.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &str) -> HelixResult<()> {
        trace!(port = %self.port_name, command = %data.escape_default(), "Writing");
        let port_name = &self.port_name;
        self.port
            .write_all(data.as_bytes())
            .map_err(|e| HelixError::Transport(format!("write to {} failed: {}", port_name, e)))?;
        self.port
            .flush()
            .map_err(|e| HelixError::Transport(format!("flush of {} failed: {}", port_name, e)))
    }

    fn read_line(&mut self, timeout: Duration) -> HelixResult<String> {
        if let Some(line) = self.take_line() {
            return Ok(line);
        }

        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 64];
        loop {
            match self.port.read(&mut chunk) {
                Ok(0) => {
                    return Err(HelixError::Transport(format!(
                        "{} closed by device",
                        self.port_name
                    )))
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    if let Some(line) = self.take_line() {
                        trace!(port = %self.port_name, line = %line.escape_default(), "Read");
                        return Ok(line);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(HelixError::Io(e)),
            }

            if Instant::now() >= deadline {
                // A partial line stays buffered for the next call.
                return Ok(String::new());
            }
        }
    }

    fn reset_input_buffer(&mut self) -> HelixResult<()> {
        self.read_buf.clear();
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.port_name.clone()
    }
}

/// Enumerate candidate device paths.
///
/// Never fails: an enumeration error is logged and reported as "no ports".
pub fn available_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            debug!(error = %e, "Serial port enumeration failed");
            Vec::new()
        }
    }
}
