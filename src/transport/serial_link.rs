//! `serialport`-backed [`LineLink`]

use super::serial::LineLink;
use crate::error::{ScanResult, ScannerError};
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::debug;

/// Internal read timeout of the port; the line deadline is enforced on top.
const PORT_POLL: Duration = Duration::from_millis(100);

const LINE_TERMINATOR: &str = "\r\n";

/// Serial line to the scanner's controller board
pub struct SerialLink {
    port: Box<dyn SerialPort>,
    /// Bytes of a line whose read timed out before the delimiter arrived.
    pending: Vec<u8>,
}

impl SerialLink {
    /// Open `port_name` at `baud_rate`.
    pub fn open(port_name: &str, baud_rate: u32) -> ScanResult<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(PORT_POLL)
            .open()
            .map_err(|e| {
                ScannerError::Channel(format!(
                    "Failed to open serial port '{}' at {} baud: {}",
                    port_name, baud_rate, e
                ))
            })?;

        debug!(port = port_name, baud_rate, "serial port opened");
        Ok(Self::from_port(port))
    }

    /// Wrap a port opened elsewhere.
    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        Self {
            port,
            pending: Vec::new(),
        }
    }
}

impl LineLink for SerialLink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let framed = format!("{}{}", line, LINE_TERMINATOR);
        self.port.write_all(framed.as_bytes())?;
        self.port.flush()
    }

    fn read_line(&mut self, timeout: Option<Duration>) -> io::Result<Option<String>> {
        let start = Instant::now();
        let mut byte = [0u8; 1];

        loop {
            if let Some(limit) = timeout {
                if start.elapsed() > limit {
                    return Ok(None);
                }
            }

            match self.port.read(&mut byte) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial port returned EOF",
                    ))
                }
                Ok(_) => {
                    self.pending.push(byte[0]);
                    if byte[0] == b'\n' {
                        break;
                    }
                }
                // Port timeout is shorter than the line deadline
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e),
            }
        }

        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Ok(Some(line))
    }
}

/// Names of the serial ports visible to the OS.
pub fn list_ports() -> ScanResult<Vec<String>> {
    let ports = serialport::available_ports()
        .map_err(|e| ScannerError::Channel(format!("Failed to enumerate serial ports: {}", e)))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
