//! Instrument transports
//!
//! Both links carry the same text command vocabulary and expose the same
//! contract through [`Transport`]. The variant is picked once, when the
//! scanner is built; nothing above this module knows which one is active.
//!
//! - [`SerialTransport`]: synchronous request/response over a [`LineLink`]
//! - [`PubSubTransport`]: commands and replies relayed through a broker, with
//!   a background delivery task feeding a single-slot mailbox
//! - [`SimulatedLink`]: an in-process instrument model behind a serial transport
//! - [`MockTransport`]: scripted replies for tests
//!
//! A receive that times out yields an empty string. Callers treat `""` as
//! "nothing arrived" on either link.

pub mod mock;
pub mod pubsub;
pub mod serial;
pub mod sim;

#[cfg(feature = "transport_mqtt")]
pub mod mqtt;
#[cfg(feature = "instrument_serial")]
pub mod serial_link;

pub use mock::{CommandHistory, MockTransport};
pub use pubsub::{PubSubTransport, Publisher};
pub use serial::{LineLink, SerialTransport};
pub use sim::SimulatedLink;

#[cfg(feature = "instrument_serial")]
pub use serial_link::{list_ports, SerialLink};

use crate::config::{ScannerConfig, TransportKind};
use crate::error::{ScanResult, ScannerError};
use async_trait::async_trait;

/// Outcome of a buffered capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Buffered {
    /// The terminator item arrived; it is not included.
    Complete(Vec<String>),
    /// The capture ended on a deadline or timeout before a terminator.
    Incomplete(Vec<String>),
}

impl Buffered {
    /// Classify a raw capture. An empty final item is the terminator.
    pub fn from_capture(mut items: Vec<String>) -> Self {
        match items.last() {
            Some(last) if is_terminator(last) => {
                items.pop();
                Self::Complete(items)
            }
            _ => Self::Incomplete(items),
        }
    }

    /// Whether the terminator was seen.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    /// Captured items, with or without a terminator.
    pub fn into_items(self) -> Vec<String> {
        match self {
            Self::Complete(items) | Self::Incomplete(items) => items,
        }
    }
}

pub(crate) fn is_terminator(item: &str) -> bool {
    strip_line_ending(item).is_empty()
}

pub(crate) fn strip_line_ending(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

/// Contract shared by every instrument link.
///
/// Methods take `&mut self`: one scanner issues one command at a time and
/// never sends a second command while a reply is outstanding.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short label for logs ("serial", "mqtt", "mock").
    fn kind(&self) -> &'static str;

    /// Whether [`close`](Transport::close) has not yet run.
    fn is_open(&self) -> bool;

    /// Write a command without waiting for a reply.
    async fn send(&mut self, command: &str) -> ScanResult<()>;

    /// Wait for one reply unit. Returns `""` on timeout.
    async fn receive(&mut self) -> ScanResult<String>;

    /// Send a command and wait for its reply. Returns `""` on timeout.
    async fn query(&mut self, command: &str) -> ScanResult<String>;

    /// Send `command` (unless empty) and collect replies until a terminator.
    async fn buffer_to(&mut self, command: &str) -> ScanResult<Buffered>;

    /// Wait for the instrument to report that its own setup finished.
    async fn handshake(&mut self) -> ScanResult<()> {
        Ok(())
    }

    /// Release the link. Calling it again is a no-op.
    async fn close(&mut self) -> ScanResult<()>;
}

/// Open the transport named by `config.transport.kind`.
pub async fn open(config: &ScannerConfig) -> ScanResult<Box<dyn Transport>> {
    match config.transport.kind {
        TransportKind::Serial => open_serial(config),
        TransportKind::Mqtt => open_mqtt(config).await,
        TransportKind::Simulated => {
            let link = SimulatedLink::new(config.simulation.clone(), &config.calibration);
            Ok(Box::new(SerialTransport::new(
                Box::new(link),
                config.timing.clone(),
            )))
        }
    }
}

#[cfg(feature = "instrument_serial")]
fn open_serial(config: &ScannerConfig) -> ScanResult<Box<dyn Transport>> {
    let serial = &config.transport.serial;
    let link = SerialLink::open(&serial.port, serial.baud_rate)?;
    Ok(Box::new(SerialTransport::new(
        Box::new(link),
        config.timing.clone(),
    )))
}

#[cfg(not(feature = "instrument_serial"))]
fn open_serial(_config: &ScannerConfig) -> ScanResult<Box<dyn Transport>> {
    Err(ScannerError::FeatureNotEnabled("instrument_serial".to_string()))
}

#[cfg(feature = "transport_mqtt")]
async fn open_mqtt(config: &ScannerConfig) -> ScanResult<Box<dyn Transport>> {
    let transport = mqtt::connect(&config.transport.mqtt, config.timing.clone()).await?;
    Ok(Box::new(transport))
}

#[cfg(not(feature = "transport_mqtt"))]
async fn open_mqtt(_config: &ScannerConfig) -> ScanResult<Box<dyn Transport>> {
    Err(ScannerError::FeatureNotEnabled("transport_mqtt".to_string()))
}

pub(crate) fn closed(kind: &str) -> ScannerError {
    ScannerError::Channel(format!("{} link is closed", kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_drops_terminator() {
        let capture = vec!["12".to_string(), "13".to_string(), String::new()];
        let buffered = Buffered::from_capture(capture);
        assert!(buffered.is_complete());
        assert_eq!(buffered.into_items(), vec!["12", "13"]);
    }

    #[test]
    fn test_buffered_without_terminator() {
        let buffered = Buffered::from_capture(vec!["12".to_string()]);
        assert_eq!(buffered, Buffered::Incomplete(vec!["12".to_string()]));
        assert!(!Buffered::from_capture(Vec::new()).is_complete());
    }

    #[test]
    fn test_line_ending_terminator() {
        assert!(is_terminator("\r\n"));
        assert!(!is_terminator("0\r\n"));
        assert_eq!(strip_line_ending("1,2,\r\n"), "1,2,");
    }
}
