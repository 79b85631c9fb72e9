//! Synchronous request/response transport
//!
//! Blocking line I/O runs on Tokio's blocking pool so the runtime never
//! stalls on the device. One transaction holds the link lock from the write
//! through the matching read.

use super::{closed, strip_line_ending, Buffered, Transport};
use crate::config::TimingConfig;
use crate::error::{ScanResult, ScannerError};
use async_trait::async_trait;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// A blocking, line-oriented link to the instrument.
///
/// Implementations append their own line terminator on write and return
/// lines *including* the terminator on read, so a blank line (`"\r\n"`) is
/// distinguishable from a timeout (`None`).
pub trait LineLink: Send {
    /// Write one command line.
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Read one line. `None` timeout means wait indefinitely; `Ok(None)`
    /// means the timeout elapsed first.
    fn read_line(&mut self, timeout: Option<Duration>) -> io::Result<Option<String>>;
}

type SharedLink = Arc<Mutex<Box<dyn LineLink>>>;

/// Serial request/response transport
pub struct SerialTransport {
    link: Option<SharedLink>,
    timing: TimingConfig,
}

impl SerialTransport {
    /// Wrap an already-open link.
    pub fn new(link: Box<dyn LineLink>, timing: TimingConfig) -> Self {
        Self {
            link: Some(Arc::new(Mutex::new(link))),
            timing,
        }
    }

    /// Run `op` against the link on the blocking pool.
    async fn with_link<T, F>(&self, op: F) -> ScanResult<T>
    where
        F: FnOnce(&mut dyn LineLink) -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let link = self.link.as_ref().ok_or_else(|| closed("serial"))?.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = link
                .lock()
                .map_err(|_| ScannerError::Channel("serial link lock poisoned".to_string()))?;
            op(guard.as_mut()).map_err(ScannerError::from)
        })
        .await
        .map_err(|e| ScannerError::Channel(format!("serial I/O task failed: {}", e)))?
    }

    fn is_long_query(&self, command: &str) -> bool {
        command.starts_with(&self.timing.long_query_prefix)
    }
}

/// Map a soft read failure to the empty-reply sentinel.
fn soften(result: ScanResult<Option<String>>, command: Option<&str>) -> ScanResult<String> {
    match result {
        Ok(Some(line)) => Ok(line),
        Ok(None) => {
            debug!(command, "serial read timed out");
            Ok(String::new())
        }
        Err(ScannerError::Io(e)) => {
            warn!(command, error = %e, "serial transaction failed");
            Ok(String::new())
        }
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> &'static str {
        "serial"
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    async fn send(&mut self, command: &str) -> ScanResult<()> {
        let line = command.to_string();
        self.with_link(move |link| link.write_line(&line)).await?;
        debug!(command, "serial command sent");

        sleep(self.timing.send_settle()).await;
        Ok(())
    }

    async fn receive(&mut self) -> ScanResult<String> {
        let timeout = self.timing.receive_timeout();
        let result = self
            .with_link(move |link| link.read_line(Some(timeout)))
            .await;
        soften(result, None)
    }

    async fn query(&mut self, command: &str) -> ScanResult<String> {
        let line = command.to_string();

        if self.is_long_query(command) {
            // Sample dumps can take minutes; wait as long as the device needs.
            let reply = self
                .with_link(move |link| {
                    link.write_line(&line)?;
                    link.read_line(None)
                })
                .await?;
            let reply = reply.unwrap_or_default();
            debug!(command, reply_len = reply.len(), "serial long query answered");
            return Ok(reply);
        }

        let timeout = self.timing.receive_timeout();
        let result = self
            .with_link(move |link| {
                link.write_line(&line)?;
                link.read_line(Some(timeout))
            })
            .await;
        let reply = soften(result, Some(command))?;
        debug!(command, reply = %strip_line_ending(&reply), "serial query answered");
        Ok(reply)
    }

    async fn buffer_to(&mut self, command: &str) -> ScanResult<Buffered> {
        if !command.is_empty() {
            self.send(command).await?;
        }

        let deadline = Instant::now() + self.timing.buffer_terminator();
        let mut items = Vec::new();
        loop {
            let reply = self.receive().await?;
            if reply.is_empty() {
                break;
            }
            items.push(strip_line_ending(&reply).to_string());

            if Instant::now() >= deadline {
                warn!(command, items = items.len(), "buffered capture hit its deadline");
                break;
            }
            sleep(self.timing.send_settle()).await;
        }

        Ok(Buffered::from_capture(items))
    }

    async fn handshake(&mut self) -> ScanResult<()> {
        loop {
            let line = self.receive().await?;
            if line.starts_with(&self.timing.ready_marker) {
                break;
            }
            info!("Waiting for instrument setup...");
            sleep(self.timing.boot_poll()).await;
        }
        info!("Instrument setup complete");
        Ok(())
    }

    async fn close(&mut self) -> ScanResult<()> {
        if self.link.take().is_some() {
            debug!("serial link closed");
        }
        Ok(())
    }
}
