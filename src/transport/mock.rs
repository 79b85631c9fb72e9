//! Scripted in-memory transport
//!
//! Replays canned replies keyed by exact command text and records every
//! command it is given. Unscripted queries behave like a timed-out link and
//! return the empty sentinel.
//!
//! # Example
//!
//! ```rust
//! use immersion_scanner::transport::{MockTransport, Transport};
//!
//! # tokio_test_block(async {
//! let mut link = MockTransport::new().reply("*IDN?", "SCANNER,1");
//! let history = link.history();
//! assert_eq!(link.query("*IDN?").await.unwrap(), "SCANNER,1");
//! assert_eq!(link.query("*IDN?").await.unwrap(), "");
//! assert_eq!(history.commands(), vec!["*IDN?", "*IDN?"]);
//! # });
//! # fn tokio_test_block(f: impl std::future::Future<Output = ()>) {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

use super::{closed, Buffered, Transport};
use crate::error::ScanResult;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

/// Shared record of the commands a [`MockTransport`] received.
#[derive(Debug, Clone, Default)]
pub struct CommandHistory(Arc<Mutex<Vec<String>>>);

impl CommandHistory {
    fn push(&self, command: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.to_string());
    }

    /// Commands in the order they were sent.
    pub fn commands(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Transport that answers from a script
#[derive(Debug, Default)]
pub struct MockTransport {
    replies: HashMap<String, VecDeque<String>>,
    unsolicited: VecDeque<String>,
    history: CommandHistory,
    closed: bool,
}

impl MockTransport {
    /// Empty script: every query times out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one reply for `command`. Repeated calls queue in order.
    pub fn reply(mut self, command: &str, reply: impl Into<String>) -> Self {
        self.replies
            .entry(command.to_string())
            .or_default()
            .push_back(reply.into());
        self
    }

    /// Queue a line for [`receive`](Transport::receive) regardless of command.
    pub fn unsolicited(mut self, line: impl Into<String>) -> Self {
        self.unsolicited.push_back(line.into());
        self
    }

    /// Handle on the command record, usable after the transport is boxed.
    pub fn history(&self) -> CommandHistory {
        self.history.clone()
    }

    fn check_open(&self) -> ScanResult<()> {
        if self.closed {
            return Err(closed("mock"));
        }
        Ok(())
    }

    fn next_reply(&mut self, command: &str) -> String {
        self.replies
            .get_mut(command)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> &'static str {
        "mock"
    }

    fn is_open(&self) -> bool {
        !self.closed
    }

    async fn send(&mut self, command: &str) -> ScanResult<()> {
        self.check_open()?;
        self.history.push(command);
        Ok(())
    }

    async fn receive(&mut self) -> ScanResult<String> {
        self.check_open()?;
        Ok(self.unsolicited.pop_front().unwrap_or_default())
    }

    async fn query(&mut self, command: &str) -> ScanResult<String> {
        self.check_open()?;
        self.history.push(command);
        Ok(self.next_reply(command))
    }

    async fn buffer_to(&mut self, command: &str) -> ScanResult<Buffered> {
        self.check_open()?;
        if !command.is_empty() {
            self.history.push(command);
        }
        let items = self
            .replies
            .remove(command)
            .map(Vec::from)
            .unwrap_or_default();
        Ok(Buffered::from_capture(items))
    }

    async fn close(&mut self) -> ScanResult<()> {
        self.closed = true;
        Ok(())
    }
}
