//! Publish/subscribe transport
//!
//! Commands go out on one topic; replies arrive on another and are pushed
//! by the broker whenever the instrument prints. A background task drains
//! the inbound stream into a [`Mailbox`], the only state it shares with the
//! foreground. The mailbox has two consumption modes:
//!
//! - single-value: the latest reply replaces the previous one (used by
//!   `query` and `receive`)
//! - append: every reply is pushed onto a capture buffer (used by `buffer_to`)
//!
//! Delivery and mode swaps take the same lock, so a reply is never routed
//! to the mode that was active before a swap completed.

use super::{closed, is_terminator, Buffered, Transport};
use crate::config::TimingConfig;
use crate::error::ScanResult;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

/// Outbound half of a broker session.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: &str) -> ScanResult<()>;

    /// End the broker session.
    async fn disconnect(&self) -> ScanResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Slot {
    latest: Option<String>,
    /// Bumped on every single-value delivery.
    seq: u64,
    /// `Some` while a buffered capture is running.
    capture: Option<Vec<String>>,
}

#[derive(Debug, Default)]
struct Mailbox {
    slot: Mutex<Slot>,
    notify: Notify,
}

impl Mailbox {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, payload: String) {
        {
            let mut slot = self.lock();
            match slot.capture.as_mut() {
                Some(items) => items.push(payload),
                None => {
                    slot.latest = Some(payload);
                    slot.seq += 1;
                }
            }
        }
        self.notify.notify_waiters();
    }

    /// Wait until `check` yields a value or `deadline` passes.
    async fn wait_until<T>(
        &self,
        deadline: Instant,
        mut check: impl FnMut(&mut Slot) -> Option<T>,
    ) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a delivery in between is not missed
            notified.as_mut().enable();

            let ready = check(&mut self.lock());
            if ready.is_some() {
                return ready;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return check(&mut self.lock());
            }
        }
    }
}

async fn deliver_loop(mut inbound: mpsc::Receiver<String>, mailbox: Arc<Mailbox>) {
    while let Some(payload) = inbound.recv().await {
        trace!(payload = %payload, "broker message delivered");
        mailbox.deliver(payload);
    }
    debug!("inbound broker stream ended");
}

/// Broker-relayed transport
pub struct PubSubTransport {
    publisher: Arc<dyn Publisher>,
    command_topic: String,
    mailbox: Arc<Mailbox>,
    delivery: Option<JoinHandle<()>>,
    timing: TimingConfig,
}

impl PubSubTransport {
    /// Start the delivery task over an open broker session.
    ///
    /// `inbound` carries reply-topic payloads in arrival order. Must be
    /// called from within a Tokio runtime.
    pub fn new(
        publisher: Arc<dyn Publisher>,
        inbound: mpsc::Receiver<String>,
        command_topic: impl Into<String>,
        timing: TimingConfig,
    ) -> Self {
        let mailbox = Arc::new(Mailbox::default());
        let delivery = tokio::spawn(deliver_loop(inbound, mailbox.clone()));

        Self {
            publisher,
            command_topic: command_topic.into(),
            mailbox,
            delivery: Some(delivery),
            timing,
        }
    }

    async fn publish(&self, command: &str) -> ScanResult<()> {
        if self.delivery.is_none() {
            return Err(closed("mqtt"));
        }
        self.publisher.publish(&self.command_topic, command).await?;
        debug!(command, topic = %self.command_topic, "command published");
        Ok(())
    }

    async fn next_single_value(&self, after_seq: u64) -> String {
        let deadline = Instant::now() + self.timing.receive_timeout();
        self.mailbox
            .wait_until(deadline, |slot| {
                (slot.seq != after_seq).then(|| slot.latest.clone()).flatten()
            })
            .await
            .unwrap_or_default()
    }

    fn end_capture(&self) -> Vec<String> {
        self.mailbox.lock().capture.take().unwrap_or_default()
    }
}

#[async_trait]
impl Transport for PubSubTransport {
    fn kind(&self) -> &'static str {
        "mqtt"
    }

    fn is_open(&self) -> bool {
        self.delivery.is_some()
    }

    async fn send(&mut self, command: &str) -> ScanResult<()> {
        self.publish(command).await
    }

    async fn receive(&mut self) -> ScanResult<String> {
        if !self.is_open() {
            return Err(closed("mqtt"));
        }
        let seq = self.mailbox.lock().seq;
        let reply = self.next_single_value(seq).await;
        if reply.is_empty() {
            debug!("no broker message before receive timeout");
        }
        Ok(reply)
    }

    async fn query(&mut self, command: &str) -> ScanResult<String> {
        let seq = {
            let mut slot = self.mailbox.lock();
            slot.latest = None;
            slot.seq
        };
        self.publish(command).await?;

        let reply = self.next_single_value(seq).await;
        if reply.is_empty() {
            warn!(command, "no reply before query timeout");
        }
        Ok(reply)
    }

    async fn buffer_to(&mut self, command: &str) -> ScanResult<Buffered> {
        if !self.is_open() {
            return Err(closed("mqtt"));
        }
        self.mailbox.lock().capture = Some(Vec::new());

        if !command.is_empty() {
            if let Err(e) = self.publish(command).await {
                self.end_capture();
                return Err(e);
            }
        }

        let first = Instant::now() + self.timing.buffer_first_item();
        let started = self
            .mailbox
            .wait_until(first, |slot| {
                slot.capture
                    .as_ref()
                    .filter(|items| !items.is_empty())
                    .map(|_| ())
            })
            .await;
        if started.is_none() {
            self.end_capture();
            debug!(command, "no buffered item before first-item deadline");
            return Ok(Buffered::Incomplete(Vec::new()));
        }

        let terminator = Instant::now() + self.timing.buffer_terminator();
        let finished = self
            .mailbox
            .wait_until(terminator, |slot| {
                slot.capture
                    .as_ref()
                    .and_then(|items| items.last())
                    .filter(|last| is_terminator(last))
                    .map(|_| ())
            })
            .await;

        let items = self.end_capture();
        if finished.is_none() {
            warn!(command, items = items.len(), "buffered capture hit its deadline");
        }
        Ok(Buffered::from_capture(items))
    }

    async fn close(&mut self) -> ScanResult<()> {
        if let Some(delivery) = self.delivery.take() {
            delivery.abort();
            self.publisher.disconnect().await?;
            debug!("broker session closed");
        }
        Ok(())
    }
}

impl Drop for PubSubTransport {
    fn drop(&mut self) {
        if let Some(delivery) = self.delivery.take() {
            delivery.abort();
        }
    }
}
