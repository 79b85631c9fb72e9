//! MQTT broker session for [`PubSubTransport`]
//!
//! Wraps a `rumqttc` client: waits for the broker to accept the connection,
//! subscribes to the reply topic, polls the event loop on its own task and
//! forwards reply payloads to the transport.

use super::pubsub::{PubSubTransport, Publisher};
use crate::config::{MqttConfig, TimingConfig};
use crate::error::{ScanResult, ScannerError};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const REQUEST_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 256;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Publishing half of an MQTT session
pub struct MqttPublisher {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
    publish_timeout: Duration,
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: &str) -> ScanResult<()> {
        let request = self
            .client
            .publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec());
        match tokio::time::timeout(self.publish_timeout, request).await {
            Ok(result) => result.map_err(|e| {
                ScannerError::Channel(format!("MQTT publish to '{}' failed: {}", topic, e))
            }),
            Err(_) => Err(ScannerError::Channel(format!(
                "MQTT publish to '{}' timed out, broker unreachable",
                topic
            ))),
        }
    }

    async fn disconnect(&self) -> ScanResult<()> {
        let result = self.client.disconnect().await;
        self.event_loop.abort();
        result.map_err(|e| ScannerError::Channel(format!("MQTT disconnect failed: {}", e)))
    }
}

/// Connect to the broker and build a transport over the session.
///
/// Fails with [`ScannerError::Channel`] when the broker does not accept the
/// connection within the receive timeout.
pub async fn connect(config: &MqttConfig, timing: TimingConfig) -> ScanResult<PubSubTransport> {
    let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
    options.set_keep_alive(Duration::from_secs(30));

    let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
    let address = format!("{}:{}", config.broker, config.port);
    match tokio::time::timeout(timing.receive_timeout(), await_connack(&mut event_loop)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            return Err(ScannerError::Channel(format!(
                "MQTT connection to {} failed: {}",
                address, e
            )))
        }
        Err(_) => {
            return Err(ScannerError::Channel(format!(
                "MQTT broker {} did not acknowledge the connection",
                address
            )))
        }
    }
    subscribe(&client, &config.reply_topic)?;

    let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
    let reply_topic = config.reply_topic.clone();
    let session = client.clone();
    let event_loop = tokio::spawn(async move {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == reply_topic => {
                    let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                    if tx.send(payload).await.is_err() {
                        break;
                    }
                }
                // Clean sessions drop subscriptions on reconnect
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(reply_topic = %reply_topic, "MQTT reconnected, resubscribing");
                    if let Err(e) = subscribe(&session, &reply_topic) {
                        warn!(error = %e, "MQTT resubscribe failed");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MQTT connection error, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    });

    info!(
        broker = %config.broker,
        port = config.port,
        command_topic = %config.command_topic,
        reply_topic = %config.reply_topic,
        "MQTT session started"
    );

    let publisher = Arc::new(MqttPublisher {
        client,
        event_loop,
        publish_timeout: timing.receive_timeout(),
    });
    Ok(PubSubTransport::new(
        publisher,
        rx,
        config.command_topic.clone(),
        timing,
    ))
}

async fn await_connack(event_loop: &mut EventLoop) -> Result<(), rumqttc::ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(ack)) = event_loop.poll().await? {
            debug!(code = ?ack.code, "MQTT connection acknowledged");
            return Ok(());
        }
    }
}

// Never awaits, so the poller can call it without waiting on its own queue.
fn subscribe(client: &AsyncClient, topic: &str) -> ScanResult<()> {
    client
        .try_subscribe(topic, QoS::AtMostOnce)
        .map_err(|e| ScannerError::Channel(format!("MQTT subscribe to '{}' failed: {}", topic, e)))
}
