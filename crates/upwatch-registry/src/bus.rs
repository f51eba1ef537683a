//! Registry event bus transports.
//!
//! The consumer only needs raw payloads; decoding happens in the consumer so
//! that a malformed message can be counted and skipped without touching the
//! transport.

use std::future::Future;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use upwatch_state::RosterMutation;

use crate::error::BusError;

/// Ordered stream of raw roster mutation payloads.
pub trait MutationSource: Send {
    /// Next payload. `BusError::Closed` means the source is exhausted;
    /// `BusError::Transport` is retryable.
    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>, BusError>> + Send;
}

// ── In-memory bus ──────────────────────────────────────────────

/// In-process bus for tests and single-binary wiring.
pub fn memory_bus(capacity: usize) -> (MemoryPublisher, MemorySource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (MemoryPublisher { tx }, MemorySource { rx })
}

#[derive(Clone)]
pub struct MemoryPublisher {
    tx: mpsc::Sender<Result<Vec<u8>, BusError>>,
}

impl MemoryPublisher {
    pub async fn publish(&self, mutation: &RosterMutation) -> Result<(), BusError> {
        let payload = mutation
            .to_json()
            .map_err(|e| BusError::Encode(e.to_string()))?;
        self.publish_raw(payload).await
    }

    /// Send bytes as-is, e.g. to exercise the malformed-message path.
    pub async fn publish_raw(&self, payload: Vec<u8>) -> Result<(), BusError> {
        self.tx.send(Ok(payload)).await.map_err(|_| BusError::Closed)
    }

    /// Surface a transport failure to the consumer.
    pub async fn inject_error(&self, reason: impl Into<String>) -> Result<(), BusError> {
        self.tx
            .send(Err(BusError::Transport(reason.into())))
            .await
            .map_err(|_| BusError::Closed)
    }
}

pub struct MemorySource {
    rx: mpsc::Receiver<Result<Vec<u8>, BusError>>,
}

impl MutationSource for MemorySource {
    async fn recv(&mut self) -> Result<Vec<u8>, BusError> {
        self.rx.recv().await.unwrap_or(Err(BusError::Closed))
    }
}

// ── MQTT ───────────────────────────────────────────────────────

/// Broker connection settings shared by source and publisher.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub channel_capacity: usize,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            topic: "upwatch/roster".to_string(),
            client_id: "upwatchd".to_string(),
            keep_alive: Duration::from_secs(15),
            channel_capacity: 64,
        }
    }
}

impl MqttSettings {
    /// `clean_session = false` asks the broker to queue QoS 1 messages for
    /// this client id while it is disconnected.
    fn client(&self, client_id: &str, clean_session: bool) -> (AsyncClient, EventLoop) {
        let mut opts = MqttOptions::new(client_id, self.host.as_str(), self.port);
        opts.set_keep_alive(self.keep_alive);
        opts.set_clean_session(clean_session);
        AsyncClient::new(opts, self.channel_capacity.max(1))
    }
}

/// Subscribes to the roster topic with a persistent session; re-subscribes
/// after every reconnect.
pub struct MqttSource {
    client: AsyncClient,
    eventloop: EventLoop,
    topic: String,
}

impl MqttSource {
    pub fn connect(settings: &MqttSettings) -> Self {
        let (client, eventloop) = settings.client(&settings.client_id, false);
        info!(host = %settings.host, port = settings.port, topic = %settings.topic, "mqtt roster source configured");
        Self {
            client,
            eventloop,
            topic: settings.topic.clone(),
        }
    }
}

impl MutationSource for MqttSource {
    async fn recv(&mut self) -> Result<Vec<u8>, BusError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    debug!(topic = %self.topic, "mqtt connected, subscribing");
                    self.client
                        .try_subscribe(self.topic.as_str(), QoS::AtLeastOnce)
                        .map_err(|e| BusError::Transport(e.to_string()))?;
                }
                Ok(Event::Incoming(Incoming::Publish(p))) if p.topic == self.topic => {
                    return Ok(p.payload.to_vec());
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    warn!(topic = %p.topic, "publish on unexpected topic ignored");
                }
                Ok(_) => {}
                Err(e) => return Err(BusError::Transport(e.to_string())),
            }
        }
    }
}

/// One-shot publisher used by the `roster` CLI commands.
pub struct MqttPublisher {
    client: AsyncClient,
    eventloop: EventLoop,
    topic: String,
    ack_timeout: Duration,
}

impl MqttPublisher {
    pub fn connect(settings: &MqttSettings) -> Self {
        let client_id = format!("{}-publisher", settings.client_id);
        let (client, eventloop) = settings.client(&client_id, true);
        Self {
            client,
            eventloop,
            topic: settings.topic.clone(),
            ack_timeout: Duration::from_secs(10),
        }
    }

    /// Publish at-least-once and wait for the broker's PUBACK.
    pub async fn publish(&mut self, mutation: &RosterMutation) -> Result<(), BusError> {
        let payload = mutation
            .to_json()
            .map_err(|e| BusError::Encode(e.to_string()))?;
        self.client
            .publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;

        let eventloop = &mut self.eventloop;
        let acked = tokio::time::timeout(self.ack_timeout, async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::PubAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(BusError::Transport(e.to_string())),
                }
            }
        })
        .await;

        match acked {
            Ok(result) => {
                if result.is_ok() {
                    debug!(server_id = %mutation.id(), topic = %self.topic, "roster mutation published");
                }
                result
            }
            Err(_) => Err(BusError::Transport(format!(
                "no PUBACK within {:?}",
                self.ack_timeout
            ))),
        }
    }
}
