//! MQTT transport for live mode.
//!
//! Merged live records are published as JSON text to a single topic. The
//! same connection optionally subscribes to a warning topic whose payload
//! (`1`/`0`, `true`/`false`, `on`/`off`) drives the shared [`WarningFlag`],
//! and through it the LED/buzzer of every indicator device.
//!
//! # Example Configuration
//!
//! ```toml
//! [mqtt]
//! broker = "mqtt://localhost:1883"
//! topic = "posture/live"
//! warning_topic = "posture/warning"
//! qos = 1
//! ```
//!
//! # Reconnection
//!
//! rumqttc reconnects on the next poll after a connection error. Errors are
//! logged, the loop waits a few seconds and keeps polling until cancelled.
//! The warning subscription is renewed on every `ConnAck`.
//!
//! Publishing never waits on the connection: once the request queue is full
//! the record is refused with [`SinkError::Publish`].

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use posture_core::{RecordPublisher, SinkError, WarningFlag, parse_warning_payload};

use crate::config::MqttConfig;

/// Wait after a connection error before polling again.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Capacity of the client request queue.
const REQUEST_CAPACITY: usize = 100;

/// Errors raised while setting up the MQTT client.
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("Invalid MQTT broker URL: {0}")]
    InvalidBroker(String),
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Publishes merged live records to the configured topic.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    topic: String,
    qos: QoS,
}

impl std::fmt::Debug for MqttPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttPublisher")
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}

impl MqttPublisher {
    /// Connect to the broker and start the event loop.
    ///
    /// The returned task polls the connection until `cancel` fires. When
    /// `warning_topic` is configured, matching messages update `warning`.
    pub fn connect(
        config: &MqttConfig,
        warning: WarningFlag,
        cancel: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>), MqttError> {
        let (host, port, use_tls) =
            parse_broker_url(&config.broker).map_err(MqttError::InvalidBroker)?;

        let mut mqtt_options = MqttOptions::new(&config.client_id, host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        if use_tls {
            mqtt_options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let qos = qos_from_level(config.qos);
        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        info!(
            "MQTT publisher for {} on topic '{}'",
            config.broker, config.topic
        );

        let handle = tokio::spawn(run_event_loop(
            client.clone(),
            eventloop,
            config.warning_topic.clone(),
            qos,
            warning,
            cancel,
        ));

        Ok((
            Self {
                client,
                topic: config.topic.clone(),
                qos,
            },
            handle,
        ))
    }

    /// Topic records are published to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Disconnect from the broker.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("Error disconnecting MQTT client: {}", e);
        }
    }
}

#[async_trait]
impl RecordPublisher for MqttPublisher {
    async fn publish(&self, record: &Map<String, Value>) -> Result<(), SinkError> {
        let payload = serde_json::to_string(record)?;
        self.client
            .try_publish(&self.topic, self.qos, false, payload.into_bytes())
            .map_err(|e| SinkError::Publish(e.to_string()))?;
        debug!("Published {} fields to {}", record.len(), self.topic);
        Ok(())
    }
}

/// Poll the connection until cancelled.
async fn run_event_loop(
    client: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    warning_topic: Option<String>,
    qos: QoS,
    warning: WarningFlag,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("MQTT connected: {:?}", ack);
                if let Some(topic) = &warning_topic
                    && let Err(e) = client.try_subscribe(topic, qos)
                {
                    warn!("Failed to subscribe to {}: {}", topic, e);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if let Some(topic) = &warning_topic {
                    apply_warning(&publish, topic, &warning);
                }
            }
            Ok(Event::Incoming(Packet::PingResp)) => {
                debug!("MQTT ping response received");
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {}. Reconnecting...", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
    debug!("MQTT event loop stopped");
}

/// Update `warning` from a message on the warning topic.
///
/// Returns whether the flag changed.
fn apply_warning(publish: &Publish, topic: &str, warning: &WarningFlag) -> bool {
    if publish.topic != topic {
        return false;
    }
    match parse_warning_payload(&publish.payload) {
        Some(active) => {
            let changed = warning.set(active);
            if changed {
                info!("Posture warning {}", if active { "raised" } else { "cleared" });
            }
            changed
        }
        None => {
            warn!(
                "Ignoring warning payload {:?}",
                String::from_utf8_lossy(&publish.payload)
            );
            false
        }
    }
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Parse an MQTT broker URL into (host, port, use_tls).
pub fn parse_broker_url(url: &str) -> Result<(String, u16, bool), String> {
    let (scheme, rest) = if let Some(stripped) = url.strip_prefix("mqtt://") {
        ("mqtt", stripped)
    } else if let Some(stripped) = url.strip_prefix("mqtts://") {
        ("mqtts", stripped)
    } else {
        return Err("Invalid scheme: URL must start with mqtt:// or mqtts://".to_string());
    };

    let use_tls = scheme == "mqtts";
    let default_port = if use_tls { 8883 } else { 1883 };

    let (host, port) = if let Some((h, p)) = rest.rsplit_once(':') {
        let port = p
            .parse::<u16>()
            .map_err(|_| format!("Invalid port: {}", p))?;
        (h.to_string(), port)
    } else {
        (rest.to_string(), default_port)
    };

    if host.is_empty() {
        return Err("Host cannot be empty".to_string());
    }

    Ok((host, port, use_tls))
}
