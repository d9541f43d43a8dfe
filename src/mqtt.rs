use crate::config::MqttConfig;
use crate::error::{AppError, ConfigError};
use crate::sync::{ConfigHandle, StatePublisher};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// Use the MQTT v5 API surface only
use rumqttc::v5 as mqtt5;
use rumqttc::{Outgoing, Transport};

pub type MqttOptions = mqtt5::MqttOptions;
pub type AsyncClient = mqtt5::AsyncClient;
pub type EventLoop = mqtt5::EventLoop;
pub type QoS = mqtt5::mqttbytes::QoS;

const REQUEST_CAPACITY: usize = 50;
const RETRY_DELAY: Duration = Duration::from_secs(2);

pub fn client_id(cfg: &MqttConfig) -> String {
    cfg.client_id
        .clone()
        .unwrap_or_else(|| format!("hydronics-sim-{}", Uuid::new_v4()))
}

pub fn build_options(cfg: &MqttConfig) -> MqttOptions {
    let mut opts = MqttOptions::new(client_id(cfg), cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
    opts.set_clean_start(cfg.clean_session);
    if let (Some(u), Some(p)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(u.clone(), p.clone());
    }
    if cfg.port == 8883 {
        opts.set_transport(Transport::tls_with_default_config());
    }
    opts
}

pub fn new(options: MqttOptions) -> (AsyncClient, EventLoop) {
    AsyncClient::new(options, REQUEST_CAPACITY)
}

/// State is telemetry: QoS 0 and never wait for the broker.
impl StatePublisher for AsyncClient {
    fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> Result<(), AppError> {
        self.try_publish(topic, QoS::AtMostOnce, true, payload)
            .map_err(|e| AppError::Mqtt(e.to_string()))
    }
}

/// Signals the event-loop driver raises towards `main`.
pub struct DriverSignals {
    /// Flipped to `true` on every successful ConnAck
    pub connected: watch::Sender<bool>,
    /// Flipped to `true` when the connection is considered lost for good
    pub shutdown: watch::Sender<bool>,
}

/// Poll the event loop until our own Disconnect has gone out.
///
/// Subscribes to `config_topic` on every ConnAck (the session may be clean)
/// and routes inbound publishes on it to `handle`. Transport errors are
/// retried after a short delay; rumqttc reconnects on the next poll.
pub async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    config_topic: String,
    handle: ConfigHandle,
    signals: DriverSignals,
    max_failures: Option<u32>,
) {
    let mut failures: u32 = 0;
    loop {
        match eventloop.poll().await {
            Ok(mqtt5::Event::Incoming(mqtt5::Incoming::ConnAck(_))) => {
                failures = 0;
                info!("MQTT connected");
                // try_subscribe: the request queue is drained by this very loop
                if let Err(e) = client.try_subscribe(config_topic.clone(), QoS::AtLeastOnce) {
                    error!(topic = %config_topic, error = %e, "failed to subscribe to config topic");
                } else {
                    info!(topic = %config_topic, "listening for config");
                }
                signals.connected.send_replace(true);
            }
            Ok(mqtt5::Event::Incoming(mqtt5::Incoming::Publish(p))) => {
                // rejections are already logged by the handle
                let _ = route_publish(&p.topic, &p.payload, &config_topic, &handle);
            }
            Ok(mqtt5::Event::Outgoing(Outgoing::Disconnect)) => {
                info!("MQTT disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                failures += 1;
                signals.connected.send_replace(false);
                if max_failures.is_some_and(|max| failures >= max) {
                    error!(error = %e, failures, "MQTT connection lost; giving up");
                    signals.shutdown.send_replace(true);
                    break;
                }
                warn!("mqtt error: {e}; reconnecting after short delay");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

/// Hand an inbound publish to `handle` if it arrived on `config_topic`.
/// Returns `None` when the message was not meant for us.
pub fn route_publish(
    topic: &[u8],
    payload: &[u8],
    config_topic: &str,
    handle: &ConfigHandle,
) -> Option<Result<f64, ConfigError>> {
    let topic = match std::str::from_utf8(topic) {
        Ok(s) => s,
        Err(_) => {
            warn!(topic_bytes = ?topic, "non-utf8 topic; skipping message");
            return None;
        }
    };
    if topic != config_topic {
        debug!(topic = %topic, "ignoring message on unexpected topic");
        return None;
    }
    Some(handle.apply_config(payload))
}

/// Release the broker connection: unsubscribe, disconnect and wait up to
/// `flush_timeout` for the driver to send the Disconnect.
///
/// Requests are queued with `try_*` so a queue that filled up during an
/// outage cannot block shutdown. A driver that does not finish in time is
/// aborted.
pub async fn close(
    client: &AsyncClient,
    config_topic: &str,
    driver: JoinHandle<()>,
    flush_timeout: Duration,
) {
    if let Err(e) = client.try_unsubscribe(config_topic.to_string()) {
        warn!(topic = %config_topic, error = %e, "failed to queue unsubscribe");
    }
    if let Err(e) = client.try_disconnect() {
        warn!(error = %e, "failed to queue disconnect");
    }

    let abort = driver.abort_handle();
    match tokio::time::timeout(flush_timeout, driver).await {
        Ok(Ok(())) => info!("MQTT connection closed"),
        Ok(Err(e)) => error!(error = %e, "MQTT driver task failed"),
        Err(_) => {
            warn!("timed out waiting for MQTT disconnect; dropping connection");
            abort.abort();
        }
    }
}
