//! MQTT event bus.
//!
//! Each daemon connects with its own client id and subscribes to the
//! replication topic, so the broker delivers every event to every instance.
//!
//! Publishing is fire-and-forget: while the broker is unreachable, or the
//! client's request queue is full, `publish_payload` fails immediately and
//! the event is not queued for a later resend.
//!
//! # Examples
//!
//! ```no_run
//! use fleetd::replication::MqttBus;
//!
//! # async fn example() -> Result<(), fleetd::replication::BusError> {
//! let bus = MqttBus::builder()
//!     .host("192.168.1.50")
//!     .port(1883)
//!     .credentials("user", "password")
//!     .build()
//!     .await?;
//!
//! bus.disconnect().await;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_protocol::DEFAULT_TOPIC;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fanout::Fanout;
use super::{BusError, EventBus};

/// Global counter for generating unique client IDs.
static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Default MQTT port.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Pause before polling again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long `disconnect` waits for queued publishes to leave.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Outgoing requests buffered by the client before publishing fails.
const REQUEST_CAPACITY: usize = 64;

/// Configuration for an MQTT bus connection.
#[derive(Debug, Clone)]
pub struct MqttBusConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
    pub connection_timeout: Duration,
}

impl Default for MqttBusConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_MQTT_PORT,
            topic: DEFAULT_TOPIC.to_string(),
            credentials: None,
            keep_alive: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
        }
    }
}

/// Event bus backed by an MQTT broker.
pub struct MqttBus {
    client: AsyncClient,
    config: MqttBusConfig,
    incoming: Fanout,
    connected: Arc<AtomicBool>,

    /// Stops the event loop task
    cancel_token: CancellationToken,

    /// Cancelled by the event loop task when it exits
    stopped: CancellationToken,
}

impl MqttBus {
    pub fn builder() -> MqttBusBuilder {
        MqttBusBuilder::default()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Disconnects from the broker and stops the event loop.
    ///
    /// Publishes queued before this call are flushed first, within a short
    /// grace period.
    pub async fn disconnect(&self) {
        info!(
            host = %self.config.host,
            port = self.config.port,
            "Disconnecting from MQTT broker"
        );

        match self.client.disconnect().await {
            Ok(()) => {
                if tokio::time::timeout(DISCONNECT_GRACE, self.stopped.cancelled())
                    .await
                    .is_err()
                {
                    debug!("MQTT event loop did not drain before disconnect");
                }
            }
            Err(e) => debug!(error = %e, "MQTT disconnect request not delivered"),
        }
        self.cancel_token.cancel();
        self.connected.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for MqttBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBus")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("topic", &self.config.topic)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[async_trait]
impl EventBus for MqttBus {
    fn topic(&self) -> &str {
        &self.config.topic
    }

    async fn publish_payload(&self, payload: String) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::Publish {
                topic: self.config.topic.clone(),
                reason: "not connected to broker".to_string(),
            });
        }

        self.client
            .try_publish(&self.config.topic, QoS::AtLeastOnce, false, payload.into_bytes())
            .map_err(|e| BusError::Publish {
                topic: self.config.topic.clone(),
                reason: e.to_string(),
            })
    }

    fn subscribe(&self) -> mpsc::Receiver<String> {
        self.incoming.subscribe()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for an `MqttBus`.
#[derive(Debug, Default)]
pub struct MqttBusBuilder {
    config: MqttBusConfig,
}

impl MqttBusBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.topic = topic.into();
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Some((username.into(), password.into()));
        self
    }

    pub fn keep_alive(mut self, duration: Duration) -> Self {
        self.config.keep_alive = duration;
        self
    }

    /// Sets the connection timeout (default: 10 seconds).
    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.config.connection_timeout = duration;
        self
    }

    /// Connects to the broker and subscribes to the replication topic.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Connection` if the host is not set, or if the broker
    /// does not acknowledge the connection within the timeout.
    pub async fn build(self) -> Result<MqttBus, BusError> {
        if self.config.host.is_empty() {
            return Err(BusError::Connection("MQTT broker host is required".to_string()));
        }

        let counter = CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let client_id = format!("fleetd_{}_{}", std::process::id(), counter);

        let mut options = MqttOptions::new(&client_id, &self.config.host, self.config.port);
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(true);
        if let Some((ref username, ref password)) = self.config.credentials {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let incoming = Fanout::default();
        let connected = Arc::new(AtomicBool::new(false));
        let cancel_token = CancellationToken::new();
        let stopped = CancellationToken::new();

        // Channel to signal when ConnAck is received
        let (connack_tx, connack_rx) = oneshot::channel();

        tokio::spawn(run_event_loop(
            event_loop,
            EventLoopContext {
                client: client.clone(),
                topic: self.config.topic.clone(),
                incoming: incoming.clone(),
                connected: connected.clone(),
                cancel_token: cancel_token.clone(),
                stopped: stopped.clone(),
            },
            connack_tx,
        ));

        let timeout = self.config.connection_timeout;
        match tokio::time::timeout(timeout, connack_rx).await {
            Ok(Ok(())) => {
                info!(
                    host = %self.config.host,
                    port = self.config.port,
                    topic = %self.config.topic,
                    client_id = %client_id,
                    "Connected to MQTT broker"
                );
            }
            Ok(Err(_)) => {
                cancel_token.cancel();
                return Err(BusError::Connection(
                    "MQTT event loop terminated unexpectedly".to_string(),
                ));
            }
            Err(_) => {
                cancel_token.cancel();
                return Err(BusError::Connection(format!(
                    "MQTT connection timeout after {}ms",
                    timeout.as_millis()
                )));
            }
        }

        Ok(MqttBus {
            client,
            config: self.config,
            incoming,
            connected,
            cancel_token,
            stopped,
        })
    }
}

// ============================================================================
// Event Loop
// ============================================================================

struct EventLoopContext {
    client: AsyncClient,
    topic: String,
    incoming: Fanout,
    connected: Arc<AtomicBool>,
    cancel_token: CancellationToken,
    stopped: CancellationToken,
}

/// Drives the MQTT connection until cancelled.
///
/// rumqttc reconnects on the next poll after an error; the subscription is
/// renewed on every ConnAck since sessions are clean. While a subscriber's
/// queue is full the loop stops polling, which holds the broker back.
async fn run_event_loop(
    mut event_loop: EventLoop,
    ctx: EventLoopContext,
    connack_tx: oneshot::Sender<()>,
) {
    let _stopped = ctx.stopped.clone().drop_guard();
    let mut connack_tx = Some(connack_tx);

    loop {
        let polled = tokio::select! {
            biased;
            _ = ctx.cancel_token.cancelled() => break,
            polled = event_loop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                debug!(?connack, "MQTT broker connected");
                ctx.connected.store(true, Ordering::Release);
                if let Err(e) = ctx.client.try_subscribe(&ctx.topic, QoS::AtLeastOnce) {
                    error!(topic = %ctx.topic, error = %e, "Failed to subscribe to replication topic");
                }
                if let Some(tx) = connack_tx.take() {
                    let _ = tx.send(());
                }
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                debug!(?suback, "MQTT subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if publish.topic != ctx.topic {
                    continue;
                }
                match String::from_utf8(publish.payload.to_vec()) {
                    Ok(payload) => {
                        debug!(topic = %publish.topic, bytes = payload.len(), "MQTT message received");
                        tokio::select! {
                            biased;
                            _ = ctx.cancel_token.cancelled() => break,
                            _ = ctx.incoming.deliver(payload) => {}
                        }
                    }
                    Err(e) => warn!(topic = %publish.topic, error = %e, "Dropping non-UTF-8 payload"),
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                ctx.connected.store(false, Ordering::Release);
                break;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("MQTT broker disconnected");
                ctx.connected.store(false, Ordering::Release);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "MQTT event loop error");
                ctx.connected.store(false, Ordering::Release);

                tokio::select! {
                    biased;
                    _ = ctx.cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }

    debug!("MQTT event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_default_values() {
        let builder = MqttBusBuilder::default();
        assert!(builder.config.host.is_empty());
        assert_eq!(builder.config.port, 1883);
        assert_eq!(builder.config.topic, "device_updates");
        assert!(builder.config.credentials.is_none());
        assert_eq!(builder.config.connection_timeout, Duration::from_secs(10));
    }

    #[test]
    fn builder_chain() {
        let builder = MqttBusBuilder::default()
            .host("broker.local")
            .port(8883)
            .topic("fleet")
            .credentials("user", "pass")
            .keep_alive(Duration::from_secs(60))
            .connection_timeout(Duration::from_secs(5));

        assert_eq!(builder.config.host, "broker.local");
        assert_eq!(builder.config.port, 8883);
        assert_eq!(builder.config.topic, "fleet");
        assert_eq!(
            builder.config.credentials,
            Some(("user".to_string(), "pass".to_string()))
        );
        assert_eq!(builder.config.keep_alive, Duration::from_secs(60));
        assert_eq!(builder.config.connection_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn builder_missing_host_fails() {
        let result = MqttBusBuilder::default().build().await;
        assert!(matches!(result, Err(BusError::Connection(_))));
    }

    #[tokio::test]
    async fn build_times_out_without_broker() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = MqttBus::builder()
            .host("127.0.0.1")
            .port(port)
            .connection_timeout(Duration::from_millis(300))
            .build()
            .await;

        assert!(matches!(result, Err(BusError::Connection(_))));
    }
}
