//! Daemon assembly: snapshot, registry, bus and consumer wired together.

use std::sync::Arc;

use fleet_core::Device;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{BusKind, DaemonConfig};
use crate::monitor::SystemPing;
use crate::registry::{spawn_registry, RegistryHandle, RegistryOptions};
use crate::replication::{spawn_consumer, BusError, ConsumerStats, EventBus, LocalBus, MqttBus, Replicator};
use crate::snapshot::{SnapshotError, SnapshotStore};

/// Errors that prevent the daemon from starting.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// A running fleet daemon.
pub struct FleetDaemon {
    registry: RegistryHandle,
    replicator: Replicator,
    consumer: JoinHandle<ConsumerStats>,
    consumer_token: CancellationToken,

    /// Kept to disconnect cleanly on shutdown
    mqtt: Option<Arc<MqttBus>>,
}

impl FleetDaemon {
    /// Starts a daemon from configuration.
    ///
    /// Loads the snapshot, connects the configured bus, then brings up the
    /// registry (listeners and probes for every persisted device) and the
    /// replication consumer.
    ///
    /// # Errors
    ///
    /// - `DaemonError::Snapshot` if the snapshot exists but cannot be read
    /// - `DaemonError::Bus` if the MQTT broker cannot be reached
    pub async fn start(config: &DaemonConfig) -> Result<Self, DaemonError> {
        let store = SnapshotStore::new(config.snapshot_path.clone());
        let initial = store.load().await?;

        let options = RegistryOptions::default()
            .with_snapshot(store)
            .with_pinger(Arc::new(SystemPing::new(config.ping_timeout())))
            .with_probe_interval(config.probe_interval());

        let (bus, mqtt): (Arc<dyn EventBus>, Option<Arc<MqttBus>>) = match config.bus.kind {
            BusKind::Local => {
                let local: Arc<dyn EventBus> = Arc::new(LocalBus::new(config.bus.topic.clone()));
                (local, None)
            }
            BusKind::Mqtt => {
                let settings = config.bus.mqtt();
                let mut builder = MqttBus::builder()
                    .host(settings.host)
                    .port(settings.port)
                    .topic(settings.topic)
                    .keep_alive(settings.keep_alive)
                    .connection_timeout(settings.connection_timeout);
                if let Some((username, password)) = settings.credentials {
                    builder = builder.credentials(username, password);
                }
                let mqtt = Arc::new(builder.build().await?);
                let shared: Arc<dyn EventBus> = mqtt.clone();
                (shared, Some(mqtt))
            }
        };

        let mut daemon = Self::start_with_bus(initial, options, bus);
        daemon.mqtt = mqtt;
        Ok(daemon)
    }

    /// Starts a daemon on an already connected bus.
    pub fn start_with_bus(initial: Vec<Device>, options: RegistryOptions, bus: Arc<dyn EventBus>) -> Self {
        let registry = spawn_registry(initial, options);
        let consumer_token = CancellationToken::new();
        let consumer = spawn_consumer(bus.clone(), registry.clone(), consumer_token.clone());

        info!(topic = bus.topic(), "Fleet daemon started");

        Self {
            replicator: Replicator::new(registry.clone(), bus),
            registry,
            consumer,
            consumer_token,
            mqtt: None,
        }
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Mutation entry point: apply locally and broadcast.
    pub fn replicator(&self) -> &Replicator {
        &self.replicator
    }

    /// Runs until `shutdown` is cancelled, then stops everything.
    pub async fn run_until(self, shutdown: CancellationToken) -> ConsumerStats {
        shutdown.cancelled().await;
        info!("Shutdown requested");
        self.shutdown().await
    }

    /// Stops the consumer, every listener and probe, and the bus connection.
    pub async fn shutdown(self) -> ConsumerStats {
        self.consumer_token.cancel();
        let stats = match self.consumer.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "Replication consumer task failed");
                ConsumerStats::default()
            }
        };

        self.registry.shutdown().await;

        if let Some(mqtt) = &self.mqtt {
            mqtt.disconnect().await;
        }

        info!(
            applied = stats.applied,
            skipped = stats.skipped,
            "Fleet daemon stopped"
        );
        stats
    }
}
