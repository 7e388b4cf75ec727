//! Replication of registry mutations across daemon instances.
//!
//! Every mutation is a `ReplicationEvent`. The origin applies it to its own
//! registry and publishes it on the shared bus; every instance (the origin
//! included) runs a consumer that applies each delivered event. Applying is
//! idempotent, so the origin's own echo converges to the same state.
//!
//! # Architecture
//!
//! ```text
//!  operator                      bus (topic "device_updates")
//! ┌────────────┐ publish ┌───────────────────────────────────────────┐
//! │ Replicator │────────▶│  LocalBus (in-process) / MqttBus (broker)  │
//! └─────┬──────┘         └───────┬───────────────────────┬───────────┘
//!       │ apply                  │ fan-out               │ fan-out
//!       ▼                        ▼                       ▼
//! ┌────────────┐          ┌────────────┐          ┌────────────┐
//! │ registry A │◀─────────│ consumer A │          │ consumer B │──▶ registry B
//! └────────────┘  apply   └────────────┘          └────────────┘
//! ```
//!
//! Delivery must be fan-out: each subscribed instance sees every event. The
//! MQTT bus gets it from the broker's topic semantics with one unique client
//! id per instance. Inside a process, each subscription has its own bounded
//! queue, and a full queue holds the publisher back rather than dropping.

mod consumer;
mod fanout;
mod local;
mod mqtt;

pub use consumer::{spawn_consumer, ConsumerStats};
pub use local::LocalBus;
pub use mqtt::{MqttBus, MqttBusBuilder, MqttBusConfig};

use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::Device;
use fleet_protocol::{EventKind, ReplicationEvent};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::registry::{ApplyReport, RegistryError, RegistryHandle};

/// Errors raised by an event bus.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("failed to encode event: {0}")]
    Encode(String),

    #[error("failed to publish on {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("bus connection failed: {0}")]
    Connection(String),
}

// ============================================================================
// Event Bus
// ============================================================================

/// A topic-based, fan-out message bus carrying replication payloads.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// The topic events are published on and consumed from.
    fn topic(&self) -> &str;

    /// Sends one raw payload. Fire-and-forget: no retry.
    async fn publish_payload(&self, payload: String) -> Result<(), BusError>;

    /// Returns a receiver for every payload delivered on the topic from now on.
    ///
    /// The receiver yields `None` once the bus is gone.
    fn subscribe(&self) -> mpsc::Receiver<String>;

    /// Serializes and publishes a replication event.
    async fn publish(&self, event: &ReplicationEvent) -> Result<(), BusError> {
        let payload = event.to_json().map_err(|e| BusError::Encode(e.to_string()))?;
        self.publish_payload(payload).await?;
        debug!(
            topic = self.topic(),
            event = %event.kind,
            device = %event.device.name,
            "Event published"
        );
        Ok(())
    }
}

// ============================================================================
// Replicator
// ============================================================================

/// Outcome of a replicated mutation.
///
/// The registry result and the publish side effect are reported separately;
/// a failed publish does not undo the local apply.
#[derive(Debug, Clone)]
pub struct MutationReport {
    pub applied: ApplyReport,
    pub publish_error: Option<BusError>,
}

impl MutationReport {
    /// Returns true if the apply and every side effect succeeded.
    pub fn is_clean(&self) -> bool {
        self.applied.is_clean() && self.publish_error.is_none()
    }
}

/// Mutation entry point for local callers: apply, then broadcast.
#[derive(Clone)]
pub struct Replicator {
    registry: RegistryHandle,
    bus: Arc<dyn EventBus>,
}

impl Replicator {
    pub fn new(registry: RegistryHandle, bus: Arc<dyn EventBus>) -> Self {
        Self { registry, bus }
    }

    /// Applies `event` to the local registry and publishes it.
    ///
    /// # Errors
    ///
    /// Returns the registry's error when the event is rejected; nothing is
    /// published in that case.
    pub async fn submit(&self, event: ReplicationEvent) -> Result<MutationReport, RegistryError> {
        let applied = self.registry.apply(event.clone()).await?;

        let publish_error = match self.bus.publish(&event).await {
            Ok(()) => None,
            Err(e) => {
                warn!(
                    event = %event.kind,
                    device = %event.device.name,
                    error = %e,
                    "Failed to publish replication event"
                );
                Some(e)
            }
        };

        Ok(MutationReport {
            applied,
            publish_error,
        })
    }

    pub async fn add(&self, device: Device) -> Result<MutationReport, RegistryError> {
        self.submit(ReplicationEvent::new(EventKind::Add, device)).await
    }

    pub async fn edit(&self, device: Device) -> Result<MutationReport, RegistryError> {
        self.submit(ReplicationEvent::new(EventKind::Edit, device)).await
    }

    pub async fn delete(&self, device: Device) -> Result<MutationReport, RegistryError> {
        self.submit(ReplicationEvent::new(EventKind::Delete, device)).await
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_error_display() {
        let err = BusError::Publish {
            topic: "device_updates".to_string(),
            reason: "not connected".to_string(),
        };
        assert_eq!(err.to_string(), "failed to publish on device_updates: not connected");
        assert!(BusError::Connection("refused".to_string()).to_string().contains("refused"));
    }

    #[tokio::test]
    async fn test_default_publish_encodes_event() {
        let bus = LocalBus::new("device_updates");
        let mut rx = bus.subscribe();

        let event = ReplicationEvent::add(Device::new("D1", "127.0.0.1", 9000, ["STATUS"]));
        bus.publish(&event).await.unwrap();

        let payload = rx.recv().await.unwrap();
        assert_eq!(ReplicationEvent::from_json(&payload).unwrap(), event);
    }
}
