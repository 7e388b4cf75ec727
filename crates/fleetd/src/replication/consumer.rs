//! Bus consumer: applies every delivered replication event to the registry.
//!
//! # Panic-Free Guarantees
//!
//! - Malformed payloads and rejected events are logged and skipped
//! - The loop only ends on cancellation, bus closure or registry shutdown

use std::sync::Arc;

use fleet_protocol::ReplicationEvent;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::EventBus;
use crate::registry::{RegistryError, RegistryHandle};

/// Counters reported when the consumer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Events handed to the registry and accepted
    pub applied: u64,

    /// Payloads that could not be parsed or were rejected
    pub skipped: u64,
}

/// Subscribes to `bus` and spawns the consume loop.
///
/// The subscription is taken before this returns, so any event published
/// afterwards is delivered to this consumer.
pub fn spawn_consumer(
    bus: Arc<dyn EventBus>,
    registry: RegistryHandle,
    cancel_token: CancellationToken,
) -> JoinHandle<ConsumerStats> {
    let mut receiver = bus.subscribe();
    let topic = bus.topic().to_string();

    tokio::spawn(async move {
        info!(topic = %topic, "Replication consumer started");
        let mut stats = ConsumerStats::default();

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                received = receiver.recv() => received,
            };

            let Some(payload) = received else {
                info!(topic = %topic, "Replication bus closed");
                break;
            };

            let event = match ReplicationEvent::from_json(&payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Skipping malformed replication event");
                    stats.skipped += 1;
                    continue;
                }
            };

            match registry.apply(event).await {
                Ok(report) => {
                    stats.applied += 1;
                    if let Some(e) = &report.listener_error {
                        warn!(device = %report.name, error = %e, "Replicated device has no listener");
                    }
                    if let Some(e) = &report.persist_error {
                        warn!(device = %report.name, error = %e, "Replicated change not persisted");
                    }
                    debug!(
                        event = %report.kind,
                        device = %report.name,
                        outcome = %report.outcome,
                        "Replicated event applied"
                    );
                }
                Err(RegistryError::ChannelClosed) => {
                    info!("Registry stopped, replication consumer exiting");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Replicated event rejected");
                    stats.skipped += 1;
                }
            }
        }

        info!(
            topic = %topic,
            applied = stats.applied,
            skipped = stats.skipped,
            "Replication consumer stopped"
        );
        stats
    })
}
