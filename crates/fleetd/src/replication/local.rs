//! In-process event bus.
//!
//! Clones share one set of subscriptions, so several registries in the same
//! process (tests, single-host deployments) replicate through it exactly as
//! they would through a broker.

use async_trait::async_trait;
use fleet_protocol::DEFAULT_TOPIC;
use tokio::sync::mpsc;
use tracing::debug;

use super::fanout::Fanout;
use super::{BusError, EventBus};

#[derive(Debug, Clone)]
pub struct LocalBus {
    topic: String,
    fanout: Fanout,
}

impl LocalBus {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            fanout: Fanout::default(),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.fanout.live()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC)
    }
}

#[async_trait]
impl EventBus for LocalBus {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish_payload(&self, payload: String) -> Result<(), BusError> {
        // Publishing to a topic nobody listens on is not an error on a real
        // broker either.
        let receivers = self.fanout.deliver(payload).await;
        debug!(topic = %self.topic, receivers, "Payload delivered");
        Ok(())
    }

    fn subscribe(&self) -> mpsc::Receiver<String> {
        self.fanout.subscribe()
    }
}
