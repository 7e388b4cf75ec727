//! Per-subscriber delivery queues shared by the bus implementations.
//!
//! Every subscription owns a bounded queue. Delivery waits for room in each
//! queue, so a slow consumer slows the publisher down instead of losing
//! events.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

/// Payloads buffered per subscriber before delivery waits.
pub(crate) const SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default)]
pub(crate) struct Fanout {
    subscribers: Arc<RwLock<Vec<mpsc::Sender<String>>>>,
}

impl Fanout {
    pub(crate) fn subscribe(&self) -> mpsc::Receiver<String> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.subscribers.write().push(sender);
        receiver
    }

    /// Delivers `payload` to every live subscriber and returns how many got it.
    ///
    /// Subscribers whose receiver is gone are pruned.
    pub(crate) async fn deliver(&self, payload: String) -> usize {
        let senders: Vec<_> = self.subscribers.read().clone();

        let mut delivered = 0;
        for sender in &senders {
            if sender.send(payload.clone()).await.is_ok() {
                delivered += 1;
            }
        }

        if delivered < senders.len() {
            self.subscribers.write().retain(|s| !s.is_closed());
            debug!(pruned = senders.len() - delivered, "Dropped closed subscriptions");
        }
        delivered
    }

    /// Number of subscriptions whose receiver is still alive.
    pub(crate) fn live(&self) -> usize {
        self.subscribers.read().iter().filter(|s| !s.is_closed()).count()
    }
}
