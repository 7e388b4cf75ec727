//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` provides a cheap-to-clone interface for sending commands
//! to the registry actor and subscribing to registry events.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use std::time::Duration;

use fleet_core::{Device, DeviceName, DeviceStatus};
use fleet_protocol::ReplicationEvent;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::commands::{ApplyReport, RegistryCommand, RegistryError, RegistryEvent};
use crate::monitor;

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with the registry actor.
///
/// This is a cheap-to-clone handle that can be shared across tasks.
/// All methods are async and communicate with the actor via channels.
///
/// # Usage
///
/// ```ignore
/// let handle = registry_handle.clone();
///
/// // Apply a replication event
/// let report = handle.apply(ReplicationEvent::add(device)).await?;
///
/// // Read a consistent snapshot
/// let devices = handle.list().await;
///
/// // Classify every device
/// let statuses = handle.status(Duration::from_secs(1)).await;
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    /// Command sender to the actor
    sender: mpsc::Sender<RegistryCommand>,

    /// Event broadcaster for subscribing to updates
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl RegistryHandle {
    pub fn new(sender: mpsc::Sender<RegistryCommand>, event_sender: broadcast::Sender<RegistryEvent>) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Apply a replication event to the registry.
    ///
    /// Returns once the registry, the listener table and the snapshot have
    /// all been updated. Listener and persistence failures are carried in the
    /// report; the registry change itself is never rolled back.
    ///
    /// # Errors
    ///
    /// - `RegistryError::InvalidDevice` if the event's device record is invalid
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn apply(&self, event: ReplicationEvent) -> Result<ApplyReport, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Apply {
                event: Box::new(event),
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Get a single device by name.
    ///
    /// Returns `None` if the device doesn't exist or if communication
    /// with the actor fails.
    pub async fn get(&self, name: &DeviceName) -> Option<Device> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Get {
                name: name.clone(),
                respond_to: tx,
            })
            .await
            .ok()?;

        rx.await.ok()?
    }

    /// Get every device, ordered by name.
    ///
    /// Returns an empty vector if communication with the actor fails.
    pub async fn list(&self) -> Vec<Device> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::List { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Get the ports that currently have a running listener.
    pub async fn active_ports(&self) -> Vec<u16> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::ActivePorts { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Classify every registered device as connected or disconnected.
    ///
    /// The checks run outside the actor, on the snapshot returned by `list`.
    pub async fn status(&self, limit: Duration) -> Vec<DeviceStatus> {
        monitor::status_report(self.list().await, limit).await
    }

    /// Stop every listener and probe and shut the actor down.
    ///
    /// Safe to call on an already stopped registry.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::Shutdown { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Subscribe to registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Check if the registry actor is still running.
    ///
    /// Returns `false` once the actor has shut down.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ApplyOutcome, ApplyReport};
    use fleet_protocol::EventKind;

    fn create_test_handle() -> (RegistryHandle, mpsc::Receiver<RegistryCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, _) = broadcast::channel(16);
        (RegistryHandle::new(cmd_tx, event_tx), cmd_rx)
    }

    #[tokio::test]
    async fn test_apply() {
        let (handle, mut rx) = create_test_handle();

        let cmd_handler = tokio::spawn(async move {
            if let Some(RegistryCommand::Apply { event, respond_to }) = rx.recv().await {
                assert_eq!(event.kind, EventKind::Add);
                assert_eq!(event.device.name.as_str(), "D1");
                let report = ApplyReport::new(event.kind, event.device.name.clone(), ApplyOutcome::Inserted);
                let _ = respond_to.send(Ok(report));
                return true;
            }
            false
        });

        let report = handle
            .apply(ReplicationEvent::add(Device::new("D1", "127.0.0.1", 9000, ["STATUS"])))
            .await
            .unwrap();
        assert_eq!(report.outcome, ApplyOutcome::Inserted);
        assert!(cmd_handler.await.unwrap());
    }

    #[tokio::test]
    async fn test_apply_channel_closed() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        let result = handle
            .apply(ReplicationEvent::add(Device::new("D1", "127.0.0.1", 9000, ["STATUS"])))
            .await;
        assert!(matches!(result, Err(RegistryError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_get() {
        let (handle, mut rx) = create_test_handle();

        tokio::spawn(async move {
            if let Some(RegistryCommand::Get { name, respond_to }) = rx.recv().await {
                let device = Device::new(name, "127.0.0.1", 9000, ["STATUS"]);
                let _ = respond_to.send(Some(device));
            }
        });

        let device = handle.get(&DeviceName::new("D1")).await.unwrap();
        assert_eq!(device.name.as_str(), "D1");
    }

    #[tokio::test]
    async fn test_list_returns_empty_on_closed_channel() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        assert!(handle.list().await.is_empty());
        assert!(handle.active_ports().await.is_empty());
        assert!(handle.get(&DeviceName::new("D1")).await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_ignores_closed_channel() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        // Should not panic or hang
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_is_connected() {
        let (handle, rx) = create_test_handle();

        assert!(handle.is_connected());

        drop(rx);
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let (handle, _rx) = create_test_handle();
        let mut subscriber = handle.subscribe();

        handle
            .event_sender
            .send(RegistryEvent::Removed {
                name: DeviceName::new("D1"),
            })
            .unwrap();

        let event = subscriber.recv().await.unwrap();
        assert_eq!(event.name().as_str(), "D1");
    }
}
