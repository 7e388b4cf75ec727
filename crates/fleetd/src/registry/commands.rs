//! Registry actor commands, errors, reports and events.
//!
//! This module defines the message types for communicating with the `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that reject a command outright
//! - `ApplyReport`: Outcome of applying a replication event, side effects included
//! - `RegistryEvent`: Events published by the registry for subscribers

use fleet_core::{Device, DeviceName};
use fleet_protocol::{EventKind, ReplicationEvent};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::listener::ListenerError;
use crate::snapshot::SnapshotError;

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each command uses a oneshot channel for the response, enabling
/// request-response patterns in async code without blocking.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Apply a replication event. The single mutation entry point.
    ///
    /// # Errors
    /// - `RegistryError::InvalidDevice` if the event carries an invalid record
    Apply {
        event: Box<ReplicationEvent>,
        respond_to: oneshot::Sender<Result<ApplyReport, RegistryError>>,
    },

    /// Get a single device by name.
    Get {
        name: DeviceName,
        respond_to: oneshot::Sender<Option<Device>>,
    },

    /// Get a consistent snapshot of every device, ordered by name.
    List {
        respond_to: oneshot::Sender<Vec<Device>>,
    },

    /// Get the ports with a running listener.
    ActivePorts {
        respond_to: oneshot::Sender<Vec<u16>>,
    },

    /// Stop every listener and probe, then stop the actor.
    Shutdown { respond_to: oneshot::Sender<()> },
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The event carried a device record that failed validation.
    #[error("invalid device: {0}")]
    InvalidDevice(String),

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

// ============================================================================
// Apply Reports
// ============================================================================

/// What an apply did to the registry itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new device was inserted.
    Inserted,

    /// An existing device record was replaced.
    Updated,

    /// The device was removed.
    Removed,

    /// The record was already present and identical (duplicate delivery).
    Unchanged,

    /// Edit or delete of a device that does not exist.
    Ignored,
}

impl ApplyOutcome {
    /// Returns true if the registry content changed.
    pub fn is_change(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated | Self::Removed)
    }
}

impl std::fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inserted => write!(f, "inserted"),
            Self::Updated => write!(f, "updated"),
            Self::Removed => write!(f, "removed"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Ignored => write!(f, "ignored"),
        }
    }
}

/// Result of a successful apply.
///
/// The registry mutation is never rolled back; listener and persistence
/// failures are reported alongside it.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub kind: EventKind,
    pub name: DeviceName,
    pub outcome: ApplyOutcome,

    /// Set when the device's listener could not be started.
    pub listener_error: Option<ListenerError>,

    /// Set when the snapshot could not be written after the change.
    pub persist_error: Option<SnapshotError>,
}

impl ApplyReport {
    pub(crate) fn new(kind: EventKind, name: DeviceName, outcome: ApplyOutcome) -> Self {
        Self {
            kind,
            name,
            outcome,
            listener_error: None,
            persist_error: None,
        }
    }

    /// Returns true if every side effect succeeded.
    pub fn is_clean(&self) -> bool {
        self.listener_error.is_none() && self.persist_error.is_none()
    }
}

// ============================================================================
// Registry Events
// ============================================================================

/// Events published by the registry to subscribers.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A device was inserted.
    Added { device: Box<Device> },

    /// A device record was replaced.
    Updated { device: Box<Device> },

    /// A device was removed.
    Removed { name: DeviceName },
}

impl RegistryEvent {
    pub fn name(&self) -> &DeviceName {
        match self {
            Self::Added { device } | Self::Updated { device } => &device.name,
            Self::Removed { name } => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::InvalidDevice("Invalid port".to_string());
        assert_eq!(err.to_string(), "invalid device: Invalid port");

        let err = RegistryError::ChannelClosed;
        assert_eq!(err.to_string(), "response channel closed");
    }

    #[test]
    fn test_outcome_is_change() {
        assert!(ApplyOutcome::Inserted.is_change());
        assert!(ApplyOutcome::Updated.is_change());
        assert!(ApplyOutcome::Removed.is_change());
        assert!(!ApplyOutcome::Unchanged.is_change());
        assert!(!ApplyOutcome::Ignored.is_change());
    }

    #[test]
    fn test_report_is_clean() {
        let mut report = ApplyReport::new(EventKind::Add, DeviceName::new("D1"), ApplyOutcome::Inserted);
        assert!(report.is_clean());

        report.listener_error = Some(ListenerError::PortTaken {
            port: 9000,
            owner: DeviceName::new("D0"),
        });
        assert!(!report.is_clean());
    }

    #[test]
    fn test_event_name() {
        let device = Device::new("D1", "127.0.0.1", 9000, ["STATUS"]);
        let added = RegistryEvent::Added {
            device: Box::new(device),
        };
        assert_eq!(added.name().as_str(), "D1");

        let removed = RegistryEvent::Removed {
            name: DeviceName::new("D2"),
        };
        assert_eq!(removed.name().as_str(), "D2");
    }

    #[tokio::test]
    async fn test_command_channel_closed_error() {
        let (tx, rx) = oneshot::channel::<Result<ApplyReport, RegistryError>>();
        drop(tx);
        assert!(rx.await.is_err());
    }
}
