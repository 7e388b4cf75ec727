//! Replication events carried on the shared bus.

use fleet_core::Device;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProtocolError;

/// Default bus topic for replication events.
pub const DEFAULT_TOPIC: &str = "device_updates";

/// Kind of registry mutation described by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Add,
    Edit,
    Delete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Edit => "edit",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged add/edit/delete record broadcast to keep registries consistent.
///
/// Wire shape: `{"event": "add", "device": {"deviceName": .., "IPHost": .., "port": .., "commands": [..]}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationEvent {
    #[serde(rename = "event")]
    pub kind: EventKind,
    pub device: Device,
}

impl ReplicationEvent {
    pub fn new(kind: EventKind, device: Device) -> Self {
        Self { kind, device }
    }

    pub fn add(device: Device) -> Self {
        Self::new(EventKind::Add, device)
    }

    pub fn edit(device: Device) -> Self {
        Self::new(EventKind::Edit, device)
    }

    pub fn delete(device: Device) -> Self {
        Self::new(EventKind::Delete, device)
    }

    /// Serializes the event to its bus payload.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::encode("replication event", e))
    }

    /// Parses and validates a bus payload.
    ///
    /// The device record is normalized (trimmed commands) on the way in.
    pub fn from_json(payload: &str) -> Result<Self, ProtocolError> {
        let event: ReplicationEvent = serde_json::from_str(payload)
            .map_err(|e| ProtocolError::malformed("replication event", e))?;

        let device = event
            .device
            .validated()
            .map_err(|e| ProtocolError::InvalidDevice {
                what: "replication event",
                reason: e.to_string(),
            })?;

        Ok(Self {
            kind: event.kind,
            device,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_shape() {
        let event = ReplicationEvent::add(Device::new("D1", "127.0.0.1", 9000, ["STATUS"]));
        let value: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(value["event"], "add");
        assert_eq!(value["device"]["deviceName"], "D1");
        assert_eq!(value["device"]["IPHost"], "127.0.0.1");
        assert_eq!(value["device"]["port"], 9000);
        assert_eq!(value["device"]["commands"][0], "STATUS");
    }

    #[test]
    fn test_parse_payload_from_other_instance() {
        let payload = r#"{"event": "edit", "device": {"deviceName": "D1", "IPHost": "10.0.0.2", "port": 9001, "commands": ["STATUS ", " RESET"]}}"#;
        let event = ReplicationEvent::from_json(payload).unwrap();

        assert_eq!(event.kind, EventKind::Edit);
        assert_eq!(event.device.port, 9001);
        assert_eq!(event.device.commands, vec!["STATUS", "RESET"]);
    }

    #[test]
    fn test_unknown_kind_is_malformed() {
        let payload = r#"{"event": "rename", "device": {"deviceName": "D1", "IPHost": "h", "port": 1, "commands": []}}"#;
        let err = ReplicationEvent::from_json(payload).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            ReplicationEvent::from_json("not json").unwrap_err(),
            ProtocolError::Malformed { .. }
        ));
        assert!(matches!(
            ReplicationEvent::from_json(r#"{"event": "add"}"#).unwrap_err(),
            ProtocolError::Malformed { .. }
        ));
    }

    #[test]
    fn test_out_of_range_port_is_rejected() {
        let too_big = r#"{"event": "add", "device": {"deviceName": "D1", "IPHost": "h", "port": 70000, "commands": []}}"#;
        assert!(ReplicationEvent::from_json(too_big).is_err());

        let zero = r#"{"event": "add", "device": {"deviceName": "D1", "IPHost": "h", "port": 0, "commands": []}}"#;
        assert!(matches!(
            ReplicationEvent::from_json(zero).unwrap_err(),
            ProtocolError::InvalidDevice { .. }
        ));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(EventKind::Add.to_string(), "add");
        assert_eq!(EventKind::Edit.to_string(), "edit");
        assert_eq!(EventKind::Delete.to_string(), "delete");
    }
}
