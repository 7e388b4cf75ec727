//! Device domain entity and its natural key.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::error::{DomainError, DomainResult};

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique, case-sensitive name of a device.
///
/// The name is the natural key of the registry; there is no synthetic ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceName(String);

impl DeviceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeviceName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DeviceName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for DeviceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Device
// ============================================================================

/// A named network endpoint with a host, a port and an accepted command vocabulary.
///
/// Field names on the wire follow the snapshot and bus format
/// (`deviceName`, `IPHost`, `port`, `commands`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "deviceName")]
    pub name: DeviceName,

    /// IP address or resolvable hostname.
    #[serde(rename = "IPHost")]
    pub host: String,

    pub port: u16,

    /// Ordered command vocabulary. Membership is tested by exact match.
    #[serde(default)]
    pub commands: Vec<String>,
}

impl Device {
    /// Creates a device, trimming every command.
    pub fn new(
        name: impl Into<DeviceName>,
        host: impl Into<String>,
        port: u16,
        commands: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            commands: commands
                .into_iter()
                .map(|c| c.into().trim().to_string())
                .collect(),
        }
    }

    /// Validates the record and normalizes its command list.
    ///
    /// Records arriving from the bus or the snapshot store are not guaranteed
    /// to be trimmed, so every mutation path runs them through here.
    pub fn validated(mut self) -> DomainResult<Self> {
        if self.name.is_empty() {
            return Err(DomainError::InvalidFieldValue {
                field: "deviceName".to_string(),
                value: String::new(),
                expected: "a non-empty name".to_string(),
            });
        }

        if self.host.trim().is_empty() {
            return Err(DomainError::InvalidFieldValue {
                field: "IPHost".to_string(),
                value: self.host,
                expected: "an IP address or hostname".to_string(),
            });
        }

        // Hosts are handed to `ping` as an argument.
        if self.host.trim_start().starts_with('-') {
            return Err(DomainError::InvalidFieldValue {
                field: "IPHost".to_string(),
                value: self.host,
                expected: "an IP address or hostname".to_string(),
            });
        }

        if self.port == 0 {
            return Err(DomainError::InvalidFieldValue {
                field: "port".to_string(),
                value: "0".to_string(),
                expected: "1-65535".to_string(),
            });
        }

        self.host = self.host.trim().to_string();
        for command in &mut self.commands {
            let trimmed = command.trim();
            if trimmed.len() != command.len() {
                *command = trimmed.to_string();
            }
        }

        Ok(self)
    }

    /// Returns true if the listener for `self` must be rebound to serve `other`.
    ///
    /// Host and commands are captured by the running listener, so any change
    /// to them requires a restart even when the port stays the same.
    #[must_use]
    pub fn listener_differs(&self, other: &Device) -> bool {
        self.port != other.port || self.host != other.host || self.commands != other.commands
    }
}

/// Parses an operator-supplied comma-separated command list.
///
/// Each entry is trimmed; empty entries are dropped.
pub fn parse_command_list(raw: &str) -> Vec<String> {
    let commands: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(ToString::to_string)
        .collect();

    debug!(count = commands.len(), "Parsed command list");
    commands
}
