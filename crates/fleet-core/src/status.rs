//! Reachability status values reported to the administrative surface.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::DeviceName;

/// Result of an on-demand reachability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Connected,
    Disconnected,
}

impl ConnectivityState {
    /// Maps a boolean check result to a state.
    pub fn from_reachable(reachable: bool) -> Self {
        if reachable {
            Self::Connected
        } else {
            Self::Disconnected
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One row of the device status listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    #[serde(rename = "deviceName")]
    pub name: DeviceName,
    pub status: ConnectivityState,
}
