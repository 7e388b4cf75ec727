//! Daemon configuration.
//!
//! Loaded from an optional TOML file; every field has a default, so an empty
//! (or absent) file yields a working single-instance daemon:
//!
//! ```toml
//! snapshot_path = "snmpDevices.json"
//! probe_interval_secs = 5
//! reachability_timeout_ms = 1000
//! ping_timeout_secs = 1
//!
//! [bus]
//! kind = "mqtt"
//! host = "broker.local"
//! port = 1883
//! topic = "device_updates"
//! ```
//!
//! CLI flags and `FLEET_*` environment variables are applied on top by the
//! `cli` module.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fleet_protocol::DEFAULT_TOPIC;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::replication::MqttBusConfig;
use crate::snapshot::DEFAULT_SNAPSHOT_PATH;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Snapshot file read at startup and rewritten after every change.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,

    /// Seconds between liveness probes of one device.
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    /// Budget for the on-demand TCP reachability check.
    #[serde(default = "default_reachability_timeout_ms")]
    pub reachability_timeout_ms: u64,

    /// Seconds a single ICMP echo may take.
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,

    #[serde(default)]
    pub bus: BusConfig,
}

/// Which event bus carries replication events.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// In-process only; nothing leaves this daemon.
    #[default]
    Local,

    /// Shared MQTT broker.
    Mqtt,
}

/// Replication bus settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusConfig {
    #[serde(default)]
    pub kind: BusKind,

    #[serde(default = "default_bus_host")]
    pub host: String,

    #[serde(default = "default_bus_port")]
    pub port: u16,

    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

fn default_snapshot_path() -> PathBuf {
    PathBuf::from(DEFAULT_SNAPSHOT_PATH)
}

fn default_probe_interval_secs() -> u64 {
    5
}

fn default_reachability_timeout_ms() -> u64 {
    1000
}

fn default_ping_timeout_secs() -> u64 {
    1
}

fn default_bus_host() -> String {
    "localhost".to_string()
}

fn default_bus_port() -> u16 {
    1883
}

fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            probe_interval_secs: default_probe_interval_secs(),
            reachability_timeout_ms: default_reachability_timeout_ms(),
            ping_timeout_secs: default_ping_timeout_secs(),
            bus: BusConfig::default(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::default(),
            host: default_bus_host(),
            port: default_bus_port(),
            topic: default_topic(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl DaemonConfig {
    /// Reads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: DaemonConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.snapshot_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "snapshot_path",
                reason: "must not be empty".to_string(),
            });
        }
        if self.probe_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "probe_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.reachability_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "reachability_timeout_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.ping_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "ping_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        self.bus.validate()
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn reachability_timeout(&self) -> Duration {
        Duration::from_millis(self.reachability_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
}

impl BusConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "bus.topic",
                reason: "must not be empty".to_string(),
            });
        }
        if self.kind == BusKind::Mqtt {
            if self.host.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "bus.host",
                    reason: "required for the mqtt bus".to_string(),
                });
            }
            if self.port == 0 {
                return Err(ConfigError::Invalid {
                    field: "bus.port",
                    reason: "must be 1-65535".to_string(),
                });
            }
            // rumqttc rejects sub-second keep-alive intervals.
            if self.keep_alive_secs == 0 {
                return Err(ConfigError::Invalid {
                    field: "bus.keep_alive_secs",
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(ConfigError::Invalid {
                field: "bus.username",
                reason: "username and password must be set together".to_string(),
            });
        }
        Ok(())
    }

    /// Connection settings for `MqttBus`.
    pub fn mqtt(&self) -> MqttBusConfig {
        let credentials = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };

        MqttBusConfig {
            host: self.host.clone(),
            port: self.port,
            topic: self.topic.clone(),
            credentials,
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            connection_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = DaemonConfig::from_toml_str("").unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.snapshot_path, PathBuf::from("snmpDevices.json"));
        assert_eq!(config.probe_interval(), Duration::from_secs(5));
        assert_eq!(config.reachability_timeout(), Duration::from_secs(1));
        assert_eq!(config.bus.kind, BusKind::Local);
        assert_eq!(config.bus.topic, "device_updates");
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = DaemonConfig::from_toml_str(
            r#"
            snapshot_path = "/var/lib/fleetd/devices.json"

            [bus]
            kind = "mqtt"
            host = "broker.local"
            username = "fleet"
            password = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.snapshot_path, PathBuf::from("/var/lib/fleetd/devices.json"));
        assert_eq!(config.probe_interval_secs, 5);
        assert_eq!(config.bus.kind, BusKind::Mqtt);
        assert_eq!(config.bus.port, 1883);

        let mqtt = config.bus.mqtt();
        assert_eq!(mqtt.host, "broker.local");
        assert_eq!(mqtt.credentials, Some(("fleet".to_string(), "secret".to_string())));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = DaemonConfig::from_toml_str("probe_interval_secs = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "probe_interval_secs", .. }));
    }

    #[test]
    fn test_half_credentials_rejected() {
        let err = DaemonConfig::from_toml_str("[bus]\nusername = \"fleet\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "bus.username", .. }));
    }

    #[test]
    fn test_unknown_bus_kind_is_parse_error() {
        let err = DaemonConfig::from_toml_str("[bus]\nkind = \"amqp\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DaemonConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
