//! Snapshot store: durable, full-overwrite persistence of the device list.
//!
//! The document is written to a sibling temporary file and renamed over the
//! target, so readers never observe a half-written snapshot.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fleet_core::Device;
use fleet_protocol::{decode_snapshot, encode_snapshot};
use thiserror::Error;
use tracing::{debug, info};

/// Default snapshot file name, relative to the working directory.
pub const DEFAULT_SNAPSHOT_PATH: &str = "snmpDevices.json";

/// Errors that can occur while reading or writing the snapshot.
#[derive(Debug, Clone, Error)]
pub enum SnapshotError {
    #[error("failed to read snapshot {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to write snapshot {path}: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("invalid snapshot {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// File-backed snapshot of the full device list.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted device list.
    ///
    /// A missing file is an empty fleet, not an error.
    pub async fn load(&self) -> Result<Vec<Device>, SnapshotError> {
        let document = match tokio::fs::read_to_string(&self.path).await {
            Ok(document) => document,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No snapshot found, starting with an empty fleet");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(SnapshotError::Read {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })
            }
        };

        let devices = decode_snapshot(&document).map_err(|e| SnapshotError::Invalid {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        info!(
            path = %self.path.display(),
            devices = devices.len(),
            "Snapshot loaded"
        );
        Ok(devices)
    }

    /// Overwrites the snapshot with the full device list.
    pub async fn save(&self, devices: &[Device]) -> Result<(), SnapshotError> {
        let document = encode_snapshot(devices).map_err(|e| self.write_error(e))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.write_error(e))?;
            }
        }

        let tmp_path = self.tmp_path();
        tokio::fs::write(&tmp_path, document.as_bytes())
            .await
            .map_err(|e| self.write_error(e))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| self.write_error(e))?;

        debug!(
            path = %self.path.display(),
            devices = devices.len(),
            "Snapshot written"
        );
        Ok(())
    }

    fn write_error(&self, err: impl std::fmt::Display) -> SnapshotError {
        SnapshotError::Write {
            path: self.path.clone(),
            reason: err.to_string(),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_PATH)
    }
}
