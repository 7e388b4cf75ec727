//! Device registry using the Actor pattern.
//!
//! The registry is the single source of truth for the fleet. It receives
//! commands via a tokio mpsc channel; replication events are its only
//! mutation path. Applying an event also drives the listener table and the
//! per-device liveness probes, and persists the snapshot after a change.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │  Bus consumer   │────▶│  RegistryActor  │────▶│ Broadcast Channel│
//! └─────────────────┘     └─────────────────┘     └──────────────────┘
//!         │                       │                       │
//!         │   RegistryCommand     │   RegistryEvent       │
//!         │   (mpsc channel)      │   (broadcast)         │
//!         ▼                       ▼                       ▼
//!    Apply add/edit/        BTreeMap<DeviceName,     Subscribers
//!    delete events          DeviceEntry> +
//!                           ListenerManager
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::sync::Arc;
use std::time::Duration;

use fleet_core::Device;
use tokio::sync::{broadcast, mpsc};

mod actor;
mod commands;
mod handle;

pub use actor::RegistryActor;
pub use commands::{ApplyOutcome, ApplyReport, RegistryCommand, RegistryError, RegistryEvent};
pub use handle::RegistryHandle;

use crate::monitor::{Pinger, SystemPing, PROBE_INTERVAL};
use crate::snapshot::SnapshotStore;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// Collaborators the registry actor owns.
#[derive(Clone)]
pub struct RegistryOptions {
    /// Persist after every change; `None` keeps the fleet in memory only
    pub snapshot: Option<SnapshotStore>,

    pub pinger: Arc<dyn Pinger>,

    /// Wait between liveness probes of one device
    pub probe_interval: Duration,
}

impl RegistryOptions {
    pub fn with_snapshot(mut self, store: SnapshotStore) -> Self {
        self.snapshot = Some(store);
        self
    }

    pub fn with_pinger(mut self, pinger: Arc<dyn Pinger>) -> Self {
        self.pinger = pinger;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            snapshot: None,
            pinger: Arc::new(SystemPing::default()),
            probe_interval: PROBE_INTERVAL,
        }
    }
}

/// Spawn the registry actor and return a handle for interaction.
///
/// This function:
/// 1. Creates command and event channels
/// 2. Spawns the RegistryActor on a tokio task
/// 3. Registers `initial` (typically the loaded snapshot), starting a
///    listener and a probe per device, before the first command is served
/// 4. Returns a RegistryHandle for client use
///
/// # Example
///
/// ```no_run
/// use fleetd::registry::{spawn_registry, RegistryOptions};
///
/// #[tokio::main]
/// async fn main() {
///     let handle = spawn_registry(Vec::new(), RegistryOptions::default());
///
///     let devices = handle.list().await;
///     assert!(devices.is_empty());
/// }
/// ```
pub fn spawn_registry(initial: Vec<Device>, options: RegistryOptions) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let mut actor = RegistryActor::new(cmd_rx, event_tx.clone(), options);
    tokio::spawn(async move {
        actor.bootstrap(initial).await;
        actor.run().await;
    });

    RegistryHandle::new(cmd_tx, event_tx)
}
