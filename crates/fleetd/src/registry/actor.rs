//! Registry actor - owns all device state and processes commands.
//!
//! The RegistryActor is the single owner of the device map, the listener
//! table and the per-device probe loops. It receives commands via an mpsc
//! channel and publishes events via broadcast.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Listener and snapshot failures are reported in the `ApplyReport`
//! - Channel send failures are logged but don't panic

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::{Device, DeviceName};
use fleet_protocol::{EventKind, ReplicationEvent};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::commands::{ApplyOutcome, ApplyReport, RegistryCommand, RegistryError, RegistryEvent};
use super::RegistryOptions;
use crate::listener::ListenerManager;
use crate::monitor::{spawn_probe_task, Pinger};
use crate::snapshot::SnapshotStore;

/// A registered device together with the token of its liveness probe.
struct DeviceEntry {
    device: Device,
    probe: CancellationToken,
}

// ============================================================================
// Registry Actor
// ============================================================================

/// The registry actor - owns all device state.
///
/// Commands are processed strictly one at a time, so every mutation of the
/// device map and the listener table is serialized.
pub struct RegistryActor {
    /// Command receiver
    receiver: mpsc::Receiver<RegistryCommand>,

    /// Device storage keyed by name; ordered so snapshots are stable
    devices: BTreeMap<DeviceName, DeviceEntry>,

    listeners: ListenerManager,

    /// Where to persist after a change; `None` keeps the fleet in memory
    snapshot: Option<SnapshotStore>,

    pinger: Arc<dyn Pinger>,
    probe_interval: Duration,

    /// Parent of every probe token
    probe_root: CancellationToken,

    /// Event publisher for subscribers
    event_publisher: broadcast::Sender<RegistryEvent>,
}

impl RegistryActor {
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        event_publisher: broadcast::Sender<RegistryEvent>,
        options: RegistryOptions,
    ) -> Self {
        Self {
            receiver,
            devices: BTreeMap::new(),
            listeners: ListenerManager::new(),
            snapshot: options.snapshot,
            pinger: options.pinger,
            probe_interval: options.probe_interval,
            probe_root: CancellationToken::new(),
            event_publisher,
        }
    }

    /// Registers the persisted fleet and starts its listeners and probes.
    ///
    /// Nothing is written back; the devices came from the snapshot.
    pub async fn bootstrap(&mut self, initial: Vec<Device>) {
        let count = initial.len();
        for device in initial {
            if self.devices.contains_key(&device.name) {
                warn!(device = %device.name, "Duplicate device in snapshot, keeping the last one");
            }
            if let Err(e) = self.listeners.ensure(&device).await {
                warn!(device = %device.name, error = %e, "Listener not started");
            }
            self.insert_entry(device);
        }

        info!(
            devices = count,
            listeners = self.listeners.active_ports().len(),
            "Registry bootstrapped"
        );
    }

    /// Runs the actor event loop.
    ///
    /// Processes commands until a shutdown command arrives or the channel
    /// closes (all senders dropped). Either way every listener and probe is
    /// stopped before this returns.
    pub async fn run(mut self) {
        info!("Registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            if let RegistryCommand::Shutdown { respond_to } = cmd {
                self.stop_all().await;
                let _ = respond_to.send(());
                info!(devices = self.devices.len(), "Registry actor shut down");
                return;
            }
            self.handle_command(cmd).await;
        }

        self.stop_all().await;
        info!(devices = self.devices.len(), "Registry actor stopped");
    }

    /// Dispatches a command to the appropriate handler.
    async fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Apply { event, respond_to } => {
                let result = self.handle_apply(*event).await;
                // Ignore send error - client may have dropped the receiver
                let _ = respond_to.send(result);
            }
            RegistryCommand::Get { name, respond_to } => {
                let _ = respond_to.send(self.handle_get(&name));
            }
            RegistryCommand::List { respond_to } => {
                let _ = respond_to.send(self.handle_list());
            }
            RegistryCommand::ActivePorts { respond_to } => {
                let _ = respond_to.send(self.listeners.active_ports());
            }
            RegistryCommand::Shutdown { respond_to } => {
                self.stop_all().await;
                let _ = respond_to.send(());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Apply
    // ------------------------------------------------------------------------

    async fn handle_apply(&mut self, event: ReplicationEvent) -> Result<ApplyReport, RegistryError> {
        let kind = event.kind;
        let device = event
            .device
            .validated()
            .map_err(|e| RegistryError::InvalidDevice(e.to_string()))?;

        let mut report = match kind {
            EventKind::Add => self.upsert(kind, device).await,
            EventKind::Edit if !self.devices.contains_key(&device.name) => {
                info!(device = %device.name, "Edit of unknown device ignored");
                ApplyReport::new(kind, device.name, ApplyOutcome::Ignored)
            }
            EventKind::Edit => self.upsert(kind, device).await,
            EventKind::Delete => self.remove(device.name).await,
        };

        if report.outcome.is_change() {
            report.persist_error = self.persist().await;
        }

        debug!(
            event = %kind,
            device = %report.name,
            outcome = %report.outcome,
            "Event applied"
        );
        Ok(report)
    }

    /// Inserts or replaces a device and realizes it on the listener table.
    async fn upsert(&mut self, kind: EventKind, device: Device) -> ApplyReport {
        let name = device.name.clone();
        let outcome = match self.devices.get(&name) {
            None => ApplyOutcome::Inserted,
            Some(entry) if entry.device == device => ApplyOutcome::Unchanged,
            Some(_) => ApplyOutcome::Updated,
        };

        let mut report = ApplyReport::new(kind, name.clone(), outcome);
        let port = device.port;
        let previous_port = self.listeners.port_of(&name);

        // Runs for unchanged records too, so a redelivered event retries a
        // bind that failed earlier.
        if let Err(e) = self.listeners.ensure(&device).await {
            warn!(device = %name, port = device.port, error = %e, "Listener not started");
            report.listener_error = Some(e);
        }

        match outcome {
            ApplyOutcome::Inserted => {
                info!(device = %name, host = %device.host, port = device.port, "Device added");
                self.insert_entry(device.clone());
                self.publish_event(RegistryEvent::Added {
                    device: Box::new(device),
                });
            }
            ApplyOutcome::Updated => {
                info!(device = %name, host = %device.host, port = device.port, "Device updated");
                self.replace_entry(device.clone());
                self.publish_event(RegistryEvent::Updated {
                    device: Box::new(device),
                });
            }
            _ => debug!(device = %name, "Device unchanged"),
        }

        if let Some(previous) = previous_port.filter(|&p| p != port) {
            self.adopt_freed_port(previous).await;
        }

        report
    }

    async fn remove(&mut self, name: DeviceName) -> ApplyReport {
        let Some(entry) = self.devices.remove(&name) else {
            debug!(device = %name, "Delete of unknown device ignored");
            return ApplyReport::new(EventKind::Delete, name, ApplyOutcome::Ignored);
        };

        entry.probe.cancel();
        if let Some(port) = self.listeners.port_of(&name) {
            self.listeners.stop(port).await;
            self.adopt_freed_port(port).await;
        }

        info!(device = %name, port = entry.device.port, "Device removed");
        self.publish_event(RegistryEvent::Removed { name: name.clone() });
        ApplyReport::new(EventKind::Delete, name, ApplyOutcome::Removed)
    }

    /// Starts a listener on `port` for the first device left waiting on it.
    ///
    /// A device whose port was held by another device has no listener; it
    /// gets one as soon as that port is released.
    async fn adopt_freed_port(&mut self, port: u16) {
        if self.listeners.is_running(port) {
            return;
        }

        let waiting: Vec<Device> = self
            .devices
            .values()
            .filter(|entry| entry.device.port == port && self.listeners.port_of(&entry.device.name).is_none())
            .map(|entry| entry.device.clone())
            .collect();

        for device in waiting {
            match self.listeners.ensure(&device).await {
                Ok(()) => {
                    info!(device = %device.name, port, "Listener started on released port");
                    return;
                }
                Err(e) => debug!(device = %device.name, port, error = %e, "Released port still unavailable"),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Entries and probes
    // ------------------------------------------------------------------------

    fn insert_entry(&mut self, device: Device) {
        let probe = self.start_probe(&device);
        if let Some(previous) = self.devices.insert(
            device.name.clone(),
            DeviceEntry {
                device,
                probe,
            },
        ) {
            previous.probe.cancel();
        }
    }

    /// Replaces the record; the probe is restarted only when the host moved.
    fn replace_entry(&mut self, device: Device) {
        let Some(entry) = self.devices.get_mut(&device.name) else {
            self.insert_entry(device);
            return;
        };

        if entry.device.host != device.host {
            entry.probe.cancel();
            let probe = self.probe_root.child_token();
            spawn_probe_task(&device, self.pinger.clone(), self.probe_interval, probe.clone());
            entry.probe = probe;
        }
        entry.device = device;
    }

    fn start_probe(&self, device: &Device) -> CancellationToken {
        let probe = self.probe_root.child_token();
        spawn_probe_task(device, self.pinger.clone(), self.probe_interval, probe.clone());
        probe
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    fn handle_get(&self, name: &DeviceName) -> Option<Device> {
        self.devices.get(name).map(|entry| entry.device.clone())
    }

    fn handle_list(&self) -> Vec<Device> {
        self.devices.values().map(|entry| entry.device.clone()).collect()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    // ------------------------------------------------------------------------
    // Side effects
    // ------------------------------------------------------------------------

    async fn persist(&self) -> Option<crate::snapshot::SnapshotError> {
        let store = self.snapshot.as_ref()?;
        match store.save(&self.handle_list()).await {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "Failed to persist device snapshot");
                Some(e)
            }
        }
    }

    fn publish_event(&self, event: RegistryEvent) {
        // No subscribers is fine
        if self.event_publisher.send(event).is_err() {
            debug!("No registry event subscribers");
        }
    }

    async fn stop_all(&mut self) {
        self.probe_root.cancel();
        self.listeners.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::ProbeError;
    use async_trait::async_trait;
    use tokio::sync::oneshot;

    struct SilentPinger;

    #[async_trait]
    impl Pinger for SilentPinger {
        async fn ping(&self, _host: &str) -> Result<(), ProbeError> {
            Ok(())
        }
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn create_actor(
        snapshot: Option<SnapshotStore>,
    ) -> (mpsc::Sender<RegistryCommand>, RegistryActor, broadcast::Receiver<RegistryEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = broadcast::channel(16);
        let options = RegistryOptions {
            snapshot,
            pinger: Arc::new(SilentPinger),
            probe_interval: Duration::from_secs(60),
        };
        let actor = RegistryActor::new(cmd_rx, event_tx, options);
        (cmd_tx, actor, event_rx)
    }

    async fn apply(actor: &mut RegistryActor, event: ReplicationEvent) -> Result<ApplyReport, RegistryError> {
        let (tx, rx) = oneshot::channel();
        actor
            .handle_command(RegistryCommand::Apply {
                event: Box::new(event),
                respond_to: tx,
            })
            .await;
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_add_device() {
        let (cmd_tx, mut actor, mut event_rx) = create_actor(None);
        let port = free_port();

        let (respond_tx, respond_rx) = oneshot::channel();
        cmd_tx
            .send(RegistryCommand::Apply {
                event: Box::new(ReplicationEvent::add(Device::new("D1", "127.0.0.1", port, ["STATUS"]))),
                respond_to: respond_tx,
            })
            .await
            .unwrap();

        // Process the command manually (actor not running in background)
        if let Some(cmd) = actor.receiver.recv().await {
            actor.handle_command(cmd).await;
        }

        let report = respond_rx.await.unwrap().unwrap();
        assert_eq!(report.outcome, ApplyOutcome::Inserted);
        assert!(report.is_clean());
        assert_eq!(actor.device_count(), 1);
        assert_eq!(actor.listeners.active_ports(), vec![port]);

        let event = event_rx.try_recv().unwrap();
        assert!(matches!(event, RegistryEvent::Added { .. }));

        actor.stop_all().await;
    }

    #[tokio::test]
    async fn test_duplicate_add_is_unchanged() {
        let (_, mut actor, mut event_rx) = create_actor(None);
        let device = Device::new("D1", "127.0.0.1", free_port(), ["STATUS"]);

        apply(&mut actor, ReplicationEvent::add(device.clone())).await.unwrap();
        let report = apply(&mut actor, ReplicationEvent::add(device)).await.unwrap();

        assert_eq!(report.outcome, ApplyOutcome::Unchanged);
        assert!(report.listener_error.is_none());
        assert_eq!(actor.device_count(), 1);

        // Only the first add produced an event
        assert!(event_rx.try_recv().is_ok());
        assert!(event_rx.try_recv().is_err());

        actor.stop_all().await;
    }

    #[tokio::test]
    async fn test_edit_unknown_is_ignored() {
        let (_, mut actor, _) = create_actor(None);
        let port = free_port();

        let report = apply(
            &mut actor,
            ReplicationEvent::edit(Device::new("ghost", "127.0.0.1", port, ["STATUS"])),
        )
        .await
        .unwrap();

        assert_eq!(report.outcome, ApplyOutcome::Ignored);
        assert_eq!(actor.device_count(), 0);
        assert!(actor.listeners.active_ports().is_empty());
    }

    #[tokio::test]
    async fn test_delete_unknown_is_ignored() {
        let (_, mut actor, _) = create_actor(None);

        let report = apply(
            &mut actor,
            ReplicationEvent::delete(Device::new("ghost", "127.0.0.1", 9000, Vec::<String>::new())),
        )
        .await
        .unwrap();

        assert_eq!(report.outcome, ApplyOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_delete_uses_registered_port() {
        let (_, mut actor, _) = create_actor(None);
        let port = free_port();

        apply(&mut actor, ReplicationEvent::add(Device::new("D1", "127.0.0.1", port, ["STATUS"])))
            .await
            .unwrap();

        // The delete record may carry stale fields; the name is what counts.
        let report = apply(
            &mut actor,
            ReplicationEvent::delete(Device::new("D1", "127.0.0.1", 1, Vec::<String>::new())),
        )
        .await
        .unwrap();

        assert_eq!(report.outcome, ApplyOutcome::Removed);
        assert_eq!(actor.device_count(), 0);
        assert!(actor.listeners.active_ports().is_empty());
    }

    #[tokio::test]
    async fn test_edit_moves_listener() {
        let (_, mut actor, mut event_rx) = create_actor(None);
        let old_port = free_port();
        let new_port = free_port();

        apply(&mut actor, ReplicationEvent::add(Device::new("D1", "127.0.0.1", old_port, ["STATUS"])))
            .await
            .unwrap();
        let report = apply(
            &mut actor,
            ReplicationEvent::edit(Device::new("D1", "127.0.0.1", new_port, ["STATUS"])),
        )
        .await
        .unwrap();

        assert_eq!(report.outcome, ApplyOutcome::Updated);
        assert_eq!(actor.listeners.active_ports(), vec![new_port]);
        assert_eq!(actor.handle_get(&DeviceName::new("D1")).unwrap().port, new_port);

        let _added = event_rx.try_recv().unwrap();
        let updated = event_rx.try_recv().unwrap();
        assert!(matches!(updated, RegistryEvent::Updated { .. }));

        actor.stop_all().await;
    }

    #[tokio::test]
    async fn test_port_taken_keeps_registry_entry() {
        let (_, mut actor, _) = create_actor(None);
        let port = free_port();

        apply(&mut actor, ReplicationEvent::add(Device::new("D1", "127.0.0.1", port, ["STATUS"])))
            .await
            .unwrap();
        let report = apply(&mut actor, ReplicationEvent::add(Device::new("D2", "127.0.0.1", port, ["PING"])))
            .await
            .unwrap();

        assert_eq!(report.outcome, ApplyOutcome::Inserted);
        assert!(matches!(
            report.listener_error,
            Some(crate::listener::ListenerError::PortTaken { .. })
        ));
        assert_eq!(actor.device_count(), 2);
        assert_eq!(actor.listeners.port_of(&DeviceName::new("D1")), Some(port));

        actor.stop_all().await;
    }

    #[tokio::test]
    async fn test_waiting_device_takes_port_on_delete() {
        let (_, mut actor, _) = create_actor(None);
        let port = free_port();

        apply(&mut actor, ReplicationEvent::add(Device::new("D1", "127.0.0.1", port, ["STATUS"])))
            .await
            .unwrap();
        apply(&mut actor, ReplicationEvent::add(Device::new("D2", "127.0.0.1", port, ["PING"])))
            .await
            .unwrap();
        assert_eq!(actor.listeners.port_of(&DeviceName::new("D2")), None);

        apply(&mut actor, ReplicationEvent::delete(Device::new("D1", "127.0.0.1", port, Vec::<String>::new())))
            .await
            .unwrap();

        assert_eq!(actor.listeners.port_of(&DeviceName::new("D2")), Some(port));

        actor.stop_all().await;
    }

    #[tokio::test]
    async fn test_waiting_device_takes_port_on_move() {
        let (_, mut actor, _) = create_actor(None);
        let (port, other_port) = (free_port(), free_port());

        apply(&mut actor, ReplicationEvent::add(Device::new("D1", "127.0.0.1", port, ["STATUS"])))
            .await
            .unwrap();
        apply(&mut actor, ReplicationEvent::add(Device::new("D2", "127.0.0.1", port, ["PING"])))
            .await
            .unwrap();

        apply(&mut actor, ReplicationEvent::edit(Device::new("D1", "127.0.0.1", other_port, ["STATUS"])))
            .await
            .unwrap();

        assert_eq!(actor.listeners.port_of(&DeviceName::new("D1")), Some(other_port));
        assert_eq!(actor.listeners.port_of(&DeviceName::new("D2")), Some(port));

        actor.stop_all().await;
    }

    #[tokio::test]
    async fn test_invalid_device_rejected() {
        let (_, mut actor, _) = create_actor(None);

        let result = apply(&mut actor, ReplicationEvent::add(Device::new("D1", "127.0.0.1", 0, ["STATUS"]))).await;

        assert!(matches!(result, Err(RegistryError::InvalidDevice(_))));
        assert_eq!(actor.device_count(), 0);
    }

    #[tokio::test]
    async fn test_persist_after_change_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("devices.json"));
        let (_, mut actor, _) = create_actor(Some(store.clone()));

        apply(
            &mut actor,
            ReplicationEvent::edit(Device::new("ghost", "127.0.0.1", free_port(), ["STATUS"])),
        )
        .await
        .unwrap();
        assert!(!store.path().exists());

        apply(&mut actor, ReplicationEvent::add(Device::new("D1", "127.0.0.1", free_port(), ["STATUS"])))
            .await
            .unwrap();
        let persisted = store.load().await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].name.as_str(), "D1");

        actor.stop_all().await;
    }

    #[tokio::test]
    async fn test_bootstrap_starts_listeners_without_persisting() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("devices.json"));
        let (_, mut actor, _) = create_actor(Some(store.clone()));
        let port = free_port();

        actor
            .bootstrap(vec![Device::new("D1", "127.0.0.1", port, ["STATUS"])])
            .await;

        assert_eq!(actor.device_count(), 1);
        assert_eq!(actor.listeners.active_ports(), vec![port]);
        assert!(!store.path().exists());

        actor.stop_all().await;
    }
}
