//! Per-device TCP listeners.
//!
//! The `ListenerManager` owns the port -> listener table. Each listener runs
//! an accept loop on its own task and spawns a `ConnectionHandler` for every
//! client. The manager is owned by the registry actor, so all table mutations
//! are serialized.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   ensure / stop   ┌──────────────────┐
//! │  RegistryActor   │──────────────────▶│ ListenerManager  │
//! └──────────────────┘                   │ port -> listener │
//!                                        └────────┬─────────┘
//!                                                 │ accept()
//!                                                 ▼
//!                                        ┌──────────────────┐
//!                                        │ConnectionHandler │
//!                                        │  (per client)    │
//!                                        └──────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Bind failures are returned as `ListenerError`, accept errors are logged

mod connection;

pub use connection::{ConnectionError, ConnectionHandler};

use std::collections::HashMap;
use std::net::SocketAddr;

use fleet_core::{Device, DeviceName};
use fleet_protocol::CommandSet;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that can occur while starting a listener.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListenerError {
    /// The OS refused the bind (port in use, permission denied, bad host).
    #[error("failed to bind {host}:{port}: {reason}")]
    Bind {
        host: String,
        port: u16,
        reason: String,
    },

    /// Another device already owns a listener on this port.
    #[error("port {port} is already served by device {owner}")]
    PortTaken { port: u16, owner: DeviceName },
}

/// A running listener.
struct ActiveListener {
    /// Device configuration captured when the listener was bound
    device: Device,
    local_addr: SocketAddr,
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns one bound listener per device port.
pub struct ListenerManager {
    active: HashMap<u16, ActiveListener>,

    /// Parent token; cancelling it stops every accept loop
    root_token: CancellationToken,
}

impl ListenerManager {
    pub fn new() -> Self {
        Self {
            active: HashMap::new(),
            root_token: CancellationToken::new(),
        }
    }

    /// Makes sure a listener for `device` is running on `device.port`.
    ///
    /// - A listener this device holds on another (previous) port is stopped first.
    /// - A listener on the same port serving an identical configuration is left alone.
    /// - A listener on the same port with a stale host or command set is restarted.
    /// - A port held by a different device is never taken over.
    ///
    /// # Errors
    ///
    /// - `ListenerError::PortTaken` if another device owns the port
    /// - `ListenerError::Bind` if the OS refuses the bind
    pub async fn ensure(&mut self, device: &Device) -> Result<(), ListenerError> {
        if let Some(previous_port) = self.port_of(&device.name) {
            if previous_port != device.port {
                debug!(
                    device = %device.name,
                    old_port = previous_port,
                    new_port = device.port,
                    "Device moved to a new port"
                );
                self.stop(previous_port).await;
            }
        }

        if let Some(existing) = self.active.get(&device.port) {
            if existing.device.name != device.name {
                warn!(
                    device = %device.name,
                    port = device.port,
                    owner = %existing.device.name,
                    "Port already served by another device"
                );
                return Err(ListenerError::PortTaken {
                    port: device.port,
                    owner: existing.device.name.clone(),
                });
            }

            if !existing.device.listener_differs(device) {
                debug!(device = %device.name, port = device.port, "Listener already running");
                return Ok(());
            }

            self.stop(device.port).await;
        }

        self.start(device).await
    }

    /// Stops the listener bound to `port`.
    ///
    /// Returns true if a listener was stopped; stopping an unbound port is a
    /// no-op. The accept loop has exited and the socket is closed by the time
    /// this returns.
    pub async fn stop(&mut self, port: u16) -> bool {
        let Some(listener) = self.active.remove(&port) else {
            return false;
        };

        listener.cancel_token.cancel();
        if let Err(e) = listener.task.await {
            error!(port, error = %e, "Accept loop task failed");
        }

        info!(
            device = %listener.device.name,
            port,
            "Listener stopped"
        );
        true
    }

    /// Stops every listener.
    pub async fn shutdown(&mut self) {
        self.root_token.cancel();
        let ports: Vec<u16> = self.active.keys().copied().collect();
        for port in ports {
            self.stop(port).await;
        }
    }

    /// Returns the port the named device is currently served on.
    pub fn port_of(&self, name: &DeviceName) -> Option<u16> {
        self.active
            .iter()
            .find(|(_, listener)| &listener.device.name == name)
            .map(|(port, _)| *port)
    }

    /// Returns the local address of the listener on `port`.
    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.active.get(&port).map(|l| l.local_addr)
    }

    /// Returns the ports with a running listener, sorted.
    pub fn active_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.active.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn is_running(&self, port: u16) -> bool {
        self.active.contains_key(&port)
    }

    async fn start(&mut self, device: &Device) -> Result<(), ListenerError> {
        let listener = TcpListener::bind((device.host.as_str(), device.port))
            .await
            .map_err(|e| ListenerError::Bind {
                host: device.host.clone(),
                port: device.port,
                reason: e.to_string(),
            })?;

        let local_addr = listener.local_addr().map_err(|e| ListenerError::Bind {
            host: device.host.clone(),
            port: device.port,
            reason: e.to_string(),
        })?;

        let cancel_token = self.root_token.child_token();
        let task = tokio::spawn(run_accept_loop(
            listener,
            device.name.clone(),
            CommandSet::new(&device.commands),
            cancel_token.clone(),
        ));

        info!(
            device = %device.name,
            addr = %local_addr,
            commands = device.commands.len(),
            "Listener started"
        );

        self.active.insert(
            device.port,
            ActiveListener {
                device: device.clone(),
                local_addr,
                cancel_token,
                task,
            },
        );
        Ok(())
    }
}

impl Default for ListenerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ListenerManager {
    fn drop(&mut self) {
        // Accept loops must not outlive their owner.
        self.root_token.cancel();
    }
}

/// Accepts connections until cancelled, then drops (closes) the socket.
async fn run_accept_loop(
    listener: TcpListener,
    device: DeviceName,
    commands: CommandSet,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                debug!(device = %device, "Accept loop cancelled");
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let handler = ConnectionHandler::new(
                            stream,
                            peer,
                            device.clone(),
                            commands.clone(),
                        );
                        tokio::spawn(handler.run());
                    }
                    Err(e) => {
                        error!(device = %device, error = %e, "Failed to accept connection");
                        // Continue accepting other connections
                    }
                }
            }
        }
    }
}
