//! Fleet Daemon - device registry, per-device listeners and replication
//!
//! This crate provides the core infrastructure for the fleet daemon:
//! - `registry` - Device registry actor; the single writer of fleet state
//! - `listener` - One TCP listener per device port, answering device commands
//! - `monitor` - Liveness probes and on-demand reachability checks
//! - `replication` - Event bus abstraction, MQTT and in-process buses, consumer
//! - `snapshot` - Durable JSON snapshot of the device list
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        fleetd daemon                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐ apply ┌─────────────────────────────┐  │
//! │  │ Bus consumer    │──────▶│     RegistryActor           │  │
//! │  │ (MQTT / local)  │       │  (device state owner)       │  │
//! │  └─────────────────┘       └──────┬──────────────┬───────┘  │
//! │                                   │              │          │
//! │                     ensure / stop │              │ persist  │
//! │                                   ▼              ▼          │
//! │  ┌─────────────────┐       ┌─────────────┐ ┌────────────┐   │
//! │  │ConnectionHandler│◀──────│ Listener    │ │ Snapshot   │   │
//! │  │  (per client)   │accept │ Manager     │ │ Store      │   │
//! │  └─────────────────┘       └─────────────┘ └────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod cli;
pub mod config;
pub mod daemon;
pub mod listener;
pub mod monitor;
pub mod registry;
pub mod replication;
pub mod snapshot;
