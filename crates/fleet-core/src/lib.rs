//! Fleet Core - Shared domain types for the device fleet daemon
//!
//! This crate provides the device entity and status values shared by the
//! wire protocol crate and the daemon.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod device;
pub mod error;
pub mod status;

// Re-exports for convenience
pub use device::{parse_command_list, Device, DeviceName};
pub use error::{DomainError, DomainResult};
pub use status::{ConnectivityState, DeviceStatus};
