//! Fleet Protocol - Wire formats for the device fleet daemon
//!
//! This crate provides:
//! - `event` - replication events exchanged on the `device_updates` bus topic
//! - `snapshot` - the JSON document persisted by the snapshot store
//! - `reply` - the plain-text device command protocol

pub mod error;
pub mod event;
pub mod reply;
pub mod snapshot;

pub use error::ProtocolError;
pub use event::{EventKind, ReplicationEvent, DEFAULT_TOPIC};
pub use reply::{CommandSet, MAX_COMMAND_SIZE, NO_MATCH_REPLY, REPLY_RANGE};
pub use snapshot::{decode_snapshot, encode_snapshot};
