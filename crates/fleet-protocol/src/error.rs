//! Errors produced while decoding or encoding wire formats.

use thiserror::Error;

/// Errors that can occur while handling wire payloads.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// Payload was not valid JSON or did not match the expected shape.
    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    /// Payload decoded but carried an invalid device record.
    #[error("invalid device in {what}: {reason}")]
    InvalidDevice { what: &'static str, reason: String },

    /// Serialization failed.
    #[error("failed to encode {what}: {reason}")]
    Encode { what: &'static str, reason: String },
}

impl ProtocolError {
    pub(crate) fn malformed<E: std::fmt::Display>(what: &'static str, err: E) -> Self {
        Self::Malformed {
            what,
            reason: err.to_string(),
        }
    }

    pub(crate) fn encode<E: std::fmt::Display>(what: &'static str, err: E) -> Self {
        Self::Encode {
            what,
            reason: err.to_string(),
        }
    }
}
