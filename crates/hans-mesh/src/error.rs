//! Error types for coordination bus operations

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::name::{FollowerName, NameValidationError};

/// Result type for coordination bus operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors that can occur on the coordination bus
#[derive(Error, Debug)]
pub enum MeshError {
    /// Could not reach or bind the rendezvous endpoint
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The frame could not be handed to the connection
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Some recipients are not registered; the others were still served
    #[error("Unknown target(s): {}", join_names(.names))]
    UnknownTarget { names: Vec<FollowerName> },

    /// The follower is not connected to a leader
    #[error("Not connected to a leader")]
    NoLeader,

    /// The leader refused the registration
    #[error("Registration of '{name}' rejected: {reason}")]
    RegistrationRejected { name: FollowerName, reason: String },

    /// An established connection was lost
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Operation timeout
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The endpoint address cannot be used
    #[error("Invalid endpoint '{address}': {reason}")]
    InvalidEndpoint { address: String, reason: String },

    /// A follower name failed validation
    #[error("Invalid follower name: {0}")]
    InvalidName(#[from] NameValidationError),

    /// Frame size exceeds limit
    #[error("Message too large: {size} bytes (limit: {limit} bytes)")]
    MessageTooLarge { size: usize, limit: usize },

    /// Frame serialization failed
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Frame deserialization failed
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Socket I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::SerializationFailed(err.to_string())
    }
}

/// Callback invoked on the I/O thread when a connection is lost or cannot
/// be established
pub type TransportErrorHook = Arc<dyn Fn(&MeshError) + Send + Sync>;

pub(crate) fn report_transport_error(hook: Option<&TransportErrorHook>, err: &MeshError) {
    warn!(error = %err, "Transport failure");
    if let Some(hook) = hook {
        hook(err);
    }
}

fn join_names(names: &[FollowerName]) -> String {
    names
        .iter()
        .map(FollowerName::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
