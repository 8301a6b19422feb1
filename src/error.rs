//! Error types and utilities.
//!
//! [`RuntimeError`] gathers the failures of the member crates so callers of
//! the runtime deal with a single type.

use hans_core::{RoundError, RoundId};
use hans_mesh::MeshError;
use thiserror::Error;

use crate::config::ConfigError;

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Round(#[from] RoundError),

    #[error(transparent)]
    Mesh(#[from] MeshError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The configuration asks for a different coordination role
    #[error("Configured role does not match: {0}")]
    RoleMismatch(String),

    /// A state update arrived while no round was running
    #[error("No round is running")]
    NoActiveRound,

    /// A round start repeated the id of the round already running
    #[error("Round {0} is already running")]
    RoundInProgress(RoundId),
}

impl RuntimeError {
    /// Whether the runtime can keep serving rounds after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            RuntimeError::Round(RoundError::SetupFailed { .. })
            | RuntimeError::Round(RoundError::TickFailed { .. })
            | RuntimeError::Round(RoundError::CloseFailed { .. })
            | RuntimeError::Round(RoundError::Halted(_))
            | RuntimeError::NoActiveRound
            | RuntimeError::RoundInProgress(_) => true,
            RuntimeError::Mesh(MeshError::UnknownTarget { .. }) => true,
            _ => false,
        }
    }
}
