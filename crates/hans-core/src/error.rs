//! Error types for agent hooks and round execution

use std::fmt;

use thiserror::Error;

use crate::round::RoundId;

/// Result type returned by agent hooks
pub type AgentResult<T> = Result<T, AgentError>;

/// Result type for round lifecycle operations
pub type RoundResult<T> = Result<T, RoundError>;

/// Errors raised by user code inside agent hooks and coroutines
#[derive(Error, Debug)]
pub enum AgentError {
    /// Generic failure reported by the agent
    #[error("Agent failed: {reason}")]
    Failed { reason: String },

    /// A setup argument is missing or has the wrong shape
    #[error("Invalid argument '{key}': {reason}")]
    InvalidArgument { key: String, reason: String },

    /// Sending a coordination message failed
    #[error("Messaging failed: {0}")]
    Messaging(String),

    /// The agent tried to submit a position without a platform client
    #[error("No platform client is attached to this round")]
    NoClient,

    /// The hook panicked; the payload message is preserved when possible
    #[error("Agent panicked: {0}")]
    Panicked(String),

    /// Any other error produced by user code
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl AgentError {
    /// Shorthand for [`AgentError::Failed`]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

impl From<PlatformError> for AgentError {
    fn from(err: PlatformError) -> Self {
        AgentError::Other(Box::new(err))
    }
}

/// The hook (or pass stage) in which a tick failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPhase {
    FixedUpdate,
    Update,
    Message,
    Coroutine,
}

impl fmt::Display for TickPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TickPhase::FixedUpdate => "fixed_update",
            TickPhase::Update => "update",
            TickPhase::Message => "on_message",
            TickPhase::Coroutine => "coroutine",
        };
        f.write_str(name)
    }
}

/// Failures of a single round
///
/// None of these crash the process: a failed round still runs `close` and the
/// runtime is ready for the next round afterwards.
#[derive(Error, Debug)]
pub enum RoundError {
    /// `setup` returned an error; no tick was delivered
    #[error("Setup failed for round {round}: {source}")]
    SetupFailed {
        round: RoundId,
        #[source]
        source: AgentError,
    },

    /// A tick hook failed; remaining ticks of the round were suppressed
    #[error("Round {round} failed in {phase}: {source}")]
    TickFailed {
        round: RoundId,
        phase: TickPhase,
        #[source]
        source: AgentError,
    },

    /// `close` itself returned an error
    #[error("Close failed for round {round}: {source}")]
    CloseFailed {
        round: RoundId,
        #[source]
        source: AgentError,
    },

    /// A follower was not registered with its leader when the round started
    #[error("Agent '{name}' is not registered with a leader: {reason}")]
    RegistrationFailed { name: String, reason: String },

    /// The round scheduler was driven after it stopped delivering ticks
    #[error("Round {0} no longer accepts ticks")]
    Halted(RoundId),

    /// The tick thread could not be spawned
    #[error("Failed to spawn tick thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// The tick thread panicked outside of agent code
    #[error("Tick thread for round {0} panicked")]
    ThreadPanicked(RoundId),
}

/// Errors reported by the platform transport collaborator
#[derive(Error, Debug)]
pub enum PlatformError {
    /// The position could not be published
    #[error("Failed to submit position: {0}")]
    SubmitFailed(String),

    /// The platform connection is gone
    #[error("Platform disconnected")]
    Disconnected,
}
