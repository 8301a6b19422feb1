//! Boundary with the simulation platform transport
//!
//! The platform connection itself lives outside this workspace. It talks to
//! the runtime through two seams: inbound [`RoundEvent`]s and the outbound
//! [`PositionSink`].

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::PlatformError;
use crate::round::{ParticipantId, Round};
use crate::snapshot::{Position, StateSnapshot};

/// Outbound half of the platform transport
pub trait PositionSink: Send + Sync {
    /// Publish this client's position for the current round
    fn submit_position(&self, position: Position) -> Result<(), PlatformError>;
}

impl<T: PositionSink + ?Sized> PositionSink for Arc<T> {
    fn submit_position(&self, position: Position) -> Result<(), PlatformError> {
        (**self).submit_position(position)
    }
}

/// Lifecycle notifications delivered by the platform (or, for a leader, by
/// the relay follower)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RoundEvent {
    /// A new round begins with its initial state
    Started {
        round: Round,
        snapshot: StateSnapshot,
    },
    /// A full state update
    Snapshot { snapshot: StateSnapshot },
    /// A single participant moved
    Position {
        participant: ParticipantId,
        position: Position,
    },
    /// The current round is over
    Ended,
}

impl RoundEvent {
    /// Round start with every participant at the origin
    pub fn started(round: Round) -> Self {
        let snapshot = StateSnapshot::at_origin(round.participant_ids());
        RoundEvent::Started { round, snapshot }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RoundEvent::Started { .. } => "started",
            RoundEvent::Snapshot { .. } => "snapshot",
            RoundEvent::Position { .. } => "position",
            RoundEvent::Ended => "ended",
        }
    }
}

/// A sink that remembers every submitted position
///
/// Handy for tests and dry runs without a platform connection.
#[derive(Debug, Default)]
pub struct RecordingSink {
    submitted: Mutex<Vec<Position>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<Position> {
        self.submitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last(&self) -> Option<Position> {
        self.submitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .copied()
    }
}

impl PositionSink for RecordingSink {
    fn submit_position(&self, position: Position) -> Result<(), PlatformError> {
        self.submitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(position);
        Ok(())
    }
}
