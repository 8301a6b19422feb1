//! Session state snapshots
//!
//! The runtime is the only writer: every change builds a fresh
//! [`StateSnapshot`] and swaps it into the [`SnapshotCell`] wholesale, so user
//! code holding an `Arc<StateSnapshot>` never observes a torn update.

use std::collections::BTreeMap;
use std::ops::{Add, Mul, Sub};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::round::ParticipantId;

/// A point on the answer board
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const ORIGIN: Position = Position { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Position) -> f64 {
        (*self - *other).length()
    }

    pub fn length(&self) -> f64 {
        self.x.hypot(self.y)
    }
}

impl Add for Position {
    type Output = Position;

    fn add(self, rhs: Position) -> Position {
        Position::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Position {
    type Output = Position;

    fn sub(self, rhs: Position) -> Position {
        Position::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f64> for Position {
    type Output = Position;

    fn mul(self, rhs: f64) -> Position {
        Position::new(self.x * rhs, self.y * rhs)
    }
}

/// Latest known positions of every participant plus a freshness marker
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    positions: BTreeMap<ParticipantId, Position>,
    sequence: u64,
}

impl StateSnapshot {
    pub fn new(positions: BTreeMap<ParticipantId, Position>, sequence: u64) -> Self {
        Self {
            positions,
            sequence,
        }
    }

    /// Snapshot in which every participant stands at the origin
    pub fn at_origin(participants: impl IntoIterator<Item = ParticipantId>) -> Self {
        Self {
            positions: participants
                .into_iter()
                .map(|id| (id, Position::ORIGIN))
                .collect(),
            sequence: 0,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn position(&self, participant: ParticipantId) -> Option<Position> {
        self.positions.get(&participant).copied()
    }

    pub fn positions(&self) -> impl Iterator<Item = (ParticipantId, Position)> + '_ {
        self.positions.iter().map(|(id, pos)| (*id, *pos))
    }

    /// Positions of everybody except `me`
    pub fn other_positions(&self, me: ParticipantId) -> impl Iterator<Item = Position> + '_ {
        self.positions
            .iter()
            .filter(move |(id, _)| **id != me)
            .map(|(_, pos)| *pos)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}

/// Shared, read-mostly holder of the current snapshot
#[derive(Debug, Default)]
pub struct SnapshotCell {
    current: RwLock<Arc<StateSnapshot>>,
}

impl SnapshotCell {
    pub fn new(initial: StateSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// The snapshot as of now; later updates never mutate it
    pub fn current(&self) -> Arc<StateSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the whole snapshot, returning the sequence number it was given
    ///
    /// Sequence numbers are assigned here so they stay strictly increasing no
    /// matter where the incoming snapshot came from.
    pub fn replace(&self, snapshot: StateSnapshot) -> u64 {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let sequence = current.sequence + 1;
        *current = Arc::new(snapshot.with_sequence(sequence));
        sequence
    }

    /// Copy-on-write update of a single participant
    pub fn set_position(&self, participant: ParticipantId, position: Position) -> u64 {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut positions = current.positions.clone();
        positions.insert(participant, position);
        let sequence = current.sequence + 1;
        *current = Arc::new(StateSnapshot::new(positions, sequence));
        sequence
    }
}
