//! Round and participant model
//!
//! A [`Round`] is one timed question on the platform. It is immutable once
//! delivered and lives exactly as long as the agent instance bound to it.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifier of a round as assigned by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoundId(pub u64);

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a session participant on the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u64);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ParticipantId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A participant of the session the round belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
}

impl Participant {
    pub fn new(id: impl Into<ParticipantId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// One timed question/session in which an agent is active
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    /// Platform identifier of the round
    pub id: RoundId,
    /// How long the round lasts on the platform
    #[serde(with = "crate::duration")]
    pub time_limit: Duration,
    /// Everybody taking part in the session, including this client
    #[serde(default)]
    pub participants: Vec<Participant>,
    /// Opaque question payload (prompt, answers, layout, ...)
    #[serde(default)]
    pub question: serde_json::Value,
}

impl Round {
    pub fn new(id: u64, time_limit: Duration) -> Self {
        Self {
            id: RoundId(id),
            time_limit,
            participants: Vec::new(),
            question: serde_json::Value::Null,
        }
    }

    pub fn with_participants(mut self, participants: Vec<Participant>) -> Self {
        self.participants = participants;
        self
    }

    pub fn with_question(mut self, question: serde_json::Value) -> Self {
        self.question = question;
        self
    }

    pub fn participant_ids(&self) -> impl Iterator<Item = ParticipantId> + '_ {
        self.participants.iter().map(|p| p.id)
    }

    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }
}
