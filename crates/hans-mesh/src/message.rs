//! Message envelopes exchanged between a leader and its followers

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::name::{ALL, FollowerName};

/// Who a leader-originated message is for
///
/// On the wire a single name is a string, a set is an array of strings, and
/// every follower is the literal `"all"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    One(FollowerName),
    Many(BTreeSet<FollowerName>),
    All,
}

impl Recipients {
    pub fn one(name: FollowerName) -> Self {
        Recipients::One(name)
    }

    pub fn many(names: impl IntoIterator<Item = FollowerName>) -> Self {
        Recipients::Many(names.into_iter().collect())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Recipients::All)
    }

    /// Named recipients; empty for `All`
    pub fn names(&self) -> Vec<&FollowerName> {
        match self {
            Recipients::One(name) => vec![name],
            Recipients::Many(names) => names.iter().collect(),
            Recipients::All => Vec::new(),
        }
    }
}

impl From<FollowerName> for Recipients {
    fn from(name: FollowerName) -> Self {
        Recipients::One(name)
    }
}

impl From<&FollowerName> for Recipients {
    fn from(name: &FollowerName) -> Self {
        Recipients::One(name.clone())
    }
}

impl From<Vec<FollowerName>> for Recipients {
    fn from(names: Vec<FollowerName>) -> Self {
        Recipients::many(names)
    }
}

impl From<BTreeSet<FollowerName>> for Recipients {
    fn from(names: BTreeSet<FollowerName>) -> Self {
        Recipients::Many(names)
    }
}

impl Serialize for Recipients {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Recipients::One(name) => name.serialize(serializer),
            Recipients::Many(names) => names.serialize(serializer),
            Recipients::All => serializer.serialize_str(ALL),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRecipients {
    Single(String),
    Set(Vec<String>),
}

impl<'de> Deserialize<'de> for Recipients {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawRecipients::deserialize(deserializer)? {
            RawRecipients::Single(raw) if raw == ALL => Ok(Recipients::All),
            RawRecipients::Single(raw) => FollowerName::parse(&raw)
                .map(Recipients::One)
                .map_err(serde::de::Error::custom),
            RawRecipients::Set(raw) => raw
                .iter()
                .map(FollowerName::parse)
                .collect::<Result<BTreeSet<_>, _>>()
                .map(Recipients::Many)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// One message on the bus
///
/// `sender` is absent for leader-originated messages and carries the
/// registered name for follower-originated ones. Follower messages always go
/// to the leader and are addressed to `all`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<FollowerName>,
    pub recipients: Recipients,
    pub payload: String,
}

impl Envelope {
    /// Message from the leader
    pub fn from_leader(recipients: impl Into<Recipients>, payload: impl Into<String>) -> Self {
        Self {
            sender: None,
            recipients: recipients.into(),
            payload: payload.into(),
        }
    }

    /// Message from a follower to its leader
    pub fn from_follower(sender: FollowerName, payload: impl Into<String>) -> Self {
        Self {
            sender: Some(sender),
            recipients: Recipients::All,
            payload: payload.into(),
        }
    }
}

/// Session edges the leader announces to every follower
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    Start,
    Stop,
}
