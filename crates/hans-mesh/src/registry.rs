//! Leader-side follower registry and relay election
//!
//! The registry is written only from the leader's I/O thread (registrations
//! and disconnects) and read by the tick thread through [`RegistrySnapshot`]
//! copies, so a pass never sees the follower set change underneath it.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{MeshError, MeshResult};
use crate::frame::{Frame, ensure_fits};
use crate::message::{Envelope, Recipients};
use crate::name::FollowerName;

/// What happens when the relay follower disconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayPolicy {
    /// Hand the role to the earliest-registered remaining follower
    #[default]
    PromoteNext,
    /// Keep no relay; the leader's view stays stale
    KeepStale,
}

/// Leader lifecycle with respect to its followers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    AwaitingFirstFollower,
    Active,
}

/// Identifier of one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnId(pub(crate) u64);

struct Entry {
    name: FollowerName,
    conn: ConnId,
    outbound: mpsc::UnboundedSender<Frame>,
    relay: bool,
}

struct Inner {
    entries: Vec<Entry>,
    state: LeaderState,
}

/// Connected followers in registration order
pub struct FollowerRegistry {
    policy: RelayPolicy,
    inner: Mutex<Inner>,
}

/// Result of removing a follower
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Departure {
    pub(crate) name: FollowerName,
    pub(crate) was_relay: bool,
    pub(crate) promoted: Option<FollowerName>,
}

impl FollowerRegistry {
    pub fn new(policy: RelayPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                state: LeaderState::AwaitingFirstFollower,
            }),
        }
    }

    pub fn policy(&self) -> RelayPolicy {
        self.policy
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a follower and acknowledge it on its own queue
    ///
    /// The acknowledgement is queued under the registry lock, so it always
    /// precedes any message addressed to the new follower.
    pub(crate) fn register(
        &self,
        name: FollowerName,
        conn: ConnId,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> MeshResult<bool> {
        let mut inner = self.lock();
        if inner.entries.iter().any(|e| e.name == name) {
            return Err(MeshError::RegistrationRejected {
                reason: format!("there already exists an agent with the name {name}"),
                name,
            });
        }

        let relay = match self.policy {
            RelayPolicy::PromoteNext => !inner.entries.iter().any(|e| e.relay),
            RelayPolicy::KeepStale => inner.state == LeaderState::AwaitingFirstFollower,
        };
        outbound
            .send(Frame::Registered { relay })
            .map_err(|_| MeshError::SendFailed(format!("{name} went away during registration")))?;

        inner.state = LeaderState::Active;
        info!(follower = %name, relay, "Follower registered");
        inner.entries.push(Entry {
            name,
            conn,
            outbound,
            relay,
        });
        Ok(relay)
    }

    /// Drop a connection's entry, re-electing the relay if the policy says so
    pub(crate) fn remove(&self, conn: ConnId) -> Option<Departure> {
        let mut inner = self.lock();
        let index = inner.entries.iter().position(|e| e.conn == conn)?;
        let entry = inner.entries.remove(index);

        let mut promoted = None;
        if entry.relay && self.policy == RelayPolicy::PromoteNext {
            if let Some(next) = inner.entries.first_mut() {
                next.relay = true;
                if next.outbound.send(Frame::Promoted).is_err() {
                    warn!(follower = %next.name, "Promoted follower is already gone");
                }
                promoted = Some(next.name.clone());
            }
        }

        match (&promoted, entry.relay) {
            (Some(next), _) => info!(follower = %entry.name, relay = %next, "Relay left, promoted next follower"),
            (None, true) => warn!(follower = %entry.name, "Relay left, leader state is now stale"),
            (None, false) => info!(follower = %entry.name, "Follower left"),
        }

        Some(Departure {
            name: entry.name,
            was_relay: entry.relay,
            promoted,
        })
    }

    pub fn state(&self) -> LeaderState {
        self.lock().state
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &FollowerName) -> bool {
        self.lock().entries.iter().any(|e| &e.name == name)
    }

    pub fn relay(&self) -> Option<FollowerName> {
        self.lock()
            .entries
            .iter()
            .find(|e| e.relay)
            .map(|e| e.name.clone())
    }

    pub(crate) fn is_relay(&self, conn: ConnId) -> bool {
        self.lock().entries.iter().any(|e| e.conn == conn && e.relay)
    }

    /// Consistent copy of the follower set for one pass
    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.lock();
        RegistrySnapshot {
            followers: inner
                .entries
                .iter()
                .map(|e| Follower {
                    name: e.name.clone(),
                    relay: e.relay,
                    outbound: e.outbound.clone(),
                })
                .collect(),
        }
    }
}

impl std::fmt::Debug for FollowerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("FollowerRegistry")
            .field("policy", &self.policy)
            .field("state", &inner.state)
            .field(
                "followers",
                &inner.entries.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[derive(Clone)]
struct Follower {
    name: FollowerName,
    relay: bool,
    outbound: mpsc::UnboundedSender<Frame>,
}

/// Point-in-time view of the registry used for sends
#[derive(Clone, Default)]
pub struct RegistrySnapshot {
    followers: Vec<Follower>,
}

impl RegistrySnapshot {
    pub fn names(&self) -> Vec<FollowerName> {
        self.followers.iter().map(|f| f.name.clone()).collect()
    }

    pub fn relay(&self) -> Option<&FollowerName> {
        self.followers.iter().find(|f| f.relay).map(|f| &f.name)
    }

    pub fn contains(&self, name: &FollowerName) -> bool {
        self.followers.iter().any(|f| &f.name == name)
    }

    pub fn len(&self) -> usize {
        self.followers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.followers.is_empty()
    }

    /// Queue `frame` for each recipient
    ///
    /// Known recipients are always served. Names that are not registered (or
    /// whose connection already closed) are collected into
    /// [`MeshError::UnknownTarget`]. Returns how many followers were reached.
    /// A frame over the wire limit fails with [`MeshError::MessageTooLarge`]
    /// and reaches nobody.
    pub(crate) fn deliver(&self, recipients: &Recipients, frame: &Frame) -> MeshResult<usize> {
        ensure_fits(frame)?;
        let mut delivered = 0;
        let mut unknown = Vec::new();

        match recipients {
            Recipients::All => {
                for follower in &self.followers {
                    if follower.outbound.send(frame.clone()).is_ok() {
                        delivered += 1;
                    }
                }
            }
            named => {
                for name in named.names() {
                    let sent = self
                        .followers
                        .iter()
                        .find(|f| &f.name == name)
                        .is_some_and(|f| f.outbound.send(frame.clone()).is_ok());
                    if sent {
                        delivered += 1;
                    } else {
                        unknown.push(name.clone());
                    }
                }
            }
        }

        if unknown.is_empty() {
            Ok(delivered)
        } else {
            Err(MeshError::UnknownTarget { names: unknown })
        }
    }

    /// Send a leader message
    pub(crate) fn send(&self, recipients: Recipients, payload: String) -> MeshResult<usize> {
        let frame = Frame::Message(Envelope::from_leader(recipients.clone(), payload));
        self.deliver(&recipients, &frame)
    }
}

impl std::fmt::Debug for RegistrySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.followers.iter().map(|f| (f.name.as_str(), f.relay)))
            .finish()
    }
}
