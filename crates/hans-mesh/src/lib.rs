//! # Hans Mesh
//!
//! Leader/follower coordination for Hans agents. A leader binds a rendezvous
//! endpoint and followers register with it by name. The first follower to
//! register is the relay and forwards its view of the session, so the leader
//! can follow rounds without being a platform participant.
//!
//! Frames are newline-delimited JSON over TCP or Unix domain sockets. Each
//! endpoint runs its own I/O thread; everything it receives reaches the tick
//! thread through queues drained once per pass by the endpoint's link
//! ([`LeaderLink`], [`FollowerLink`]).

pub mod endpoint;
pub mod error;
pub mod follower;
pub mod frame;
pub mod leader;
pub mod message;
pub mod name;
pub mod registry;
mod transport;

pub use endpoint::{DEFAULT_ENDPOINT, Endpoint};
pub use error::{MeshError, MeshResult, TransportErrorHook};
pub use follower::{FollowerConfig, FollowerEndpoint, FollowerInbound, FollowerLink, FollowerStatus};
pub use frame::{Frame, MAX_FRAME_BYTES};
pub use leader::{LeaderConfig, LeaderEndpoint, LeaderInbound, LeaderLink, RoundEvents};
pub use message::{Envelope, Recipients, SessionEvent};
pub use name::{FollowerName, NameValidationError};
pub use registry::{FollowerRegistry, LeaderState, RegistrySnapshot, RelayPolicy};
