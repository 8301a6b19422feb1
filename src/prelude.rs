//! Everything an agent implementation usually needs

pub use hans_core::{
    Agent, AgentError, AgentLink, AgentResult, Context, Coroutine, ParticipantId, Position,
    Round, RoundEvent, RoundId, SchedulerConfig, Sequence, SetupArgs, StateSnapshot, Step,
    from_fn,
};
pub use hans_mesh::{
    FollowerInbound, FollowerLink, FollowerName, LeaderInbound, LeaderLink, MeshError,
    Recipients, SessionEvent,
};

pub use crate::config::{CoordinationConfig, RuntimeConfig};
pub use crate::error::{RuntimeError, RuntimeResult};
pub use crate::runtime::AgentRuntime;
