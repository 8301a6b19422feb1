//! # Hans Core
//!
//! Per-round execution for Hans platform agents: a fixed-timestep round
//! scheduler, a cooperative coroutine scheduler layered on it, the agent
//! capability traits, and the round/state data model they operate on.

pub mod agent;
pub mod args;
pub mod clock;
pub mod coroutine;
pub mod duration;
pub mod error;
pub mod platform;
pub mod round;
pub mod scheduler;
pub mod sequence;
pub mod snapshot;

pub use agent::{Agent, AgentLink, Context};
pub use args::SetupArgs;
pub use clock::{Clock, ManualClock, StopSignal, SystemClock, Ticker};
pub use coroutine::{Coroutine, CoroutineScheduler, FromFn, Step, TaskId, Wake, from_fn};
pub use error::{AgentError, AgentResult, PlatformError, RoundError, RoundResult, TickPhase};
pub use platform::{PositionSink, RecordingSink, RoundEvent};
pub use round::{Participant, ParticipantId, Round, RoundId};
pub use scheduler::{
    Accumulator, FixedStepPlan, PassReport, RoundHandle, RoundOutcome, RoundScheduler, RoundSetup,
    SchedulerConfig, SchedulerConfigError,
};
pub use sequence::Sequence;
pub use snapshot::{Position, SnapshotCell, StateSnapshot};
