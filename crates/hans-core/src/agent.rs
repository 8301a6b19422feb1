//! # Agent Capabilities
//!
//! The lifecycle hooks a round drives and the context handed to them.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use crate::args::SetupArgs;
use crate::coroutine::{Coroutine, Spawned};
use crate::error::{AgentError, AgentResult, RoundResult};
use crate::platform::PositionSink;
use crate::round::Round;
use crate::snapshot::{Position, StateSnapshot};

/// User logic driven through one round
///
/// A fresh instance is created for every round and dropped after `close`.
/// Every hook has a no-op default, so an agent only implements what it uses.
///
/// # Lifecycle
///
/// 1. **setup** - exactly once, before any tick
/// 2. **fixed_update** - zero or more times per pass, at the fixed rate
/// 3. **update** - once per pass, with the variable frame delta
/// 4. **on_message** - once per inbound coordination message
/// 5. **close** - exactly once, last call into the instance
///
/// # Example
///
/// ```rust,ignore
/// struct Walker { speed: f64, x: f64 }
///
/// impl Agent for Walker {
///     type Link = ();
///
///     fn fixed_update(&mut self, _ctx: &mut Context<'_, Self>, delta: Duration, _ratio: f64) -> AgentResult<()> {
///         self.x += self.speed * delta.as_secs_f64();
///         Ok(())
///     }
///
///     fn update(&mut self, ctx: &mut Context<'_, Self>, _delta: Duration) -> AgentResult<()> {
///         ctx.submit_position(Position::new(self.x, 0.0))
///     }
/// }
/// ```
pub trait Agent: Send + Sized + 'static {
    /// Coordination role of this agent; `()` for a plain agent
    type Link: AgentLink;

    /// Called once with the configured keyword arguments
    fn setup(&mut self, _ctx: &mut Context<'_, Self>, _args: &SetupArgs) -> AgentResult<()> {
        Ok(())
    }

    /// Fixed-rate simulation step
    ///
    /// `delta` is always the configured fixed step. `sync_ratio` is the
    /// fraction of a step left in the accumulator once this pass has
    /// consumed its steps, in `[0, 1)`.
    fn fixed_update(
        &mut self,
        _ctx: &mut Context<'_, Self>,
        _delta: Duration,
        _sync_ratio: f64,
    ) -> AgentResult<()> {
        Ok(())
    }

    /// Variable-rate update, the usual place to submit a position
    fn update(&mut self, _ctx: &mut Context<'_, Self>, _delta: Duration) -> AgentResult<()> {
        Ok(())
    }

    /// A coordination message arrived for this agent
    fn on_message(
        &mut self,
        _ctx: &mut Context<'_, Self>,
        _message: <Self::Link as AgentLink>::Inbound,
    ) -> AgentResult<()> {
        Ok(())
    }

    /// The round is over; no hook runs after this one
    fn close(&mut self, _ctx: &mut Context<'_, Self>) -> AgentResult<()> {
        Ok(())
    }
}

/// Per-round binding between an agent and its coordination role
///
/// The round scheduler calls these on the tick thread around the agent's own
/// hooks. Implementations must not block.
pub trait AgentLink: Send + 'static {
    /// What `Agent::on_message` receives
    type Inbound: Send;

    /// Runs before `setup`; an error aborts the round before any hook
    fn on_round_start(&mut self, _round: &Round) -> RoundResult<()> {
        Ok(())
    }

    /// Start of every pass, before the first `fixed_update`
    fn before_pass(&mut self) {}

    /// Messages queued since the previous pass, oldest first
    fn drain_inbound(&mut self) -> Vec<Self::Inbound> {
        Vec::new()
    }

    /// End of every pass, after `update`, with the snapshot the pass saw
    fn after_pass(&mut self, _snapshot: &StateSnapshot) {}

    /// After `close`; the link is dropped right afterwards
    fn on_round_end(&mut self) {}
}

/// A plain agent has no coordination role and never receives messages
impl AgentLink for () {
    type Inbound = Infallible;
}

/// Everything a hook may touch besides the agent itself
pub struct Context<'a, A: Agent> {
    round: &'a Round,
    snapshot: Arc<StateSnapshot>,
    client: Option<&'a dyn PositionSink>,
    link: &'a mut A::Link,
    spawned: &'a mut Vec<Spawned<A>>,
    elapsed: Duration,
}

/// Per-pass inputs shared by every hook call and coroutine resumption
pub(crate) struct Scope<'a, A: Agent> {
    pub(crate) round: &'a Round,
    pub(crate) snapshot: Arc<StateSnapshot>,
    pub(crate) client: Option<&'a dyn PositionSink>,
    pub(crate) link: &'a mut A::Link,
}

impl<'a, A: Agent> Scope<'a, A> {
    pub(crate) fn context<'s>(
        &'s mut self,
        spawned: &'s mut Vec<Spawned<A>>,
        elapsed: Duration,
    ) -> Context<'s, A> {
        Context {
            round: self.round,
            snapshot: self.snapshot.clone(),
            client: self.client,
            link: &mut *self.link,
            spawned,
            elapsed,
        }
    }
}

impl<'a, A: Agent> Context<'a, A> {
    pub fn round(&self) -> &Round {
        self.round
    }

    /// Latest state as of the start of the current hook
    pub fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }

    /// Shared handle to the snapshot, for keeping it past this hook
    pub fn snapshot_arc(&self) -> Arc<StateSnapshot> {
        self.snapshot.clone()
    }

    /// Tick time accumulated by the round so far
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn client(&self) -> Option<&dyn PositionSink> {
        self.client
    }

    /// Publish a position through the platform client
    pub fn submit_position(&self, position: Position) -> AgentResult<()> {
        let client = self.client.ok_or(AgentError::NoClient)?;
        client.submit_position(position)?;
        Ok(())
    }

    pub fn link(&self) -> &A::Link {
        &*self.link
    }

    pub fn link_mut(&mut self) -> &mut A::Link {
        &mut *self.link
    }

    /// Schedule a coroutine; its first resumption is the next drain
    pub fn start_coroutine<C>(&mut self, coroutine: C)
    where
        C: Coroutine<A> + 'static,
    {
        self.start_coroutine_after(coroutine, Duration::ZERO);
    }

    /// Schedule a coroutine to first run once `delay` of tick time has passed
    pub fn start_coroutine_after<C>(&mut self, coroutine: C, delay: Duration)
    where
        C: Coroutine<A> + 'static,
    {
        self.spawned
            .push(Spawned::new(Box::new(coroutine), delay).at(self.elapsed));
    }
}
