//! Composition root binding agents to the round lifecycle

use std::fmt;
use std::sync::Arc;

use hans_core::{
    Agent, Clock, ParticipantId, Position, PositionSink, Round, RoundError, RoundEvent,
    RoundHandle, RoundId, RoundOutcome, RoundSetup, SnapshotCell, StateSnapshot, SystemClock,
};
use hans_mesh::{FollowerEndpoint, FollowerLink, LeaderEndpoint, LeaderLink};
use tracing::{debug, error, info, warn};

use super::role::{Coordination, expect_plain};
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};

struct ActiveRound {
    handle: RoundHandle,
    snapshot: Arc<SnapshotCell>,
}

/// Runs one fresh agent instance per round, one round at a time
///
/// A new round always waits for the previous round's `close` to return.
/// The agent is built by the factory at every round start and dropped once
/// the round ends, so no per-round state leaks between rounds.
pub struct AgentRuntime<A: Agent> {
    config: RuntimeConfig,
    factory: Box<dyn FnMut() -> A + Send>,
    links: Box<dyn FnMut() -> A::Link + Send>,
    coordination: Coordination,
    clock: Arc<dyn Clock>,
    client: Option<Arc<dyn PositionSink>>,
    active: Option<ActiveRound>,
}

impl<A: Agent<Link = ()>> AgentRuntime<A> {
    /// Runtime for an agent without a coordination role
    pub fn new<F>(config: RuntimeConfig, factory: F) -> RuntimeResult<Self>
    where
        F: FnMut() -> A + Send + 'static,
    {
        config.validate()?;
        expect_plain(&config)?;
        Ok(Self::assemble(config, factory, || (), Coordination::Plain))
    }
}

impl<A: Agent<Link = FollowerLink>> AgentRuntime<A> {
    /// Runtime for a follower agent; starts connecting to the leader at once
    ///
    /// Registration must have completed by the first round start, otherwise
    /// that round fails with [`RoundError::RegistrationFailed`].
    pub fn follower<F>(config: RuntimeConfig, factory: F) -> RuntimeResult<Self>
    where
        F: FnMut() -> A + Send + 'static,
    {
        config.validate()?;
        let endpoint = Coordination::connect_follower(&config)?;
        let source = Arc::clone(&endpoint);
        Ok(Self::assemble(
            config,
            factory,
            move || source.link(),
            Coordination::Follower(endpoint),
        ))
    }

    pub fn follower_endpoint(&self) -> Option<&FollowerEndpoint> {
        match &self.coordination {
            Coordination::Follower(endpoint) => Some(endpoint),
            _ => None,
        }
    }
}

impl<A: Agent<Link = LeaderLink>> AgentRuntime<A> {
    /// Runtime for a leader agent; binds the endpoint before returning
    ///
    /// Drive it with the events relayed by the followers, see
    /// [`LeaderEndpoint::round_events`].
    pub fn leader<F>(config: RuntimeConfig, factory: F) -> RuntimeResult<Self>
    where
        F: FnMut() -> A + Send + 'static,
    {
        config.validate()?;
        let endpoint = Coordination::bind_leader(&config)?;
        let source = Arc::clone(&endpoint);
        Ok(Self::assemble(
            config,
            factory,
            move || source.link(),
            Coordination::Leader(endpoint),
        ))
    }

    pub fn leader_endpoint(&self) -> Option<&LeaderEndpoint> {
        match &self.coordination {
            Coordination::Leader(endpoint) => Some(endpoint),
            _ => None,
        }
    }
}

impl<A: Agent> AgentRuntime<A> {
    fn assemble<F, L>(config: RuntimeConfig, factory: F, links: L, coordination: Coordination) -> Self
    where
        F: FnMut() -> A + Send + 'static,
        L: FnMut() -> A::Link + Send + 'static,
    {
        info!(role = coordination.name(), tick_rate = config.scheduler.tick_rate(), "Agent runtime ready");
        Self {
            config,
            factory: Box::new(factory),
            links: Box::new(links),
            coordination,
            clock: Arc::new(SystemClock),
            client: None,
            active: None,
        }
    }

    /// Replace the wall clock, mostly for tests
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Outbound platform connection handed to every round
    pub fn with_client(mut self, client: Arc<dyn PositionSink>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn coordination(&self) -> &Coordination {
        &self.coordination
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    pub fn current_round(&self) -> Option<RoundId> {
        self.active.as_ref().map(|active| active.handle.round())
    }

    /// Snapshot the running round currently sees
    pub fn snapshot(&self) -> Option<Arc<StateSnapshot>> {
        self.active.as_ref().map(|active| active.snapshot.current())
    }

    /// Start `round` with a fresh agent
    ///
    /// A round that is still running is ended first; its outcome is
    /// returned. Starting the same round twice is refused. If the new round
    /// then fails to start, the ended round's outcome is only logged; call
    /// [`AgentRuntime::end_round`] first to keep it.
    pub fn start_round(
        &mut self,
        round: Round,
        snapshot: StateSnapshot,
    ) -> RuntimeResult<Option<RoundOutcome>> {
        if self.current_round() == Some(round.id) {
            return Err(RuntimeError::RoundInProgress(round.id));
        }
        let previous = self.end_round()?;
        self.launch(round, snapshot)?;
        Ok(previous)
    }

    fn launch(&mut self, round: Round, snapshot: StateSnapshot) -> RuntimeResult<()> {
        let id = round.id;
        let cell = Arc::new(SnapshotCell::new(snapshot));
        let mut setup = RoundSetup::new(round, (self.factory)(), (self.links)())
            .with_config(self.config.scheduler.clone())
            .with_snapshot(Arc::clone(&cell));
        if let Some(client) = &self.client {
            setup = setup.with_client(Arc::clone(client));
        }

        let scheduler = setup.start(&self.config.agent)?;
        let handle = scheduler.spawn(Arc::clone(&self.clock))?;
        debug!(round = %id, "Round thread running");
        self.active = Some(ActiveRound {
            handle,
            snapshot: cell,
        });
        Ok(())
    }

    /// Stop the running round and wait for its `close`
    pub fn end_round(&mut self) -> RuntimeResult<Option<RoundOutcome>> {
        let Some(active) = self.active.take() else {
            return Ok(None);
        };
        let outcome = active.handle.stop()?;
        log_outcome(&outcome);
        Ok(Some(outcome))
    }

    /// Replace the running round's snapshot
    pub fn update_snapshot(&self, snapshot: StateSnapshot) -> RuntimeResult<u64> {
        let active = self.active.as_ref().ok_or(RuntimeError::NoActiveRound)?;
        Ok(active.snapshot.replace(snapshot))
    }

    /// Record one participant's new position in the running round
    pub fn update_position(&self, participant: ParticipantId, position: Position) -> RuntimeResult<u64> {
        let active = self.active.as_ref().ok_or(RuntimeError::NoActiveRound)?;
        Ok(active.snapshot.set_position(participant, position))
    }

    /// Apply one platform (or relayed) lifecycle event
    ///
    /// Returns the outcome of any round the event ended. State updates that
    /// arrive between rounds are dropped. A start event behaves like
    /// [`AgentRuntime::start_round`].
    pub fn handle_event(&mut self, event: RoundEvent) -> RuntimeResult<Option<RoundOutcome>> {
        match event {
            RoundEvent::Started { round, snapshot } => self.start_round(round, snapshot),
            RoundEvent::Snapshot { snapshot } => {
                self.ignore_between_rounds(self.update_snapshot(snapshot).map(|_| ()), "snapshot")?;
                Ok(None)
            }
            RoundEvent::Position {
                participant,
                position,
            } => {
                self.ignore_between_rounds(
                    self.update_position(participant, position).map(|_| ()),
                    "position",
                )?;
                Ok(None)
            }
            RoundEvent::Ended => self.end_round(),
        }
    }

    fn ignore_between_rounds(&self, result: RuntimeResult<()>, kind: &str) -> RuntimeResult<()> {
        match result {
            Err(RuntimeError::NoActiveRound) => {
                debug!(kind, "State update outside of a round");
                Ok(())
            }
            other => other,
        }
    }

    /// Drive rounds from an event stream until it ends
    ///
    /// A round whose setup fails is logged and skipped; the runtime then
    /// waits for the next round start. Errors that leave the runtime unable
    /// to serve rounds, such as a follower that never registered, end the
    /// loop. Returns the outcome of every round that ran.
    pub fn run<I>(&mut self, events: I) -> RuntimeResult<Vec<RoundOutcome>>
    where
        I: IntoIterator<Item = RoundEvent>,
    {
        let mut outcomes = Vec::new();
        for event in events {
            let name = event.name();
            let result = match self.end_superseded(&event) {
                Ok(ended) => {
                    outcomes.extend(ended);
                    self.handle_event(event)
                }
                Err(err) => Err(err),
            };
            match result {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(err) if err.is_recoverable() => {
                    warn!(event = name, error = %err, "Round event failed, waiting for the next round");
                }
                Err(err) => {
                    error!(event = name, error = %err, "Runtime cannot continue");
                    if let Err(close_err) = self.end_round() {
                        warn!(error = %close_err, "Round did not shut down cleanly");
                    }
                    return Err(err);
                }
            }
        }
        if let Some(outcome) = self.end_round()? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

impl<A: Agent> AgentRuntime<A> {
    /// End the running round ahead of a start for a different one, so its
    /// outcome survives a start that fails
    fn end_superseded(&mut self, event: &RoundEvent) -> RuntimeResult<Option<RoundOutcome>> {
        match event {
            RoundEvent::Started { round, .. } if self.current_round().is_some_and(|id| id != round.id) => {
                self.end_round()
            }
            _ => Ok(None),
        }
    }
}

impl<A: Agent> fmt::Debug for AgentRuntime<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("config", &self.config)
            .field("coordination", &self.coordination.name())
            .field("round", &self.current_round())
            .finish()
    }
}

fn log_outcome(outcome: &RoundOutcome) {
    if outcome.failure.is_none() && outcome.close_error.is_none() {
        info!(
            round = %outcome.round,
            passes = outcome.passes,
            fixed_steps = outcome.fixed_steps,
            "Round finished"
        );
        return;
    }
    let describe = |err: &Option<RoundError>| err.as_ref().map(|e| e.to_string()).unwrap_or_default();
    warn!(
        round = %outcome.round,
        passes = outcome.passes,
        failure = %describe(&outcome.failure),
        close_error = %describe(&outcome.close_error),
        "Round finished with errors"
    );
}
