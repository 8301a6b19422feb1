//! # Round Scheduler
//!
//! Drives one agent instance through a round: fixed-rate simulation steps
//! decoupled from a variable-rate update, with a cap on catch-up work per
//! pass so a slow pass degrades the simulation rate instead of snowballing.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::agent::{Agent, AgentLink, Context, Scope};
use crate::args::SetupArgs;
use crate::clock::{Clock, StopSignal, Ticker};
use crate::coroutine::CoroutineScheduler;
use crate::error::{AgentError, AgentResult, RoundError, RoundResult, TickPhase};
use crate::platform::PositionSink;
use crate::round::{Round, RoundId};
use crate::snapshot::{SnapshotCell, StateSnapshot};

/// Timing of the tick loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Simulated time consumed by one `fixed_update`
    #[serde(with = "crate::duration")]
    pub fixed_step: Duration,
    /// Minimum wall time between two passes; zero runs passes back to back
    #[serde(with = "crate::duration")]
    pub frame_interval: Duration,
    /// Most `fixed_update` calls a single pass may make
    pub max_catch_up: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fixed_step: Duration::from_millis(50),
            frame_interval: Duration::from_millis(50),
            max_catch_up: 5,
        }
    }
}

impl SchedulerConfig {
    pub fn with_fixed_step(mut self, fixed_step: Duration) -> Self {
        self.fixed_step = fixed_step;
        self
    }

    pub fn with_frame_interval(mut self, frame_interval: Duration) -> Self {
        self.frame_interval = frame_interval;
        self
    }

    pub fn with_max_catch_up(mut self, max_catch_up: u32) -> Self {
        self.max_catch_up = max_catch_up;
        self
    }

    pub fn validate(&self) -> Result<(), SchedulerConfigError> {
        if self.fixed_step.is_zero() {
            return Err(SchedulerConfigError::ZeroFixedStep);
        }
        if self.max_catch_up == 0 {
            return Err(SchedulerConfigError::ZeroCatchUp);
        }
        Ok(())
    }

    /// Nominal `fixed_update` calls per second
    pub fn tick_rate(&self) -> f64 {
        1.0 / self.fixed_step.as_secs_f64()
    }
}

/// Invalid [`SchedulerConfig`] values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerConfigError {
    #[error("fixed_step must be greater than zero")]
    ZeroFixedStep,

    #[error("max_catch_up must allow at least one step per pass")]
    ZeroCatchUp,
}

/// What one pass of the accumulator decided
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedStepPlan {
    /// `fixed_update` calls to make this pass
    pub steps: u32,
    /// Leftover fraction of a step after those calls, in `[0, 1)`
    pub sync_ratio: f64,
    /// Time debt dropped because the catch-up cap was reached
    pub discarded: Duration,
}

/// Fixed-timestep accumulator with a catch-up cap
#[derive(Debug, Clone)]
pub struct Accumulator {
    step: Duration,
    max_catch_up: u32,
    pending: Duration,
}

impl Accumulator {
    pub fn new(step: Duration, max_catch_up: u32) -> Self {
        Self {
            step,
            max_catch_up,
            pending: Duration::ZERO,
        }
    }

    pub fn pending(&self) -> Duration {
        self.pending
    }

    /// Add one frame of wall time and plan the fixed steps it pays for
    ///
    /// When the cap is reached, whatever is still pending beyond the capped
    /// steps is dropped so the next pass starts clean.
    pub fn advance(&mut self, frame_time: Duration) -> FixedStepPlan {
        self.pending += frame_time;

        let mut steps = 0;
        while self.pending >= self.step && steps < self.max_catch_up {
            self.pending -= self.step;
            steps += 1;
        }

        let discarded = if steps == self.max_catch_up {
            std::mem::take(&mut self.pending)
        } else {
            Duration::ZERO
        };

        let sync_ratio = if self.step.is_zero() {
            0.0
        } else {
            self.pending.as_secs_f64() / self.step.as_secs_f64()
        };

        FixedStepPlan {
            steps,
            sync_ratio,
            discarded,
        }
    }
}

/// Summary of one pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassReport {
    pub fixed_steps: u32,
    pub sync_ratio: f64,
    pub discarded: Duration,
    pub messages: usize,
    pub coroutines_resumed: usize,
}

/// How a round went, returned once the agent has been closed
#[derive(Debug)]
pub struct RoundOutcome {
    pub round: RoundId,
    pub passes: u64,
    pub fixed_steps: u64,
    /// Total time debt dropped by the catch-up cap
    pub discarded: Duration,
    /// The hook that stopped the round early, if any
    pub failed_in: Option<TickPhase>,
    /// The failure itself when the round ran on its own thread
    pub failure: Option<RoundError>,
    pub close_error: Option<RoundError>,
}

impl RoundOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed_in.is_none() && self.failure.is_none() && self.close_error.is_none()
    }
}

/// Everything needed to start a round
pub struct RoundSetup<A: Agent> {
    config: SchedulerConfig,
    round: Round,
    agent: A,
    link: A::Link,
    snapshot: Option<Arc<SnapshotCell>>,
    client: Option<Arc<dyn PositionSink>>,
}

impl<A: Agent> RoundSetup<A> {
    pub fn new(round: Round, agent: A, link: A::Link) -> Self {
        Self {
            config: SchedulerConfig::default(),
            round,
            agent,
            link,
            snapshot: None,
            client: None,
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a snapshot cell with whoever delivers state updates
    pub fn with_snapshot(mut self, snapshot: Arc<SnapshotCell>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_client(mut self, client: Arc<dyn PositionSink>) -> Self {
        self.client = Some(client);
        self
    }

    /// Bind the link, run `setup`, and hand back a scheduler ready to tick
    ///
    /// A failing `setup` still gets a best-effort `close`.
    pub fn start(self, args: &SetupArgs) -> RoundResult<RoundScheduler<A>> {
        let RoundSetup {
            config,
            round,
            agent,
            mut link,
            snapshot,
            client,
        } = self;

        link.on_round_start(&round)?;

        let snapshot = snapshot.unwrap_or_else(|| {
            Arc::new(SnapshotCell::new(StateSnapshot::at_origin(
                round.participant_ids(),
            )))
        });

        let mut scheduler = RoundScheduler {
            accumulator: Accumulator::new(config.fixed_step, config.max_catch_up),
            config,
            round,
            agent,
            link,
            snapshot,
            client,
            coroutines: CoroutineScheduler::new(),
            failed_in: None,
            passes: 0,
            fixed_steps: 0,
            discarded: Duration::ZERO,
        };

        info!(round = %scheduler.round.id, "Starting round");
        if let Err(source) = scheduler.call(|agent, ctx| agent.setup(ctx, args)) {
            let round = scheduler.round.id;
            error!(%round, error = %source, "Agent setup failed");
            let outcome = scheduler.close();
            if let Some(err) = outcome.close_error {
                warn!(%round, error = %err, "Close after failed setup also failed");
            }
            return Err(RoundError::SetupFailed { round, source });
        }

        Ok(scheduler)
    }
}

/// One agent instance bound to one round
pub struct RoundScheduler<A: Agent> {
    config: SchedulerConfig,
    round: Round,
    agent: A,
    link: A::Link,
    snapshot: Arc<SnapshotCell>,
    client: Option<Arc<dyn PositionSink>>,
    coroutines: CoroutineScheduler<A>,
    accumulator: Accumulator,
    failed_in: Option<TickPhase>,
    passes: u64,
    fixed_steps: u64,
    discarded: Duration,
}

impl<A: Agent> RoundScheduler<A> {
    pub fn round(&self) -> &Round {
        &self.round
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    /// Cell that state updates for this round should be written to
    pub fn snapshot_cell(&self) -> Arc<SnapshotCell> {
        self.snapshot.clone()
    }

    /// Coroutines still waiting to run
    pub fn pending_coroutines(&self) -> usize {
        self.coroutines.len()
    }

    pub fn is_failed(&self) -> bool {
        self.failed_in.is_some()
    }

    /// Run a single pass that covers `frame_time` of wall time
    ///
    /// Order: link bookkeeping, capped `fixed_update` catch-up, one `update`,
    /// inbound messages, due coroutines, link forwarding. The first failing
    /// hook ends the pass and every later call returns
    /// [`RoundError::Halted`].
    pub fn run_pass(&mut self, frame_time: Duration) -> RoundResult<PassReport> {
        if self.failed_in.is_some() {
            return Err(RoundError::Halted(self.round.id));
        }

        match self.pass(frame_time) {
            Ok(report) => Ok(report),
            Err((phase, source)) => {
                self.failed_in = Some(phase);
                error!(round = %self.round.id, %phase, error = %source, "Round failed");
                Err(RoundError::TickFailed {
                    round: self.round.id,
                    phase,
                    source,
                })
            }
        }
    }

    fn pass(&mut self, frame_time: Duration) -> Result<PassReport, (TickPhase, AgentError)> {
        self.coroutines.advance(frame_time);
        self.link.before_pass();

        let plan = self.accumulator.advance(frame_time);
        if !plan.discarded.is_zero() {
            if self.discarded.is_zero() {
                warn!(
                    round = %self.round.id,
                    steps = plan.steps,
                    discarded_ms = plan.discarded.as_millis() as u64,
                    "Catch-up cap reached, dropping time debt"
                );
            }
            self.discarded += plan.discarded;
        }

        let step = self.config.fixed_step;
        for _ in 0..plan.steps {
            self.call(|agent, ctx| agent.fixed_update(ctx, step, plan.sync_ratio))
                .map_err(|e| (TickPhase::FixedUpdate, e))?;
            self.fixed_steps += 1;
        }

        self.call(|agent, ctx| agent.update(ctx, frame_time))
            .map_err(|e| (TickPhase::Update, e))?;

        let inbound = self.link.drain_inbound();
        let messages = inbound.len();
        for message in inbound {
            self.call(|agent, ctx| agent.on_message(ctx, message))
                .map_err(|e| (TickPhase::Message, e))?;
        }

        let coroutines_resumed = self.drain_coroutines().map_err(|e| (TickPhase::Coroutine, e))?;

        let snapshot = self.snapshot.current();
        self.link.after_pass(&snapshot);
        self.passes += 1;

        Ok(PassReport {
            fixed_steps: plan.steps,
            sync_ratio: plan.sync_ratio,
            discarded: plan.discarded,
            messages,
            coroutines_resumed,
        })
    }

    /// Call `close`, drop outstanding coroutines and release the link
    ///
    /// Consumes the scheduler, so no hook can run afterwards.
    pub fn close(mut self) -> RoundOutcome {
        let round = self.round.id;
        let close_error = match self.call(|agent, ctx| agent.close(ctx)) {
            Ok(()) => None,
            Err(source) => {
                error!(%round, error = %source, "Agent close failed");
                Some(RoundError::CloseFailed { round, source })
            }
        };

        self.coroutines.cancel_all();
        self.link.on_round_end();

        if !self.discarded.is_zero() {
            warn!(
                %round,
                discarded_ms = self.discarded.as_millis() as u64,
                "Round fell behind wall-clock time"
            );
        }
        info!(%round, passes = self.passes, fixed_steps = self.fixed_steps, "Round closed");

        RoundOutcome {
            round,
            passes: self.passes,
            fixed_steps: self.fixed_steps,
            discarded: self.discarded,
            failed_in: self.failed_in,
            failure: None,
            close_error,
        }
    }

    /// Run the tick loop on its own thread until stopped or failed
    pub fn spawn(self, clock: Arc<dyn Clock>) -> RoundResult<RoundHandle> {
        let round = self.round.id;
        let stop = Arc::new(StopSignal::new());
        let signal = stop.clone();

        let thread = thread::Builder::new()
            .name(format!("hans-round-{round}"))
            .spawn(move || self.run_loop(clock.as_ref(), &signal))
            .map_err(RoundError::ThreadSpawn)?;

        Ok(RoundHandle {
            round,
            stop,
            thread: Some(thread),
        })
    }

    fn run_loop(mut self, clock: &dyn Clock, stop: &StopSignal) -> RoundOutcome {
        let frame = self.config.frame_interval;
        let mut ticker = Ticker::start(clock);
        let mut failure = None;

        while !stop.is_triggered() {
            let frame_time = ticker.tick(clock);
            if let Err(err) = self.run_pass(frame_time) {
                failure = Some(err);
                break;
            }
            if let Some(remaining) = ticker.remaining(clock, frame) {
                if stop.wait_timeout(remaining) {
                    break;
                }
            }
        }

        debug!(round = %self.round.id, "Tick loop stopped");
        let mut outcome = self.close();
        outcome.failure = failure;
        outcome
    }

    fn drain_coroutines(&mut self) -> AgentResult<usize> {
        let mut scope = Scope {
            round: &self.round,
            snapshot: self.snapshot.current(),
            client: self.client.as_deref(),
            link: &mut self.link,
        };
        let coroutines = &mut self.coroutines;
        let agent = &mut self.agent;
        catch_panic(|| coroutines.drain(agent, &mut scope))
    }

    fn call<R>(
        &mut self,
        hook: impl FnOnce(&mut A, &mut Context<'_, A>) -> AgentResult<R>,
    ) -> AgentResult<R> {
        let elapsed = self.coroutines.elapsed();
        let mut scope = Scope {
            round: &self.round,
            snapshot: self.snapshot.current(),
            client: self.client.as_deref(),
            link: &mut self.link,
        };
        let mut ctx = scope.context(self.coroutines.incoming(), elapsed);
        let agent = &mut self.agent;
        catch_panic(|| hook(agent, &mut ctx))
    }
}

/// Handle to a round running on its own thread
///
/// Dropping the handle stops the round and waits for `close`.
#[derive(Debug)]
pub struct RoundHandle {
    round: RoundId,
    stop: Arc<StopSignal>,
    thread: Option<thread::JoinHandle<RoundOutcome>>,
}

impl RoundHandle {
    pub fn round(&self) -> RoundId {
        self.round
    }

    /// True once the tick loop has exited on its own (after a failure)
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Stop ticking, wait for `close` to return, and report the outcome
    pub fn stop(mut self) -> RoundResult<RoundOutcome> {
        self.stop.trigger();
        self.join()
    }

    fn join(&mut self) -> RoundResult<RoundOutcome> {
        let thread = self.thread.take().ok_or(RoundError::Halted(self.round))?;
        thread
            .join()
            .map_err(|_| RoundError::ThreadPanicked(self.round))
    }
}

impl Drop for RoundHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop.trigger();
            if let Err(err) = self.join() {
                error!(round = %self.round, error = %err, "Round thread did not shut down cleanly");
            }
        }
    }
}

fn catch_panic<R>(f: impl FnOnce() -> AgentResult<R>) -> AgentResult<R> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(AgentError::Panicked(panic_message(payload.as_ref())))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::coroutine::{Step, from_fn};
    use crate::platform::RecordingSink;
    use crate::snapshot::Position;
    use proptest::prelude::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Setup,
        Fixed(f64),
        Update(Duration),
        Close,
    }

    #[derive(Default)]
    struct Probe {
        calls: Arc<Mutex<Vec<Call>>>,
        fail_setup: bool,
        fail_update_at: Option<usize>,
        panic_in_fixed: bool,
    }

    impl Probe {
        fn log(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Agent for Probe {
        type Link = ();

        fn setup(&mut self, _ctx: &mut Context<'_, Self>, _args: &SetupArgs) -> AgentResult<()> {
            self.log(Call::Setup);
            if self.fail_setup {
                return Err(AgentError::failed("bad args"));
            }
            Ok(())
        }

        fn fixed_update(
            &mut self,
            _ctx: &mut Context<'_, Self>,
            _delta: Duration,
            sync_ratio: f64,
        ) -> AgentResult<()> {
            if self.panic_in_fixed {
                panic!("exploded");
            }
            self.log(Call::Fixed(sync_ratio));
            Ok(())
        }

        fn update(&mut self, ctx: &mut Context<'_, Self>, delta: Duration) -> AgentResult<()> {
            self.log(Call::Update(delta));
            let updates = self
                .calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| matches!(c, Call::Update(_)))
                .count();
            if self.fail_update_at == Some(updates) {
                return Err(AgentError::failed("update broke"));
            }
            if ctx.client().is_some() {
                ctx.submit_position(Position::new(updates as f64, 0.0))?;
            }
            Ok(())
        }

        fn close(&mut self, _ctx: &mut Context<'_, Self>) -> AgentResult<()> {
            self.log(Call::Close);
            Ok(())
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_fixed_step(Duration::from_millis(50))
            .with_max_catch_up(3)
    }

    fn round() -> Round {
        Round::new(9, Duration::from_secs(30))
    }

    #[test]
    fn test_default_config_is_twenty_hertz() {
        let config = SchedulerConfig::default();
        assert_eq!(config.tick_rate(), 20.0);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.clone().with_max_catch_up(0).validate(),
            Err(SchedulerConfigError::ZeroCatchUp)
        );
        assert_eq!(
            config.with_fixed_step(Duration::ZERO).validate(),
            Err(SchedulerConfigError::ZeroFixedStep)
        );
    }

    #[test]
    fn test_accumulator_carries_leftover() {
        let mut acc = Accumulator::new(Duration::from_millis(50), 5);
        let plan = acc.advance(Duration::from_millis(120));
        assert_eq!(plan.steps, 2);
        assert!((plan.sync_ratio - 0.4).abs() < 1e-9);
        assert_eq!(acc.pending(), Duration::from_millis(20));

        let plan = acc.advance(Duration::from_millis(30));
        assert_eq!(plan.steps, 1);
        assert_eq!(plan.sync_ratio, 0.0);
    }

    #[test]
    fn test_accumulator_discards_beyond_cap() {
        let mut acc = Accumulator::new(Duration::from_millis(50), 5);
        let plan = acc.advance(Duration::from_millis(1_000));
        assert_eq!(plan.steps, 5);
        assert_eq!(plan.discarded, Duration::from_millis(750));
        assert_eq!(acc.pending(), Duration::ZERO);
    }

    #[test]
    fn test_setup_once_before_ticks_and_close_last() {
        let probe = Probe::default();
        let calls = probe.calls.clone();
        let mut sched = RoundSetup::new(round(), probe, ())
            .with_config(config())
            .start(&SetupArgs::new())
            .unwrap();

        sched.run_pass(Duration::from_millis(110)).unwrap();
        sched.run_pass(Duration::from_millis(40)).unwrap();
        let outcome = sched.close();

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.first(), Some(&Call::Setup));
        assert_eq!(calls.last(), Some(&Call::Close));
        assert_eq!(calls.iter().filter(|c| **c == Call::Setup).count(), 1);
        assert_eq!(calls.iter().filter(|c| **c == Call::Close).count(), 1);
        assert_eq!(outcome.passes, 2);
        assert_eq!(outcome.fixed_steps, 3);
        assert!(outcome.is_clean());
    }

    #[test]
    fn test_failed_setup_still_closes() {
        let probe = Probe {
            fail_setup: true,
            ..Probe::default()
        };
        let calls = probe.calls.clone();
        let err = RoundSetup::new(round(), probe, ())
            .start(&SetupArgs::new())
            .err()
            .unwrap();

        assert!(matches!(err, RoundError::SetupFailed { .. }));
        assert_eq!(*calls.lock().unwrap(), vec![Call::Setup, Call::Close]);
    }

    #[test]
    fn test_tick_failure_halts_round() {
        let probe = Probe {
            fail_update_at: Some(2),
            ..Probe::default()
        };
        let calls = probe.calls.clone();
        let mut sched = RoundSetup::new(round(), probe, ())
            .with_config(config())
            .start(&SetupArgs::new())
            .unwrap();

        sched.run_pass(Duration::from_millis(50)).unwrap();
        let err = sched.run_pass(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(
            err,
            RoundError::TickFailed {
                phase: TickPhase::Update,
                ..
            }
        ));
        assert!(matches!(
            sched.run_pass(Duration::from_millis(50)),
            Err(RoundError::Halted(_))
        ));

        let outcome = sched.close();
        assert_eq!(outcome.failed_in, Some(TickPhase::Update));
        let updates = calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, Call::Update(_)))
            .count();
        assert_eq!(updates, 2);
    }

    #[test]
    fn test_panicking_hook_becomes_tick_failure() {
        let probe = Probe {
            panic_in_fixed: true,
            ..Probe::default()
        };
        let mut sched = RoundSetup::new(round(), probe, ())
            .start(&SetupArgs::new())
            .unwrap();

        let err = sched.run_pass(Duration::from_millis(60)).unwrap_err();
        match err {
            RoundError::TickFailed {
                phase: TickPhase::FixedUpdate,
                source: AgentError::Panicked(msg),
                ..
            } => assert_eq!(msg, "exploded"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_update_submits_through_client() {
        let sink = Arc::new(RecordingSink::new());
        let mut sched = RoundSetup::new(round(), Probe::default(), ())
            .with_client(sink.clone())
            .start(&SetupArgs::new())
            .unwrap();

        sched.run_pass(Duration::from_millis(50)).unwrap();
        sched.run_pass(Duration::from_millis(50)).unwrap();
        assert_eq!(sink.last(), Some(Position::new(2.0, 0.0)));
        sched.close();
    }

    #[test]
    fn test_close_drops_outstanding_coroutines() {
        struct Spawner {
            resumed: Arc<Mutex<u32>>,
        }

        impl Agent for Spawner {
            type Link = ();

            fn setup(&mut self, ctx: &mut Context<'_, Self>, _args: &SetupArgs) -> AgentResult<()> {
                for _ in 0..2 {
                    ctx.start_coroutine(from_fn(|agent: &mut Spawner, _ctx: &mut Context<'_, Spawner>| {
                        *agent.resumed.lock().unwrap() += 1;
                        Ok(Step::next_tick())
                    }));
                }
                Ok(())
            }
        }

        let resumed = Arc::new(Mutex::new(0));
        let mut sched = RoundSetup::new(
            round(),
            Spawner {
                resumed: resumed.clone(),
            },
            (),
        )
        .start(&SetupArgs::new())
        .unwrap();

        sched.run_pass(Duration::from_millis(50)).unwrap();
        assert_eq!(*resumed.lock().unwrap(), 2);
        assert_eq!(sched.pending_coroutines(), 2);

        sched.close();
        assert_eq!(*resumed.lock().unwrap(), 2);
    }

    #[test]
    fn test_spawned_round_stops_and_closes() {
        let probe = Probe::default();
        let calls = probe.calls.clone();
        let sched = RoundSetup::new(round(), probe, ())
            .with_config(
                config()
                    .with_fixed_step(Duration::from_millis(5))
                    .with_frame_interval(Duration::from_millis(5)),
            )
            .start(&SetupArgs::new())
            .unwrap();

        let handle = sched.spawn(Arc::new(SystemClock)).unwrap();
        thread::sleep(Duration::from_millis(60));
        let outcome = handle.stop().unwrap();

        assert!(outcome.passes > 0);
        assert!(outcome.failure.is_none());
        let calls = calls.lock().unwrap();
        assert_eq!(calls.last(), Some(&Call::Close));
    }

    #[test]
    fn test_spawned_round_reports_failure() {
        let probe = Probe {
            fail_update_at: Some(1),
            ..Probe::default()
        };
        let calls = probe.calls.clone();
        let sched = RoundSetup::new(round(), probe, ())
            .with_config(config().with_frame_interval(Duration::from_millis(1)))
            .start(&SetupArgs::new())
            .unwrap();

        let handle = sched.spawn(Arc::new(SystemClock)).unwrap();
        let outcome = handle.stop().unwrap();
        // Whether or not the failing pass ran before the stop, close ran last
        assert_eq!(calls.lock().unwrap().last(), Some(&Call::Close));
        if let Some(err) = outcome.failure {
            assert!(matches!(err, RoundError::TickFailed { .. }));
        }
    }

    proptest! {
        #[test]
        fn prop_steps_never_exceed_cap(
            frames in prop::collection::vec(0u64..2_000, 1..100),
            step_ms in 1u64..200,
            cap in 1u32..10,
        ) {
            let step = Duration::from_millis(step_ms);
            let mut acc = Accumulator::new(step, cap);
            for frame in frames {
                let before = acc.pending() + Duration::from_millis(frame);
                let plan = acc.advance(Duration::from_millis(frame));
                prop_assert!(plan.steps <= cap);

                let capped = step * cap;
                let expected = before.saturating_sub(capped);
                if plan.steps == cap {
                    prop_assert_eq!(plan.discarded, expected);
                } else {
                    prop_assert_eq!(plan.discarded, Duration::ZERO);
                    prop_assert_eq!(expected, Duration::ZERO);
                }
            }
        }

        #[test]
        fn prop_sync_ratio_in_unit_interval(
            frames in prop::collection::vec(0u64..500_000, 1..100),
            step_us in 1u64..100_000,
            cap in 1u32..8,
        ) {
            let mut acc = Accumulator::new(Duration::from_micros(step_us), cap);
            for frame in frames {
                let plan = acc.advance(Duration::from_micros(frame));
                prop_assert!(plan.sync_ratio >= 0.0);
                prop_assert!(plan.sync_ratio < 1.0);
            }
        }
    }
}
