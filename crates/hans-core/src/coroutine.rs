//! # Coroutines
//!
//! Cooperative multi-tick tasks. A task is an explicit state object that the
//! scheduler polls; it tells the scheduler when to poll it again by returning
//! a [`Step`]. Suspension only happens at those returns, never inside a hook.
//!
//! Time here is tick time: the scheduler's clock only moves when the round
//! scheduler advances it, once per pass.

use std::fmt;
use std::time::Duration;

use tracing::debug;

use crate::agent::{Agent, Context, Scope};
use crate::error::AgentResult;

/// When a suspended task wants to run again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// On the very next drain
    NextTick,
    /// On the first drain at least this much tick time later
    After(Duration),
}

/// What a task did when it was resumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Suspend(Wake),
    Done,
}

impl Step {
    /// Yield until the next drain
    pub fn next_tick() -> Self {
        Step::Suspend(Wake::NextTick)
    }

    /// Yield for `duration` of tick time
    pub fn sleep(duration: Duration) -> Self {
        Step::Suspend(Wake::After(duration))
    }
}

/// A suspendable unit of agent logic
///
/// Each call to `resume` runs the task up to its next suspension point. A
/// task that busy-waits with `Step::next_tick()` costs one resumption per
/// pass; logic that needs no waiting belongs in `update` instead.
pub trait Coroutine<A: Agent>: Send {
    fn resume(&mut self, agent: &mut A, ctx: &mut Context<'_, A>) -> AgentResult<Step>;
}

/// Coroutine backed by a closure, see [`from_fn`]
pub struct FromFn<F>(F);

/// Turn a closure into a coroutine
///
/// The closure is called once per resumption and keeps its own state in its
/// captures.
pub fn from_fn<A, F>(f: F) -> FromFn<F>
where
    A: Agent,
    F: FnMut(&mut A, &mut Context<'_, A>) -> AgentResult<Step> + Send,
{
    FromFn(f)
}

impl<A, F> Coroutine<A> for FromFn<F>
where
    A: Agent,
    F: FnMut(&mut A, &mut Context<'_, A>) -> AgentResult<Step> + Send,
{
    fn resume(&mut self, agent: &mut A, ctx: &mut Context<'_, A>) -> AgentResult<Step> {
        (self.0)(agent, ctx)
    }
}

/// Identifier of a task within one round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Due {
    NextDrain,
    At(Duration),
}

impl Due {
    fn from_delay(now: Duration, delay: Duration) -> Self {
        if delay.is_zero() {
            Due::NextDrain
        } else {
            Due::At(now + delay)
        }
    }

    fn is_due(&self, now: Duration) -> bool {
        match self {
            Due::NextDrain => true,
            Due::At(deadline) => now >= *deadline,
        }
    }
}

/// A task that was started but not yet adopted by the scheduler
pub(crate) struct Spawned<A: Agent> {
    coroutine: Box<dyn Coroutine<A>>,
    delay: Duration,
    started_at: Option<Duration>,
}

impl<A: Agent> Spawned<A> {
    pub(crate) fn new(coroutine: Box<dyn Coroutine<A>>, delay: Duration) -> Self {
        Self {
            coroutine,
            delay,
            started_at: None,
        }
    }

    /// Pin the start time; a spawn from a hook gets the hook's tick time
    pub(crate) fn at(mut self, now: Duration) -> Self {
        self.started_at = Some(now);
        self
    }
}

struct Task<A: Agent> {
    id: TaskId,
    coroutine: Box<dyn Coroutine<A>>,
    due: Due,
}

/// Poll loop over the coroutines of one agent instance
///
/// Dropping the scheduler drops every outstanding task without resuming it.
pub struct CoroutineScheduler<A: Agent> {
    tasks: Vec<Task<A>>,
    incoming: Vec<Spawned<A>>,
    elapsed: Duration,
    next_id: u64,
}

impl<A: Agent> CoroutineScheduler<A> {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            incoming: Vec::new(),
            elapsed: Duration::ZERO,
            next_id: 0,
        }
    }

    /// Register a task for the next drain
    pub fn start<C>(&mut self, coroutine: C)
    where
        C: Coroutine<A> + 'static,
    {
        self.start_after(coroutine, Duration::ZERO);
    }

    /// Register a task whose first resumption waits `delay` of tick time
    pub fn start_after<C>(&mut self, coroutine: C, delay: Duration)
    where
        C: Coroutine<A> + 'static,
    {
        let spawned = Spawned::new(Box::new(coroutine), delay).at(self.elapsed);
        self.incoming.push(spawned);
    }

    /// Move tick time forward; called once per pass before any hook
    pub fn advance(&mut self, delta: Duration) {
        self.elapsed += delta;
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Outstanding tasks, including ones not yet adopted
    pub fn len(&self) -> usize {
        self.tasks.len() + self.incoming.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every outstanding task; none of them is resumed again
    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.len();
        self.tasks.clear();
        self.incoming.clear();
        if cancelled > 0 {
            debug!(cancelled, "Cancelled outstanding coroutines");
        }
        cancelled
    }

    /// Buffer that hook contexts push new tasks into
    pub(crate) fn incoming(&mut self) -> &mut Vec<Spawned<A>> {
        &mut self.incoming
    }

    /// Resume every due task once, in registration order
    ///
    /// Tasks started before this call are adopted first. Tasks started while
    /// draining wait for the next drain. The first error stops the drain and
    /// is returned; the failing task is discarded.
    pub(crate) fn drain(&mut self, agent: &mut A, scope: &mut Scope<'_, A>) -> AgentResult<usize> {
        self.adopt();
        if self.tasks.is_empty() {
            return Ok(0);
        }

        let now = self.elapsed;
        let mut pending = std::mem::take(&mut self.tasks).into_iter();
        let mut kept = Vec::with_capacity(pending.len());
        let mut resumed = 0;
        let mut failure = None;

        for mut task in pending.by_ref() {
            if !task.due.is_due(now) {
                kept.push(task);
                continue;
            }

            let step = {
                let mut ctx = scope.context(&mut self.incoming, now);
                task.coroutine.resume(agent, &mut ctx)
            };
            resumed += 1;

            match step {
                Ok(Step::Done) => debug!(task = %task.id, "Coroutine finished"),
                Ok(Step::Suspend(Wake::NextTick)) => {
                    task.due = Due::NextDrain;
                    kept.push(task);
                }
                Ok(Step::Suspend(Wake::After(delay))) => {
                    task.due = Due::from_delay(now, delay);
                    kept.push(task);
                }
                Err(err) => {
                    debug!(task = %task.id, error = %err, "Coroutine failed");
                    failure = Some(err);
                    break;
                }
            }
        }

        kept.extend(pending);
        self.tasks = kept;

        match failure {
            Some(err) => Err(err),
            None => Ok(resumed),
        }
    }

    fn adopt(&mut self) {
        for spawned in std::mem::take(&mut self.incoming) {
            let id = TaskId(self.next_id);
            self.next_id += 1;
            let started_at = spawned.started_at.unwrap_or(self.elapsed);
            debug!(task = %id, delay = ?spawned.delay, "Coroutine scheduled");
            self.tasks.push(Task {
                id,
                coroutine: spawned.coroutine,
                due: Due::from_delay(started_at, spawned.delay),
            });
        }
    }
}

impl<A: Agent> Default for CoroutineScheduler<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Agent> fmt::Debug for CoroutineScheduler<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineScheduler")
            .field("tasks", &self.tasks.len())
            .field("incoming", &self.incoming.len())
            .field("elapsed", &self.elapsed)
            .finish()
    }
}
