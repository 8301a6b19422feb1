//! Step-builder coroutines
//!
//! [`Sequence`] strings actions and waits together so a multi-tick workflow
//! reads top to bottom:
//!
//! ```rust,ignore
//! ctx.start_coroutine(
//!     Sequence::new()
//!         .then(|agent: &mut Scout, _ctx| { agent.target = Some(CORNER); Ok(()) })
//!         .sleep(Duration::from_secs(3))
//!         .wait_until(|agent: &Scout, ctx| agent.arrived(ctx.snapshot()))
//!         .then(|agent: &mut Scout, _ctx| { agent.target = None; Ok(()) }),
//! );
//! ```

use std::time::Duration;

use crate::agent::{Agent, Context};
use crate::coroutine::{Coroutine, Step};
use crate::error::AgentResult;

type Action<A> = Box<dyn FnMut(&mut A, &mut Context<'_, A>) -> AgentResult<()> + Send>;
type Predicate<A> = Box<dyn FnMut(&A, &Context<'_, A>) -> bool + Send>;

enum Stage<A: Agent> {
    Run(Action<A>),
    Sleep(Duration),
    NextTick,
    WaitUntil(Predicate<A>),
}

/// A coroutine authored as an explicit list of stages
///
/// The cursor only moves forward; `repeat()` rewinds it to the first stage
/// after the last one, yielding a tick in between so that a loop without any
/// wait stage cannot starve the pass.
pub struct Sequence<A: Agent> {
    stages: Vec<Stage<A>>,
    cursor: usize,
    repeat: bool,
}

impl<A: Agent> Sequence<A> {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            cursor: 0,
            repeat: false,
        }
    }

    /// Run an action, then continue immediately with the next stage
    pub fn then<F>(mut self, action: F) -> Self
    where
        F: FnMut(&mut A, &mut Context<'_, A>) -> AgentResult<()> + Send + 'static,
    {
        self.stages.push(Stage::Run(Box::new(action)));
        self
    }

    /// Suspend for `duration` of tick time
    pub fn sleep(mut self, duration: Duration) -> Self {
        self.stages.push(Stage::Sleep(duration));
        self
    }

    /// Suspend until the next drain
    pub fn next_tick(mut self) -> Self {
        self.stages.push(Stage::NextTick);
        self
    }

    /// Check `predicate` once per drain and continue once it holds
    pub fn wait_until<P>(mut self, predicate: P) -> Self
    where
        P: FnMut(&A, &Context<'_, A>) -> bool + Send + 'static,
    {
        self.stages.push(Stage::WaitUntil(Box::new(predicate)));
        self
    }

    /// Start over from the first stage once the last one completes
    pub fn repeat(mut self) -> Self {
        self.repeat = true;
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl<A: Agent> Default for Sequence<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Agent> Coroutine<A> for Sequence<A> {
    fn resume(&mut self, agent: &mut A, ctx: &mut Context<'_, A>) -> AgentResult<Step> {
        loop {
            let Some(stage) = self.stages.get_mut(self.cursor) else {
                if self.repeat && !self.stages.is_empty() {
                    self.cursor = 0;
                    return Ok(Step::next_tick());
                }
                return Ok(Step::Done);
            };

            match stage {
                Stage::Run(action) => {
                    action(agent, ctx)?;
                    self.cursor += 1;
                }
                Stage::Sleep(duration) => {
                    let duration = *duration;
                    self.cursor += 1;
                    return Ok(Step::sleep(duration));
                }
                Stage::NextTick => {
                    self.cursor += 1;
                    return Ok(Step::next_tick());
                }
                Stage::WaitUntil(predicate) => {
                    if !predicate(agent, ctx) {
                        return Ok(Step::next_tick());
                    }
                    self.cursor += 1;
                }
            }
        }
    }
}
