//! Time sources and the interruptible wait used by the tick thread

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Monotonic time source
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to
///
/// Used to drive the scheduler deterministically in tests.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Measures the time between consecutive passes
#[derive(Debug)]
pub struct Ticker {
    last: Instant,
}

impl Ticker {
    pub fn start(clock: &dyn Clock) -> Self {
        Self { last: clock.now() }
    }

    /// Time elapsed since the previous call (or since `start`)
    pub fn tick(&mut self, clock: &dyn Clock) -> Duration {
        let now = clock.now();
        let delta = now.saturating_duration_since(self.last);
        self.last = now;
        delta
    }

    /// How much of `frame` is left after the current pass started
    pub fn remaining(&self, clock: &dyn Clock, frame: Duration) -> Option<Duration> {
        let spent = clock.now().saturating_duration_since(self.last);
        frame.checked_sub(spent).filter(|left| !left.is_zero())
    }
}

/// One-shot stop flag that sleeping threads can wait on
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        *stopped = true;
        self.cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for at most `timeout`; returns `true` if the signal fired
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (stopped, _) = self
            .cond
            .wait_timeout_while(stopped, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *stopped
    }
}
