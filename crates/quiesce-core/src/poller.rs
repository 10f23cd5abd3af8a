//! Bounded polling of boolean conditions.
//!
//! [`wait_until`] re-evaluates a predicate every `poll_interval` until it
//! holds or `timeout` elapses. It never spawns anything: the predicate runs on
//! the calling thread and the only suspension point is a sleep that is cut
//! short at the deadline. That makes it usable both for the synchronizer's
//! idle wait (on the UI thread) and for user conditions that must observe
//! state from a particular thread.
//!
//! [`wait_until_async`] is the same loop for async callers on the driver side.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use quiesce_core::poller::{wait_until, PollOutcome};
//!
//! let mut calls = 0;
//! let outcome = wait_until(
//!     || {
//!         calls += 1;
//!         calls == 3
//!     },
//!     Duration::from_millis(5),
//!     Duration::from_secs(1),
//! );
//! assert_eq!(outcome, PollOutcome::Satisfied);
//! ```

use std::time::{Duration, Instant};

use tracing::trace;

/// Lower bound applied to poll intervals so a zero interval cannot spin.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Satisfied,
    TimedOut,
}

impl PollOutcome {
    pub fn is_satisfied(self) -> bool {
        self == PollOutcome::Satisfied
    }
}

/// Blocks the current thread until `predicate` returns `true` or `timeout`
/// elapses.
///
/// The predicate is evaluated immediately, then once per `poll_interval`. The
/// last sleep is trimmed to the deadline. A wake-up past the deadline returns
/// [`PollOutcome::TimedOut`] without evaluating the predicate again, so
/// `Satisfied` is only ever reported within `timeout`.
pub fn wait_until<F>(mut predicate: F, poll_interval: Duration, timeout: Duration) -> PollOutcome
where
    F: FnMut() -> bool,
{
    let interval = poll_interval.max(MIN_POLL_INTERVAL);
    let deadline = Instant::now() + timeout;
    let mut polls: u32 = 0;

    loop {
        polls += 1;
        if predicate() {
            trace!(polls, "condition satisfied");
            return PollOutcome::Satisfied;
        }
        let now = Instant::now();
        if now >= deadline {
            trace!(polls, "condition timed out");
            return PollOutcome::TimedOut;
        }
        std::thread::sleep(interval.min(deadline - now));
        if Instant::now() > deadline {
            trace!(polls, "condition timed out");
            return PollOutcome::TimedOut;
        }
    }
}

/// Async counterpart of [`wait_until`] built on [`tokio::time::sleep`].
pub async fn wait_until_async<F>(
    mut predicate: F,
    poll_interval: Duration,
    timeout: Duration,
) -> PollOutcome
where
    F: FnMut() -> bool,
{
    let interval = poll_interval.max(MIN_POLL_INTERVAL);
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if predicate() {
            return PollOutcome::Satisfied;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return PollOutcome::TimedOut;
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
        if tokio::time::Instant::now() > deadline {
            return PollOutcome::TimedOut;
        }
    }
}

/// A named predicate that can be waited on repeatedly.
///
/// The name only shows up in logs, which makes it easy to tell which of a
/// test's conditions gave up.
pub struct Condition {
    name: String,
    predicate: Box<dyn FnMut() -> bool + Send>,
}

impl Condition {
    pub fn new(name: impl Into<String>, predicate: impl FnMut() -> bool + Send + 'static) -> Self {
        Self {
            name: name.into(),
            predicate: Box::new(predicate),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until the condition holds or `timeout` elapses.
    pub fn wait(&mut self, poll_interval: Duration, timeout: Duration) -> PollOutcome {
        let outcome = wait_until(&mut self.predicate, poll_interval, timeout);
        trace!(condition = %self.name, ?outcome, "condition wait finished");
        outcome
    }

    /// Waits asynchronously until the condition holds or `timeout` elapses.
    pub async fn wait_async(&mut self, poll_interval: Duration, timeout: Duration) -> PollOutcome {
        let outcome = wait_until_async(&mut self.predicate, poll_interval, timeout).await;
        trace!(condition = %self.name, ?outcome, "condition wait finished");
        outcome
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition").field("name", &self.name).finish()
    }
}
