//! Poll-with-timeout primitive for operations waiting on external state.

use std::time::{Duration, Instant};

use crate::skip::SkipSignal;

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Succeeded,
    TimedOut,
    Skipped,
}

impl WaitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Status word operations return to the controller.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "SUCCESS",
            Self::TimedOut => "TIMEOUT",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for WaitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Poll `predicate` every `poll_interval` until it holds or `timeout` elapses.
///
/// The predicate is always evaluated at least once, even with a zero timeout.
pub fn wait_until(
    predicate: impl FnMut() -> bool,
    timeout: Duration,
    poll_interval: Duration,
) -> WaitOutcome {
    poll(predicate, timeout, poll_interval, None)
}

/// Like [`wait_until`], but also ends early when a skip is pending.
///
/// The skip is consumed, so the next operation starts with a clear flag.
pub fn wait_until_or_skipped(
    predicate: impl FnMut() -> bool,
    timeout: Duration,
    poll_interval: Duration,
    skip: &SkipSignal,
) -> WaitOutcome {
    poll(predicate, timeout, poll_interval, Some(skip))
}

fn poll(
    mut predicate: impl FnMut() -> bool,
    timeout: Duration,
    poll_interval: Duration,
    skip: Option<&SkipSignal>,
) -> WaitOutcome {
    let deadline = Instant::now() + timeout;

    loop {
        if predicate() {
            return WaitOutcome::Succeeded;
        }
        if skip.is_some_and(SkipSignal::take) {
            return WaitOutcome::Skipped;
        }

        let now = Instant::now();
        if now >= deadline {
            return WaitOutcome::TimedOut;
        }
        std::thread::sleep(poll_interval.min(deadline - now));
    }
}
