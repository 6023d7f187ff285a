//! Cancellable pauses and the bounded retry loop used while waiting on the daemon
//!
//! Every wait the supervisor performs goes through a [`Pause`], so tests can
//! swap in [`NoPause`] and the CLI can interrupt a [`ThreadPause`] from a
//! Ctrl+C handler via its [`CancelToken`].

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// A wait was interrupted by its [`CancelToken`]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Operation cancelled")]
pub struct Cancelled;

/// Shared flag flipped once by whoever wants the supervisor to give up
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Blocking wait with an external way out
pub trait Pause {
    /// Wait for `duration`, or return early with [`Cancelled`]
    fn pause(&self, duration: Duration) -> Result<(), Cancelled>;

    /// Whether a cancellation has already been requested
    fn is_cancelled(&self) -> bool {
        false
    }
}

const PAUSE_SLICE: Duration = Duration::from_millis(50);

/// Sleeps on the current thread in short slices, checking the token between them
#[derive(Debug, Clone, Default)]
pub struct ThreadPause {
    token: CancelToken,
}

impl ThreadPause {
    pub fn new(token: CancelToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

impl Pause for ThreadPause {
    fn pause(&self, duration: Duration) -> Result<(), Cancelled> {
        let deadline = Instant::now() + duration;
        loop {
            if self.token.is_cancelled() {
                return Err(Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(PAUSE_SLICE));
        }
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Returns immediately. Used by tests to run the poll loop at full speed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPause;

impl Pause for NoPause {
    fn pause(&self, _duration: Duration) -> Result<(), Cancelled> {
        Ok(())
    }
}

/// Result of a [`Retry::run`] loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    /// An attempt broke out of the loop with a value
    Done(T),
    /// Every attempt asked to continue
    Exhausted,
    /// The pause was cancelled before the loop finished
    Cancelled,
}

/// Bounded number of attempts separated by a fixed interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    pub attempts: u32,
    pub interval: Duration,
}

impl Retry {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Call `attempt` with 1-based attempt numbers until it breaks, the
    /// attempts run out, or `pause` is cancelled. The interval is only
    /// waited between attempts, never after the last one.
    pub fn run<T, P, F>(&self, pause: &P, mut attempt: F) -> RetryOutcome<T>
    where
        P: Pause + ?Sized,
        F: FnMut(u32) -> ControlFlow<T>,
    {
        for n in 1..=self.attempts {
            if pause.is_cancelled() {
                return RetryOutcome::Cancelled;
            }
            if let ControlFlow::Break(value) = attempt(n) {
                return RetryOutcome::Done(value);
            }
            if n < self.attempts && pause.pause(self.interval).is_err() {
                return RetryOutcome::Cancelled;
            }
        }
        RetryOutcome::Exhausted
    }
}
