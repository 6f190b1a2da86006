//! Interval polling with a deadline and cancellation.
//!
//! Boot and serial state have no push notification, so every wait in the
//! lifecycle is a probe run on a fixed interval. Cancellation and the
//! deadline are checked before each probe; an already expired deadline
//! returns without probing.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What one probe observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Ready(T),
    Pending,
    /// Stop polling; the condition can no longer become true
    Abort,
}

/// How a poll loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult<T> {
    Ready(T),
    Aborted,
    Cancelled,
    TimedOut,
}

impl<T> PollResult<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollResult::Ready(_))
    }

    pub fn ready(self) -> Option<T> {
        match self {
            PollResult::Ready(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Poller {
    interval: Duration,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Poller {
    pub fn new(interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            interval,
            deadline: None,
            cancel,
        }
    }

    /// Give up after `timeout`; `Duration::ZERO` waits forever
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        self
    }

    /// Give up at `deadline`, which may already be in the past
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Tighten the deadline to at most `limit` from now
    pub fn within(mut self, limit: Duration) -> Self {
        let limit = Instant::now() + limit;
        self.deadline = Some(self.deadline.map_or(limit, |deadline| deadline.min(limit)));
        self
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub async fn run<T, F, Fut>(&self, mut probe: F) -> PollResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Probe<T>>,
    {
        loop {
            if self.cancel.is_cancelled() {
                return PollResult::Cancelled;
            }
            if self.expired() {
                return PollResult::TimedOut;
            }

            match probe().await {
                Probe::Ready(value) => return PollResult::Ready(value),
                Probe::Abort => return PollResult::Aborted,
                Probe::Pending => {}
            }

            let sleep = match self.deadline {
                Some(deadline) => self.interval.min(deadline.saturating_duration_since(Instant::now())),
                None => self.interval,
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = self.cancel.cancelled() => return PollResult::Cancelled,
            }
        }
    }
}
