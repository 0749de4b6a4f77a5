//! Per-call deadline and cancellation signal.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Overall time budget for one call, plus an optional caller-owned
/// cancellation token.
///
/// Every suspension point inside the manager (rate-limiter waits, pool
/// acquisition, the provider call, retry backoff) is bounded by the
/// deadline and aborted as soon as the token is cancelled.
///
/// ```rust
/// # use std::time::Duration;
/// # use skirnir::Deadline;
/// # use tokio_util::sync::CancellationToken;
/// let token = CancellationToken::new();
/// let deadline = Deadline::after(Duration::from_secs(5)).with_cancellation(token.clone());
/// assert!(!deadline.is_cancelled());
/// token.cancel();
/// assert!(deadline.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    cancel: Option<CancellationToken>,
}

/// Outcome of a future raced against a deadline and a cancellation token.
#[derive(Debug)]
pub(crate) enum Bounded<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

impl Deadline {
    /// Deadline at an absolute instant.
    pub fn at(at: Instant) -> Self {
        Self { at, cancel: None }
    }

    /// Deadline `budget` from now. Budgets too large to represent are
    /// clamped to roughly thirty years.
    pub fn after(budget: Duration) -> Self {
        let now = Instant::now();
        let at = now
            .checked_add(budget)
            .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30));
        Self::at(at)
    }

    /// Attach a cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// The earlier of the deadline and `now + max`.
    pub fn cap(&self, max: Duration) -> Instant {
        Instant::now()
            .checked_add(max)
            .map_or(self.at, |capped| capped.min(self.at))
    }

    /// Copy of this deadline pulled in to at most `max` from now. Shares
    /// the cancellation token.
    pub(crate) fn capped(&self, max: Duration) -> Deadline {
        Deadline {
            at: self.cap(max),
            cancel: self.cancel.clone(),
        }
    }

    /// Whether `wait` from now still ends before the deadline.
    pub fn fits(&self, wait: Duration) -> bool {
        Instant::now()
            .checked_add(wait)
            .is_some_and(|end| end <= self.at)
    }

    async fn cancelled(&self) {
        match &self.cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    }

    /// Drive `fut` until it completes, `until` passes, or the call is
    /// cancelled. Cancellation wins ties.
    pub(crate) async fn run_until<F: Future>(&self, until: Instant, fut: F) -> Bounded<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Bounded::Cancelled,
            res = tokio::time::timeout_at(until, fut) => match res {
                Ok(value) => Bounded::Done(value),
                Err(_) => Bounded::TimedOut,
            },
        }
    }

    /// [`run_until`](Self::run_until) bounded by the deadline itself.
    pub(crate) async fn run<F: Future>(&self, fut: F) -> Bounded<F::Output> {
        self.run_until(self.at, fut).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn run_times_out_at_deadline() {
        let deadline = Deadline::after(Duration::from_millis(100));
        let start = Instant::now();
        let res = deadline
            .run(tokio::time::sleep(Duration::from_secs(10)))
            .await;
        assert!(matches!(res, Bounded::TimedOut));
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn run_observes_cancellation() {
        let token = CancellationToken::new();
        let deadline = Deadline::after(Duration::from_secs(60)).with_cancellation(token.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let res = deadline
            .run(tokio::time::sleep(Duration::from_secs(10)))
            .await;
        assert!(matches!(res, Bounded::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn cap_never_exceeds_deadline() {
        let deadline = Deadline::after(Duration::from_millis(50));
        assert_eq!(deadline.cap(Duration::from_secs(1)), deadline.instant());
        assert!(deadline.cap(Duration::from_millis(10)) < deadline.instant());
        assert!(deadline.cap(Duration::MAX) == deadline.instant());
    }

    #[tokio::test(start_paused = true)]
    async fn fits_checks_remaining_budget() {
        let deadline = Deadline::after(Duration::from_millis(50));
        assert!(deadline.fits(Duration::from_millis(50)));
        assert!(!deadline.fits(Duration::from_millis(51)));
        assert!(!deadline.fits(Duration::MAX));
    }
}
