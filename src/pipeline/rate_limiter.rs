//! Token-bucket gate for fetch launches.
//!
//! Rapid subscribe/cancel churn (a fast-scrolling list) can submit and
//! cancel dozens of loads per frame. The rate limiter absorbs those bursts
//! so the data loader is not thrashed: launches consume tokens from a bucket
//! that refills at a fixed rate, and launches that find the bucket empty are
//! deferred in FIFO order. A deferred launch whose cancellation token has
//! fired by the time tokens are available is dropped without running.
//!
//! The limiter is a plain data structure evaluated on the orchestrator's
//! serial context; the orchestrator owns the retry timer. All methods take
//! an explicit `now` so the accounting is deterministic under test.

use crate::cancellation::CancelToken;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default bucket capacity.
pub const DEFAULT_BUCKET_CAPACITY: usize = 30;

/// Default refill rate in tokens per second.
pub const DEFAULT_REFILL_RATE: f64 = 80.0;

/// Token-bucket rate limiter over deferred work values.
pub(crate) struct RateLimiter<W> {
    capacity: f64,
    /// Tokens added per second.
    rate: f64,
    available: f64,
    last_refill: Instant,
    pending: VecDeque<(CancelToken, W)>,
}

impl<W> RateLimiter<W> {
    /// Creates a full bucket.
    pub fn new(capacity: usize, rate: f64, now: Instant) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        assert!(rate > 0.0, "rate must be > 0");
        Self {
            capacity: capacity as f64,
            rate,
            available: capacity as f64,
            last_refill: now,
            pending: VecDeque::new(),
        }
    }

    /// Interval after which a deferred launch should be retried.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate)
    }

    /// Submits work. Returns `Some(work)` when it may run immediately;
    /// otherwise the work is deferred and the caller must schedule a retry.
    ///
    /// Work is also deferred when older work is already waiting, preserving
    /// FIFO order across the burst.
    pub fn execute(&mut self, token: CancelToken, work: W, now: Instant) -> Option<W> {
        self.refill(now);
        if self.pending.is_empty() && self.available >= 1.0 {
            self.available -= 1.0;
            return Some(work);
        }
        self.pending.push_back((token, work));
        None
    }

    /// Returns deferred work that may now run, dropping cancelled entries.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<W> {
        self.refill(now);
        let mut ready = Vec::new();
        loop {
            let cancelled = match self.pending.front() {
                None => break,
                Some((token, _)) => token.is_cancelling(),
            };
            if cancelled {
                self.pending.pop_front();
                continue;
            }
            if self.available < 1.0 {
                break;
            }
            self.available -= 1.0;
            if let Some((_, work)) = self.pending.pop_front() {
                ready.push(work);
            }
        }
        ready
    }

    /// Returns true while deferred work is waiting for tokens.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.available = (self.available + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancelTokenSource;

    fn limiter(capacity: usize, rate: f64) -> (RateLimiter<u32>, Instant) {
        let now = Instant::now();
        (RateLimiter::new(capacity, rate, now), now)
    }

    fn token() -> CancelToken {
        CancelTokenSource::new().token()
    }

    #[test]
    fn test_runs_immediately_under_capacity() {
        let (mut limiter, now) = limiter(3, 10.0);
        for i in 0..3 {
            assert_eq!(limiter.execute(token(), i, now), Some(i));
        }
        assert!(!limiter.has_pending());
    }

    #[test]
    fn test_defers_when_bucket_empty() {
        let (mut limiter, now) = limiter(1, 10.0);
        assert_eq!(limiter.execute(token(), 1, now), Some(1));
        assert_eq!(limiter.execute(token(), 2, now), None);
        assert!(limiter.has_pending());
    }

    #[test]
    fn test_refill_releases_deferred_in_fifo_order() {
        let (mut limiter, now) = limiter(1, 10.0);
        limiter.execute(token(), 1, now);
        limiter.execute(token(), 2, now);
        limiter.execute(token(), 3, now);

        // 10 tokens/sec: after 250ms there are 2.5 tokens.
        let later = now + Duration::from_millis(250);
        assert_eq!(limiter.drain_ready(later), vec![2, 3]);
        assert!(!limiter.has_pending());
    }

    #[test]
    fn test_partial_refill_releases_partial_batch() {
        let (mut limiter, now) = limiter(1, 10.0);
        limiter.execute(token(), 1, now);
        limiter.execute(token(), 2, now);
        limiter.execute(token(), 3, now);

        let later = now + Duration::from_millis(150);
        assert_eq!(limiter.drain_ready(later), vec![2]);
        assert!(limiter.has_pending());
    }

    #[test]
    fn test_new_work_queues_behind_pending() {
        let (mut limiter, now) = limiter(1, 10.0);
        limiter.execute(token(), 1, now);
        limiter.execute(token(), 2, now);

        // Tokens are available again, but older work must go first.
        let later = now + Duration::from_secs(1);
        assert_eq!(limiter.execute(token(), 3, later), None);
        assert_eq!(limiter.drain_ready(later), vec![2, 3]);
    }

    #[test]
    fn test_cancelled_deferred_work_is_dropped() {
        let (mut limiter, now) = limiter(1, 10.0);
        limiter.execute(token(), 1, now);

        let source = CancelTokenSource::new();
        limiter.execute(source.token(), 2, now);
        limiter.execute(token(), 3, now);
        source.cancel();

        let later = now + Duration::from_secs(1);
        assert_eq!(limiter.drain_ready(later), vec![3]);
    }

    #[test]
    fn test_bucket_does_not_exceed_capacity() {
        let (mut limiter, now) = limiter(2, 10.0);
        // A long idle period must not bank more than `capacity` tokens.
        let later = now + Duration::from_secs(60);
        assert_eq!(limiter.execute(token(), 1, later), Some(1));
        assert_eq!(limiter.execute(token(), 2, later), Some(2));
        assert_eq!(limiter.execute(token(), 3, later), None);
    }

    #[test]
    fn test_retry_interval() {
        let (limiter, _) = limiter(30, 80.0);
        assert_eq!(limiter.retry_interval(), Duration::from_secs_f64(1.0 / 80.0));
    }
}
