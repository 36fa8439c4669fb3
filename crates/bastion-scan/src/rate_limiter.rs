//! Sliding-window throttle for remote engine submissions.
//!
//! Checking and recording are separate steps: [`RateLimiter::admit`] only
//! looks, [`RateLimiter::record`] commits. A caller checks right before
//! submitting and records after the submission succeeded. Two callers that
//! both pass `admit` before either records can overshoot the limit by one;
//! the pipeline has a single worker so this is accepted as best effort.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Length of the rolling window
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Default number of submissions allowed per window
pub const DEFAULT_REQUESTS_PER_WINDOW: usize = 4;

/// Rolling-window admission gate.
pub struct RateLimiter {
    /// Maximum submissions per window
    limit: usize,
    /// Window length
    window: Duration,
    /// Submission times, oldest first
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter allowing `limit` submissions per minute
    pub fn new(limit: usize) -> Self {
        Self::with_window(limit, RATE_WINDOW)
    }

    /// Create a limiter with a custom window length
    pub fn with_window(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            timestamps: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    /// Whether a new submission would currently stay within the limit.
    ///
    /// Prunes expired timestamps but does not record anything.
    pub fn admit(&self) -> bool {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock().unwrap_or_else(PoisonError::into_inner);

        while let Some(oldest) = timestamps.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        let admitted = timestamps.len() < self.limit;
        if !admitted {
            debug!(
                "Rate limit reached: {} submissions in the last {}s",
                timestamps.len(),
                self.window.as_secs()
            );
        }
        admitted
    }

    /// Record a successful submission made now
    pub fn record(&self) {
        self.record_at(Instant::now());
    }

    /// Record a submission made at `at`
    fn record_at(&self, at: Instant) {
        let mut timestamps = self.timestamps.lock().unwrap_or_else(PoisonError::into_inner);
        // Keep the sequence ordered even if callers record out of order
        let pos = timestamps.partition_point(|t| *t <= at);
        timestamps.insert(pos, at);
    }

    /// Drop the most recent submission, returning whether one existed
    #[cfg(test)]
    fn retract(&self) -> bool {
        self.timestamps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_back()
            .is_some()
    }

    /// Number of timestamps currently held (expired ones included until the next `admit`)
    #[cfg(test)]
    pub(crate) fn recorded(&self) -> usize {
        self.timestamps.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_REQUESTS_PER_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_limiter_admits() {
        let limiter = RateLimiter::default();
        assert_eq!(limiter.limit, 4);
        assert!(limiter.admit());
    }

    #[test]
    fn test_full_window_rejects_until_one_removed() {
        let limiter = RateLimiter::new(4);
        for _ in 0..4 {
            limiter.record();
        }
        assert!(!limiter.admit());

        assert!(limiter.retract());
        assert!(limiter.admit());
    }

    #[test]
    fn test_admit_does_not_record() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.admit());
        assert!(limiter.admit());
        assert_eq!(limiter.recorded(), 0);
    }

    #[test]
    fn test_expired_timestamps_are_pruned() {
        let limiter = RateLimiter::with_window(2, Duration::from_millis(30));
        limiter.record();
        limiter.record();
        assert!(!limiter.admit());

        std::thread::sleep(Duration::from_millis(60));
        limiter.record();
        assert_eq!(limiter.recorded(), 3);

        assert!(limiter.admit());
        assert_eq!(limiter.recorded(), 1);
    }

    #[test]
    fn test_out_of_order_records_stay_sorted() {
        let limiter = RateLimiter::default();
        let now = Instant::now();
        limiter.record_at(now + Duration::from_millis(5));
        limiter.record_at(now);

        let timestamps = limiter.timestamps.lock().unwrap();
        assert!(timestamps.front() <= timestamps.back());
    }

    #[test]
    fn test_short_window() {
        let limiter = RateLimiter::with_window(1, Duration::from_millis(20));
        limiter.record();
        assert!(!limiter.admit());

        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.admit());
    }

    #[test]
    fn test_retract_on_empty() {
        let limiter = RateLimiter::default();
        assert!(!limiter.retract());
    }
}
