//! # Reconnect backoff.
//!
//! [`BackoffStrategy`] computes exponentially growing delays capped at a
//! maximum; [`BackoffStrategy::jittered`] adds full jitter so many processes
//! losing the same broker do not reconnect in lockstep.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with a cap.
#[derive(Clone, Copy, Debug)]
pub struct BackoffStrategy {
    /// Delay after the first failure.
    pub first: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
    /// Multiplier applied per failure.
    pub factor: f64,
}

impl Default for BackoffStrategy {
    /// 500ms doubling up to 60s — the cluster reconnect profile.
    fn default() -> Self {
        Self {
            first: Duration::from_millis(500),
            max: Duration::from_secs(60),
            factor: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Next deterministic delay given the previous one.
    pub fn next(&self, prev: Option<Duration>) -> Duration {
        match prev {
            None => self.first.min(self.max),
            Some(d) => {
                let next = (d.as_secs_f64() * self.factor).min(self.max.as_secs_f64());
                Duration::from_secs_f64(next)
            }
        }
    }

    /// Delay for the n-th consecutive failure (0-based), capped.
    pub fn nth(&self, attempt: usize) -> Duration {
        let factor = self.factor.powi(attempt.min(64) as i32);
        let secs = (self.first.as_secs_f64() * factor).min(self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Next delay with full jitter: uniform in `[0, next]`.
    pub fn jittered(&self, prev: Option<Duration>) -> Duration {
        Self::jitter(self.next(prev))
    }

    /// Delay for the n-th failure with full jitter applied.
    pub fn jittered_nth(&self, attempt: usize) -> Duration {
        Self::jitter(self.nth(attempt))
    }

    fn jitter(next: Duration) -> Duration {
        if next.is_zero() {
            return next;
        }
        let nanos = rand::thread_rng().gen_range(0..=next.as_nanos() as u64);
        Duration::from_nanos(nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_caps() {
        let b = BackoffStrategy {
            first: Duration::from_millis(100),
            max: Duration::from_millis(350),
            factor: 2.0,
        };
        let d1 = b.next(None);
        let d2 = b.next(Some(d1));
        let d3 = b.next(Some(d2));
        assert_eq!(d1, Duration::from_millis(100));
        assert_eq!(d2, Duration::from_millis(200));
        assert_eq!(d3, Duration::from_millis(350));
        assert_eq!(b.next(Some(d3)), Duration::from_millis(350));
    }

    #[test]
    fn nth_matches_iterated_next() {
        let b = BackoffStrategy::default();
        assert_eq!(b.nth(0), b.first);
        assert_eq!(b.nth(1), Duration::from_secs(1));
        assert_eq!(b.nth(20), b.max);
    }

    #[test]
    fn jitter_stays_in_range() {
        let b = BackoffStrategy::default();
        for _ in 0..100 {
            let d = b.jittered(Some(Duration::from_secs(1)));
            assert!(d <= Duration::from_secs(2));
        }
    }
}
