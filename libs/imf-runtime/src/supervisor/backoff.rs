use std::time::Duration;

/// Restart delay that doubles with every consecutive crash.
///
/// The delay for attempt `n` (0-indexed) is `first × 2^n`, clamped to `max`.
/// Each attempt is computed from `first` alone, so the sequence is fully
/// determined by the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn new(first: Duration, max: Duration) -> Self {
        Self {
            first,
            max: max.max(first),
        }
    }

    pub fn next(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.first.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_attempt() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(30));
        let delays: Vec<_> = (0..5).map(|n| policy.next(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600]);
    }

    #[test]
    fn clamps_to_max() {
        let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(2));
        assert_eq!(policy.next(2), Duration::from_secs(2));
        assert_eq!(policy.next(3), Duration::from_secs(2));
    }

    #[test]
    fn huge_attempts_do_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next(31), policy.max);
        assert_eq!(policy.next(32), policy.max);
        assert_eq!(policy.next(u32::MAX), policy.max);
    }

    #[test]
    fn max_below_first_is_raised() {
        let policy = BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(policy.next(0), Duration::from_secs(5));
    }
}
