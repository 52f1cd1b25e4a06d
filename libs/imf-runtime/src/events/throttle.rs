//! Rate limiting for warnings that can fire on every publish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lets at most one caller per interval through and counts the rest.
///
/// Lock-free: the window is an atomic deadline in milliseconds since
/// construction, claimed with a compare-and-swap.
pub struct ThrottledLog {
    origin: Instant,
    open_at_ms: AtomicU64,
    interval_ms: u64,
    suppressed: AtomicU64,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl ThrottledLog {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            open_at_ms: AtomicU64::new(0),
            interval_ms: millis(interval),
            suppressed: AtomicU64::new(0),
        }
    }

    /// `Some(n)` when the caller may log now, `n` being how many calls were
    /// suppressed since the previous permitted one. `None` otherwise.
    pub fn permit(&self) -> Option<u64> {
        let now = millis(self.origin.elapsed());
        let open_at = self.open_at_ms.load(Ordering::Relaxed);
        if now >= open_at
            && self
                .open_at_ms
                .compare_exchange(
                    open_at,
                    now.saturating_add(self.interval_ms),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
        {
            return Some(self.suppressed.swap(0, Ordering::Relaxed));
        }
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        None
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn first_call_is_permitted() {
        let t = ThrottledLog::new(Duration::from_secs(60));
        assert_eq!(t.permit(), Some(0));
    }

    #[test]
    fn calls_inside_the_window_are_counted() {
        let t = ThrottledLog::new(Duration::from_secs(60));
        assert!(t.permit().is_some());
        assert_eq!(t.permit(), None);
        assert_eq!(t.permit(), None);
        assert_eq!(t.suppressed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn zero_interval_never_suppresses() {
        let t = ThrottledLog::new(Duration::ZERO);
        assert_eq!(t.permit(), Some(0));
        assert_eq!(t.permit(), Some(0));
    }
}
