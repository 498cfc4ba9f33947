use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Gate for log sites on background threads: at most one pass per
/// interval, decided with a single CAS so concurrent callers race
/// harmlessly.
pub struct RateLimiter {
    interval_us: u64,
    last_us: AtomicU64,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_us: interval.as_micros() as u64,
            last_us: AtomicU64::new(0),
        }
    }

    /// True when the caller won this interval and should emit its
    /// message.
    pub fn allow(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        let last = self.last_us.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.interval_us {
            return false;
        }
        self.last_us
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_call_passes() {
        let limiter = RateLimiter::new(Duration::from_secs(3600));
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[test]
    fn test_zero_interval_always_passes() {
        let limiter = RateLimiter::new(Duration::ZERO);
        assert!(limiter.allow());
        assert!(limiter.allow());
    }

    #[test]
    fn test_passes_again_after_interval() {
        let limiter = RateLimiter::new(Duration::from_millis(20));
        assert!(limiter.allow());
        assert!(!limiter.allow());
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.allow());
    }
}
