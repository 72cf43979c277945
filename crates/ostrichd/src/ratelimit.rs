use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const WINDOW_SECS: u64 = 60;

/// Sliding window limiter for subscription creation on one connection.
///
/// Tracks individual timestamps and only counts those inside the trailing
/// minute, so a burst straddling a window boundary is still counted in full.
/// Owned by the connection task; no synchronization.
#[derive(Debug)]
pub struct RateLimiter {
    window: VecDeque<Instant>,
    per_minute: u32,
}

impl RateLimiter {
    /// Creates a limiter allowing `per_minute` records per trailing minute.
    /// A limit of 0 disables limiting.
    #[must_use]
    pub fn new(per_minute: u32) -> Self {
        Self {
            window: VecDeque::with_capacity(16),
            per_minute,
        }
    }

    fn expire_old_entries(&mut self, now: Instant) {
        let window = Duration::from_secs(WINDOW_SECS);
        while let Some(ts) = self.window.front() {
            if now.duration_since(*ts) >= window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Records one creation, or returns how long to wait before a slot frees.
    pub fn check_and_record(&mut self) -> Result<(), Duration> {
        self.check_and_record_at(Instant::now())
    }

    fn check_and_record_at(&mut self, now: Instant) -> Result<(), Duration> {
        if self.per_minute == 0 {
            return Ok(());
        }
        self.expire_old_entries(now);

        let count: u32 = self.window.len().try_into().unwrap_or(u32::MAX);
        if count >= self.per_minute {
            let oldest = self.window.front().copied().unwrap_or(now);
            let free_at = oldest + Duration::from_secs(WINDOW_SECS);
            return Err(free_at.saturating_duration_since(now));
        }

        // never grows past `per_minute`: full windows return above
        self.window.push_back(now);
        Ok(())
    }
}

/// Relay-wide event limiter shared by every connection.
///
/// A generic cell rate algorithm over one atomic "theoretical arrival time":
/// each admission pushes it forward by `1 / per_second`, and an event arriving
/// before it is refused. Over any trailing minute at most `60 * per_second`
/// events (plus the one in flight) get through, and two events closer together
/// than the emission interval never both pass. Lock-free: contention costs a
/// CAS retry, never a blocked task.
#[derive(Debug)]
pub struct EventRateLimiter {
    emission_ns: u64,
    tat_ns: AtomicU64,
    epoch: Instant,
}

impl EventRateLimiter {
    /// Creates a limiter allowing `per_second` events per second. 0 = unlimited.
    #[must_use]
    pub fn new(per_second: u32) -> Self {
        let emission_ns = if per_second == 0 {
            0
        } else {
            1_000_000_000 / u64::from(per_second)
        };
        Self {
            emission_ns,
            tat_ns: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Returns `true` if limiting is active.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.emission_ns != 0
    }

    /// Consumes one slot if available.
    pub fn check(&self) -> bool {
        self.check_at(Instant::now())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn check_at(&self, now: Instant) -> bool {
        if self.emission_ns == 0 {
            return true;
        }
        // offset by one interval so the very first event at the epoch passes
        let now_ns = now.saturating_duration_since(self.epoch).as_nanos() as u64 + self.emission_ns;
        let mut tat = self.tat_ns.load(Ordering::Acquire);
        loop {
            if tat > now_ns {
                return false;
            }
            let next = now_ns + self.emission_ns;
            match self
                .tat_ns
                .compare_exchange_weak(tat, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => tat = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn subscription_limiter_allows_within_limit() {
        let mut limiter = RateLimiter::new(3);
        let now = Instant::now();
        assert!(limiter.check_and_record_at(now).is_ok());
        assert!(limiter.check_and_record_at(now).is_ok());
        assert!(limiter.check_and_record_at(now).is_ok());
        assert_eq!(limiter.window.len(), 3);
    }

    #[test]
    fn subscription_limiter_reports_wait() {
        let mut limiter = RateLimiter::new(2);
        let start = Instant::now();
        limiter.check_and_record_at(start).unwrap();
        limiter
            .check_and_record_at(start + Duration::from_secs(10))
            .unwrap();
        let wait = limiter
            .check_and_record_at(start + Duration::from_secs(20))
            .unwrap_err();
        assert_eq!(wait, Duration::from_secs(40));
        // rejected attempts are not recorded
        assert_eq!(limiter.window.len(), 2);
    }

    #[test]
    fn subscription_limiter_expires_old_entries() {
        let mut limiter = RateLimiter::new(1);
        let start = Instant::now();
        limiter.check_and_record_at(start).unwrap();
        assert!(limiter
            .check_and_record_at(start + Duration::from_secs(59))
            .is_err());
        assert!(limiter
            .check_and_record_at(start + Duration::from_secs(60))
            .is_ok());
    }

    #[test]
    fn large_limits_are_enforced_exactly() {
        let mut limiter = RateLimiter::new(20_000);
        let now = Instant::now();
        for _ in 0..20_000 {
            assert!(limiter.check_and_record_at(now).is_ok());
        }
        assert!(limiter.check_and_record_at(now).is_err());
        assert_eq!(limiter.window.len(), 20_000);
    }

    #[test]
    fn subscription_limiter_zero_is_unlimited() {
        let mut limiter = RateLimiter::new(0);
        for _ in 0..1000 {
            assert!(limiter.check_and_record().is_ok());
        }
        assert!(limiter.window.is_empty());
    }

    #[test]
    fn one_per_second_rejects_second_within_100ms() {
        let limiter = EventRateLimiter::new(1);
        let start = Instant::now();
        assert!(limiter.check_at(start));
        assert!(!limiter.check_at(start + Duration::from_millis(100)));
        assert!(limiter.check_at(start + Duration::from_millis(1000)));
    }

    #[test]
    fn minute_of_traffic_over_limit_is_rejected() {
        let n = 5u32;
        let limiter = EventRateLimiter::new(n);
        let start = Instant::now();
        let total = n * 60 + 1;
        let spacing = Duration::from_secs(60) / total;
        let rejected = (0..total)
            .filter(|i| !limiter.check_at(start + spacing * *i))
            .count();
        assert!(rejected >= 1);
    }

    #[test]
    fn steady_rate_at_limit_is_accepted() {
        let limiter = EventRateLimiter::new(10);
        let start = Instant::now();
        for i in 0..600u32 {
            assert!(limiter.check_at(start + Duration::from_millis(100) * i));
        }
    }

    #[test]
    fn zero_is_unlimited() {
        let limiter = EventRateLimiter::new(0);
        assert!(!limiter.is_enabled());
        for _ in 0..10_000 {
            assert!(limiter.check());
        }
    }

    #[test]
    fn concurrent_callers_share_budget() {
        let limiter = Arc::new(EventRateLimiter::new(1));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || limiter.check())
            })
            .collect();
        let passed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(passed, 1);
    }
}
