use rand::Rng;
use std::time::Duration;

/// Exponential retry schedule for failed identity checks.
///
/// The delay after the `n`th consecutive failure is `floor * factor^(n-1)`,
/// capped at `max`, with up to 25% of upward jitter so that authors who
/// failed together do not retry together. The delay never drops below
/// `floor`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    floor: Duration,
    max: Duration,
    factor: f64,
}

impl ExponentialBackoff {
    /// Creates a schedule starting at `floor` and growing by `factor` up to `max`.
    ///
    /// # Examples
    ///
    /// ```
    /// use ostrichd::backoff::ExponentialBackoff;
    /// use std::time::Duration;
    /// let backoff = ExponentialBackoff::new(
    ///     Duration::from_secs(60),
    ///     Duration::from_secs(3600),
    ///     2.0,
    /// );
    /// assert_eq!(backoff.base_delay(1), Duration::from_secs(60));
    /// assert_eq!(backoff.base_delay(3), Duration::from_secs(240));
    /// assert_eq!(backoff.base_delay(30), Duration::from_secs(3600));
    /// ```
    #[must_use]
    pub fn new(floor: Duration, max: Duration, factor: f64) -> Self {
        Self {
            floor,
            max: max.max(floor),
            factor: factor.max(1.0),
        }
    }

    /// Delay after `failures` consecutive failures, without jitter.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let floor_secs = self.floor.as_secs_f64();
        let secs = floor_secs * self.factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs).max(self.floor)
    }

    /// Delay after `failures` consecutive failures, with upward jitter.
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        let base = self.base_delay(failures);
        let jitter = rand::thread_rng().gen_range(1.0..=1.25);
        base.mul_f64(jitter)
    }
}
