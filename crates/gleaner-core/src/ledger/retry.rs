//! Retry policy: decides backoff delays.

use std::time::Duration;

use rand::Rng;

/// Retry policy for failed jobs.
///
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay) + random(0..=jitter)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for the exponential part.
    pub max_delay: Duration,

    /// Upper bound for the random part added on top.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Policy without jitter, for tests that assert exact schedules.
    pub fn fixed(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            jitter: Duration::ZERO,
        }
    }

    /// Exponential part only.
    ///
    /// `attempt` is the number of attempts already made (1-indexed);
    /// attempt 0 is treated like attempt 1.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Delay before the next run after `attempt` failed.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.base_delay_for(attempt) + Duration::from_millis(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_increases() {
        let policy = RetryPolicy::fixed(Duration::from_secs(2), 2.0, Duration::from_secs(300));

        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::fixed(Duration::from_secs(2), 2.0, Duration::from_secs(10));
        assert_eq!(policy.next_delay(10), Duration::from_secs(10));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy {
            jitter: Duration::from_millis(500),
            ..RetryPolicy::fixed(Duration::from_secs(1), 2.0, Duration::from_secs(60))
        };
        for _ in 0..50 {
            let d = policy.next_delay(1);
            assert!(d >= Duration::from_secs(1));
            assert!(d <= Duration::from_millis(1500));
        }
    }
}
