//! Retry backoff for failed attempts.
//!
//! The delay before attempt `n + 1` is `base × 2^(n − 1)`, optionally capped with
//! [`BackoffStrategy::with_max`] and spread out with a relative jitter.
//!
//! All of the constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use jobwarden::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy =
//!     BackoffStrategy::exponential(TimeDelta::seconds(5)).with_max(TimeDelta::seconds(30));
//!
//! assert_eq!(strategy.backoff(1), TimeDelta::seconds(5));
//! assert_eq!(strategy.backoff(2), TimeDelta::seconds(10));
//! assert_eq!(strategy.backoff(3), TimeDelta::seconds(20));
//! assert_eq!(strategy.backoff(4), TimeDelta::seconds(30));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Exponential backoff with an optional cap and jitter.
///
/// # Example
///
/// ```
/// # use jobwarden::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy = BackoffStrategy::exponential(TimeDelta::seconds(10)).with_jitter(0.2);
///
/// assert!(strategy.backoff(1) >= TimeDelta::seconds(8));
/// assert!(strategy.backoff(1) <= TimeDelta::seconds(12));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy {
    base: TimeDelta,
    max: Option<TimeDelta>,
    jitter: f64,
}

impl BackoffStrategy {
    /// Doubling backoff starting at `base` for the first retry.
    pub const fn exponential(base: TimeDelta) -> Self {
        Self {
            base,
            max: None,
            jitter: 0.0,
        }
    }

    /// Cap the backoff at `max` (before jitter is applied).
    pub const fn with_max(mut self, max: TimeDelta) -> Self {
        self.max = Some(max);
        self
    }

    /// Spread each backoff by up to `ratio` of its value in either direction.
    pub const fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter = ratio;
        self
    }

    /// The delay to wait after `attempt` failed.
    ///
    /// Saturates at [`TimeDelta::MAX`] rather than overflowing.
    pub fn backoff(&self, attempt: u16) -> TimeDelta {
        let exponent = u32::from(attempt.max(1) - 1);
        let millis = 1_i64
            .checked_shl(exponent)
            .filter(|multiplier| *multiplier > 0)
            .and_then(|multiplier| self.base.num_milliseconds().checked_mul(multiplier))
            .unwrap_or(i64::MAX);
        let mut backoff = TimeDelta::try_milliseconds(millis).unwrap_or(TimeDelta::MAX);
        if let Some(max) = self.max {
            backoff = backoff.min(max);
        }
        self.apply_jitter(backoff)
    }

    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = (value.num_milliseconds() as f64 * self.jitter)
            .round()
            .abs() as i64;
        if milliseconds == 0 {
            return value;
        }
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        TimeDelta::try_milliseconds(jitter)
            .and_then(|jitter| value.checked_add(&jitter))
            .unwrap_or(value)
            .max(TimeDelta::zero())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exponential_backoff() {
        let delay = TimeDelta::seconds(5);
        let strategy = BackoffStrategy::exponential(delay);

        for i in 1..20 {
            assert_eq!(strategy.backoff(i), delay * 2_i32.pow(u32::from(i) - 1));
        }
    }

    #[test]
    fn exponential_backoff_is_monotonic() {
        let strategy = BackoffStrategy::exponential(TimeDelta::milliseconds(250));

        let delays: Vec<_> = (1..=u16::MAX).step_by(7).map(|i| strategy.backoff(i)).collect();
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn exponential_backoff_saturates_instead_of_overflowing() {
        let strategy = BackoffStrategy::exponential(TimeDelta::days(1));

        assert_eq!(strategy.backoff(u16::MAX), TimeDelta::MAX);
    }

    #[test]
    fn exponential_backoff_with_max() {
        let delay = TimeDelta::minutes(1);
        let max = TimeDelta::minutes(10);
        let strategy = BackoffStrategy::exponential(delay).with_max(max);

        for i in 1..100 {
            assert!(strategy.backoff(i) <= max);
        }
        assert_eq!(strategy.backoff(4), TimeDelta::minutes(8));
        assert_eq!(strategy.backoff(5), max);
    }

    #[test]
    fn exponential_backoff_with_jitter() {
        let delay = TimeDelta::minutes(1);
        let strategy = BackoffStrategy::exponential(delay).with_jitter(0.1);

        for i in 1..5 {
            let expected = (delay * 2_i32.pow(u32::from(i) - 1)).num_milliseconds() as f64;
            let backoff = strategy.backoff(i).num_milliseconds() as f64;
            assert!(backoff >= expected * 0.9);
            assert!(backoff <= expected * 1.1);
        }
    }

    #[test]
    fn jitter_never_produces_a_negative_delay() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1)).with_jitter(3.0);

        for i in 1..50 {
            assert!(strategy.backoff(i % 4 + 1) >= TimeDelta::zero());
        }
    }

    #[test]
    fn zero_jitter_leaves_backoff_untouched() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(3)).with_jitter(0.0);

        assert_eq!(strategy.backoff(2), TimeDelta::seconds(6));
    }
}
