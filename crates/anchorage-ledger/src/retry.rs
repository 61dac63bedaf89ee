//! Backoff policy for tries against a single ledger endpoint.
//!
//! The delay schedule is a pure function of the try number so it can be
//! asserted directly; jitter is applied on top when the poster actually
//! waits.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Per-endpoint retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum tries against one endpoint before failing over.
    pub max_attempts: u32,

    /// Base delay for backoff calculation.
    pub base_delay: Duration,

    /// Maximum delay between tries.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0) to add randomness.
    pub jitter_factor: f64,

    /// Strategy for calculating backoff delays.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.1,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff: delay doubles each attempt.
    Exponential,
    /// Linear backoff: delay increases by base amount each attempt.
    Linear,
}

/// What to do after a failed try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then try the same endpoint again.
    Retry {
        /// Delay before the next try.
        delay: Duration,
    },
    /// Move on to the next endpoint.
    Failover {
        /// Why this endpoint was abandoned.
        reason: String,
    },
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failed try (1-based), before jitter.
    ///
    /// Exponential: `base * 2^(attempt-1)`, capped at `max_delay`. The
    /// exponent is clamped so large attempt numbers cannot overflow.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt.max(1)),
            BackoffStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(20);
                self.base_delay.saturating_mul(2_u32.saturating_pow(exponent))
            },
        };

        std::cmp::min(delay, self.max_delay)
    }

    /// [`delay_for_attempt`](Self::delay_for_attempt) with jitter applied,
    /// still capped at `max_delay`.
    pub fn jittered_delay_for_attempt(&self, attempt: u32) -> Duration {
        let jittered = apply_jitter(self.delay_for_attempt(attempt), self.jitter_factor);
        std::cmp::min(jittered, self.max_delay)
    }

    /// Longest time one endpoint can hold a publish cycle: every try runs
    /// into `call_timeout` and every wait between tries draws its largest
    /// jitter.
    pub fn endpoint_budget(&self, call_timeout: Duration) -> Duration {
        let jitter = if self.jitter_factor > 0.0 { self.jitter_factor.min(1.0) } else { 0.0 };
        let waits = (1..self.max_attempts)
            .map(|attempt| {
                let ceiling = self.delay_for_attempt(attempt).mul_f64(1.0 + jitter);
                std::cmp::min(ceiling, self.max_delay)
            })
            .fold(Duration::ZERO, Duration::saturating_add);

        call_timeout.saturating_mul(self.max_attempts).saturating_add(waits)
    }

    /// Decides whether to retry the same endpoint after `attempt` failed
    /// tries against it ended in `error`.
    pub fn decide(&self, attempt: u32, error: &LedgerError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::Failover { reason: format!("non-retryable error: {error}") };
        }

        if attempt >= self.max_attempts {
            return RetryDecision::Failover {
                reason: format!("maximum attempts ({}) reached", self.max_attempts),
            };
        }

        RetryDecision::Retry { delay: self.jittered_delay_for_attempt(attempt) }
    }
}

/// Applies jitter to a duration to prevent thundering herd effects.
///
/// Randomizes the delay by ±jitter_factor percentage. For example, with
/// jitter_factor=0.25, a 10s delay becomes 7.5s to 12.5s randomly.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() }
    }

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let policy = RetryPolicy { max_delay: Duration::from_secs(10), ..no_jitter() };

        let delays: Vec<_> = (1..=6).map(|attempt| policy.delay_for_attempt(attempt)).collect();

        assert_eq!(delays, vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(8),
            Duration::from_secs(10),
            Duration::from_secs(10),
        ]);
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for_attempt(u32::MAX), policy.max_delay);
    }

    #[test]
    fn linear_and_fixed_strategies() {
        let linear = RetryPolicy { backoff_strategy: BackoffStrategy::Linear, ..no_jitter() };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_secs(3));

        let fixed = RetryPolicy { backoff_strategy: BackoffStrategy::Fixed, ..no_jitter() };
        assert_eq!(fixed.delay_for_attempt(7), Duration::from_secs(1));
    }

    #[test]
    fn transient_errors_retry_until_the_endpoint_budget_is_spent() {
        let policy = no_jitter();
        let error = LedgerError::transient("http://a", "refused");

        let retry_after = |secs| RetryDecision::Retry { delay: Duration::from_secs(secs) };
        assert_eq!(policy.decide(1, &error), retry_after(1));
        assert_eq!(policy.decide(2, &error), retry_after(2));
        assert!(matches!(policy.decide(3, &error), RetryDecision::Failover { .. }));
    }

    #[test]
    fn rejections_fail_over_immediately() {
        let decision = no_jitter().decide(1, &LedgerError::rejected("http://a", "malformed"));

        match decision {
            RetryDecision::Failover { reason } => assert!(reason.contains("non-retryable")),
            RetryDecision::Retry { .. } => unreachable!("rejections must not be retried"),
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter_factor: 0.5,
            max_delay: Duration::from_secs(60),
            base_delay: Duration::from_secs(10),
            ..RetryPolicy::default()
        };

        for _ in 0..20 {
            let delay = policy.jittered_delay_for_attempt(1);
            assert!(delay >= Duration::from_secs(5), "delay too small: {delay:?}");
            assert!(delay <= Duration::from_secs(15), "delay too large: {delay:?}");
        }
    }

    #[test]
    fn endpoint_budget_covers_every_timeout_and_the_largest_jitter() {
        let budget = RetryPolicy::default().endpoint_budget(Duration::from_secs(30));
        // Three 30s timeouts plus waits of 1s and 2s stretched by 10% jitter.
        assert_eq!(budget, Duration::from_millis(93_300));

        let capped =
            RetryPolicy { max_attempts: 4, max_delay: Duration::from_secs(2), ..no_jitter() };
        assert_eq!(capped.endpoint_budget(Duration::from_secs(5)), Duration::from_secs(25));
    }
}
