//! Retry policy: a bounded sequence of attempts.
//!
//! A policy is iterated once per logical operation. Each [`Attempt`] carries
//! the delay the caller should wait before performing it. Exhausting the
//! iterator is terminal.

use std::time::Duration;
use tokio::time::Instant;

/// A single attempt token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// Zero-based attempt number.
    pub number: u32,
    /// Time to wait before performing this attempt.
    pub delay: Duration,
}

/// Exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Backoff {
    base: Duration,
    max: Duration,
}

/// Bounds how many times, and for how long, an operation is attempted.
///
/// By default attempts follow each other without delay and without a time
/// budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    budget: Option<Duration>,
    backoff: Option<Backoff>,
}

impl RetryPolicy {
    /// Creates a policy yielding exactly `attempts` tokens.
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            budget: None,
            backoff: None,
        }
    }

    /// Stops yielding attempts once `budget` has elapsed since iteration
    /// started. The first attempt is always yielded.
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Waits `base * 2^(k-1)` before attempt `k >= 1`, capped at `max`.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff = Some(Backoff { base, max });
        self
    }

    /// Returns the maximum number of attempts.
    pub fn max_attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the delay before attempt `number`.
    pub fn delay_for(&self, number: u32) -> Duration {
        match self.backoff {
            Some(backoff) if number > 0 => {
                let factor = 1u32.checked_shl(number - 1).unwrap_or(u32::MAX);
                backoff
                    .base
                    .checked_mul(factor)
                    .unwrap_or(backoff.max)
                    .min(backoff.max)
            }
            _ => Duration::ZERO,
        }
    }

    /// Starts a fresh iteration.
    pub fn attempts(&self) -> Attempts<'_> {
        Attempts {
            policy: self,
            next: 0,
            started: Instant::now(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Iterator over the attempts of one logical operation.
#[derive(Debug)]
pub struct Attempts<'a> {
    policy: &'a RetryPolicy,
    next: u32,
    started: Instant,
}

impl Iterator for Attempts<'_> {
    type Item = Attempt;

    fn next(&mut self) -> Option<Attempt> {
        if self.next >= self.policy.attempts {
            return None;
        }
        if let Some(budget) = self.policy.budget {
            if self.next > 0 && self.started.elapsed() >= budget {
                return None;
            }
        }
        let attempt = Attempt {
            number: self.next,
            delay: self.policy.delay_for(self.next),
        };
        self.next += 1;
        Some(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yields_exactly_n_attempts() {
        let policy = RetryPolicy::new(3);
        let numbers: Vec<u32> = policy.attempts().map(|a| a.number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);

        // A fresh iteration starts over.
        assert_eq!(policy.attempts().count(), 3);
    }

    #[test]
    fn test_zero_attempts() {
        assert_eq!(RetryPolicy::new(0).attempts().count(), 0);
    }

    #[test]
    fn test_default_has_no_delay() {
        let policy = RetryPolicy::new(5);
        assert!(policy.attempts().all(|a| a.delay == Duration::ZERO));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::new(6)
            .with_backoff(Duration::from_millis(100), Duration::from_millis(500));
        let delays: Vec<u64> = policy
            .attempts()
            .map(|a| a.delay.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![0, 100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        let policy = RetryPolicy::new(u32::MAX)
            .with_backoff(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(200), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_stops_iteration() {
        let policy = RetryPolicy::new(10).with_budget(Duration::from_secs(1));
        let mut attempts = policy.attempts();

        assert!(attempts.next().is_some());
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(attempts.next().is_some());
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(attempts.next().is_none());
    }
}
