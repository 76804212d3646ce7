//! AN-005: Retry policy — bounded attempts, exponential backoff with jitter.
//!
//! Applied only to transient failures. The budget counts every attempt,
//! including the first, so `max_attempts: 3` means at most three adapter calls.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff configuration for transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed per node per run
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Cap on any single delay
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Randomize each delay into [d/2, d]
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt fits the budget after `attempts` calls.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Un-jittered delay before the retry following attempt number `attempts` (1-based).
    pub fn base_delay(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(32);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Delay to sleep before the next retry.
    pub fn delay(&self, attempts: u32) -> Duration {
        let full = self.base_delay(attempts);
        if !self.jitter || full.is_zero() {
            return full;
        }
        let ms = full.as_millis() as u64;
        let half = ms / 2;
        Duration::from_millis(half + rand::thread_rng().gen_range(0..=ms - half))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(max_attempts: u32, base: u64, cap: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: base,
            max_delay_ms: cap,
            jitter: false,
        }
    }

    #[test]
    fn test_an005_defaults() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.base_delay_ms, 500);
        assert!(p.jitter);
    }

    #[test]
    fn test_an005_budget_counts_first_attempt() {
        let p = fixed(3, 10, 1000);
        assert!(p.should_retry(1));
        assert!(p.should_retry(2));
        assert!(!p.should_retry(3));
        assert!(!p.should_retry(4));
    }

    #[test]
    fn test_an005_single_attempt_never_retries() {
        assert!(!fixed(1, 10, 1000).should_retry(1));
    }

    #[test]
    fn test_an005_exponential() {
        let p = fixed(5, 100, 60_000);
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(400));
        assert_eq!(p.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_an005_capped() {
        let p = fixed(10, 1000, 3000);
        assert_eq!(p.delay(3), Duration::from_millis(3000));
        assert_eq!(p.delay(9), Duration::from_millis(3000));
    }

    #[test]
    fn test_an005_no_overflow_on_huge_attempts() {
        let p = fixed(u32::MAX, u64::MAX / 2, u64::MAX);
        assert_eq!(p.delay(200), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_an005_jitter_bounds() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 400,
            max_delay_ms: 60_000,
            jitter: true,
        };
        for _ in 0..200 {
            let d = p.delay(2).as_millis();
            assert!((400..=800).contains(&d), "delay {} out of [400, 800]", d);
        }
    }

    #[test]
    fn test_an005_zero_base_is_immediate() {
        let p = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: true,
        };
        assert!(p.delay(1).is_zero());
    }
}
