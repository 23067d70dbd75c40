//! Exponential backoff between attribution attempts.
//!
//! A failed entry is retried at most [`MAX_RETRIES`] times. The delay before
//! retry `n` (0-indexed) is `initial_delay * multiplier^n`, capped at
//! `max_delay`, then stretched by a jitter factor in `[1.0, 1.0 + jitter%]`.
//! The jitter is derived from the transaction id so the same entry always
//! waits the same amount, while entries failing together spread out.

use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::types::{MAX_RETRIES, TransactionId};

/// Default jitter percentage (0-100).
pub const DEFAULT_JITTER_PERCENT: u8 = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Cap for exponential growth, applied before jitter.
    pub max_delay: Duration,

    /// Growth factor between consecutive retries.
    pub multiplier: f64,

    /// Upper bound of the jitter stretch, in percent.
    pub jitter_percent: u8,
}

impl BackoffPolicy {
    /// 500ms, 1s, 2s before jitter.
    pub const DEFAULT: Self = Self {
        initial_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(8),
        multiplier: 2.0,
        jitter_percent: DEFAULT_JITTER_PERCENT,
    };

    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Self::DEFAULT
        }
    }

    /// Delay before retry `attempt` (0-indexed), without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_secs.max(0.0))
    }

    /// Delay before retry `attempt` of a specific transaction.
    pub fn delay_with_jitter(&self, attempt: u32, id: &TransactionId) -> Duration {
        self.delay_for_attempt(attempt)
            .mul_f64(self.jitter_factor(attempt, id))
    }

    /// The un-jittered delays for every permitted retry.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..MAX_RETRIES).map(|attempt| self.delay_for_attempt(attempt))
    }

    /// Upper bound on the time spent backing off for one entry.
    pub fn total_max_wait(&self) -> Duration {
        self.delays()
            .map(|d| d.mul_f64(1.0 + f64::from(self.jitter_percent) / 100.0))
            .sum()
    }

    fn jitter_factor(&self, attempt: u32, id: &TransactionId) -> f64 {
        if self.jitter_percent == 0 {
            return 1.0;
        }
        let mut hasher = std::hash::DefaultHasher::new();
        id.as_str().hash(&mut hasher);
        attempt.hash(&mut hasher);
        let jitter = (hasher.finish() % (u64::from(self.jitter_percent) + 1)) as f64 / 100.0;
        1.0 + jitter
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}
