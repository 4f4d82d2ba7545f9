//! Retry policy for temporarily failing destinations.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How often, and how far apart, a destination is re-attempted after an
/// SMTP-level temporary failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per destination, the first one included.
    ///
    /// Default: 5
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff, in milliseconds.
    ///
    /// The delay before attempt `n + 1` is `base * 2^(n - 1)`.
    ///
    /// Default: 60000 (1 minute)
    #[serde(default = "defaults::retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Upper bound for the backoff, in milliseconds.
    ///
    /// Default: 3600000 (1 hour)
    #[serde(default = "defaults::max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// Randomises each delay within ±`retry_jitter_factor`.
    ///
    /// Default: 0.0
    #[serde(default)]
    pub retry_jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            retry_delay_ms: defaults::retry_delay_ms(),
            max_retry_delay_ms: defaults::max_retry_delay_ms(),
            retry_jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// A fixed delay between attempts, no growth and no jitter.
    #[must_use]
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let delay_ms = delay.as_millis() as u64;
        Self {
            max_attempts,
            retry_delay_ms: delay_ms,
            max_retry_delay_ms: delay_ms,
            retry_jitter_factor: 0.0,
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    #[must_use]
    pub const fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    #[must_use]
    pub const fn remaining_attempts(&self, attempts: u32) -> u32 {
        self.max_attempts.saturating_sub(attempts)
    }

    /// Delay to wait after attempt number `attempts` (1-indexed) failed.
    ///
    /// `min(base * 2^(attempts - 1), max) * (1 ± jitter)`
    #[must_use]
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1);
        let delay = if exponent >= 63 {
            self.max_retry_delay_ms
        } else {
            self.retry_delay_ms
                .saturating_mul(1u64 << exponent)
                .min(self.max_retry_delay_ms)
        };

        if self.retry_jitter_factor <= 0.0 || delay == 0 {
            return Duration::from_millis(delay);
        }

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let jittered = {
            let range = (delay as f64) * self.retry_jitter_factor;
            let jitter: f64 = rand::rng().random_range(-range..=range);
            ((delay as f64) + jitter).max(0.0) as u64
        };

        Duration::from_millis(jittered)
    }
}

mod defaults {
    pub const fn max_attempts() -> u32 {
        5
    }

    pub const fn retry_delay_ms() -> u64 {
        60_000
    }

    pub const fn max_retry_delay_ms() -> u64 {
        3_600_000
    }
}
