//! Retry policy for failed jobs.
//!
//! Decides whether a retryable failure may be attempted again and how long to
//! wait before doing so, independently of the queue that applies it.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Highest failure count that still earns another attempt.
    ///
    /// A job whose failure count goes past this is marked permanently failed,
    /// so the worker runs at most `max_retries + 1` times.
    ///
    /// Default: 110
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff (in milliseconds).
    ///
    /// The delay is calculated as: `base * 2^failure_count`
    ///
    /// Default: 1000 milliseconds
    #[serde(default = "defaults::base_delay_ms")]
    pub base_delay_ms: u64,

    /// Ceiling on the backoff delay (in milliseconds).
    ///
    /// Default: 3600000 milliseconds (1 hour)
    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,

    /// Jitter factor for randomizing delays.
    ///
    /// The delay is randomized within ±`jitter_factor` so records that failed
    /// together do not all retry together, then clamped to the ceiling.
    /// Factors above 1 are treated as 1; zero, negative, and non-finite
    /// factors disable jitter.
    ///
    /// Default: 0.1 (±10%)
    #[serde(default = "defaults::jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            base_delay_ms: defaults::base_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            jitter_factor: defaults::jitter_factor(),
        }
    }
}

impl RetryPolicy {
    /// Check if a job that has failed `failure_count` times may run again.
    #[must_use]
    pub const fn should_retry(&self, failure_count: u32) -> bool {
        failure_count <= self.max_retries
    }

    /// Attempts left before a job with `failure_count` failures gives up.
    #[must_use]
    pub const fn remaining_retries(&self, failure_count: u32) -> u32 {
        self.max_retries.saturating_sub(failure_count)
    }

    /// The un-jittered backoff: `min(max_delay, base * 2^failure_count)`.
    ///
    /// Monotonically non-decreasing in `failure_count`.
    #[must_use]
    pub fn backoff(&self, failure_count: u32) -> Duration {
        let delay = 1u64
            .checked_shl(failure_count)
            .map_or(self.max_delay_ms, |multiplier| {
                self.base_delay_ms.saturating_mul(multiplier)
            })
            .min(self.max_delay_ms);

        Duration::from_millis(delay)
    }

    /// The delay before the next attempt of a job that has failed
    /// `failure_count` times, with jitter applied.
    #[must_use]
    pub fn next_delay(&self, failure_count: u32) -> Duration {
        let delay = self.backoff(failure_count);
        if !self.jitter_factor.is_finite() || self.jitter_factor <= 0.0 {
            return delay;
        }
        let jitter_factor = self.jitter_factor.min(1.0);

        // Intentional precision loss and casting for randomization
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let jittered = {
            let millis = delay.as_millis() as f64;
            let range = millis * jitter_factor;
            let jitter: f64 = rand::rng().random_range(-range..=range);
            ((millis + jitter).max(0.0) as u64).min(self.max_delay_ms)
        };

        Duration::from_millis(jittered)
    }
}

mod defaults {
    pub const fn max_retries() -> u32 {
        110
    }

    pub const fn base_delay_ms() -> u64 {
        1000
    }

    pub const fn max_delay_ms() -> u64 {
        3_600_000 // 1 hour
    }

    pub const fn jitter_factor() -> f64 {
        0.1 // ±10%
    }
}
