//! Retry budget and backoff schedule for REST calls.
//!
//! The policy is a plain value: the request engine asks it how many
//! attempts it may make and how long to wait between them. Whether retries
//! are currently enabled is tracked by the client, not here.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration for request retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first. Clamped to >= 1.
    pub max_attempts: u32,

    /// Delay before the first retry. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on the backoff delay. Default: 30s.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Attempts allowed for one request, honoring the runtime toggle.
    pub fn attempts(&self, retries_enabled: bool) -> u32 {
        if retries_enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    /// Delay before retry number `retry` (0-based).
    ///
    /// `delay = min(initial * 2^retry, max) * jitter`, jitter in [0.75, 1.25].
    pub fn backoff(&self, retry: u32) -> Duration {
        let capped = self.base_delay(retry);
        if capped.is_zero() {
            return capped;
        }

        let jitter_factor = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_secs_f64(capped.as_secs_f64() * jitter_factor)
    }

    fn base_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.min(31)).unwrap_or(31);
        let base = self.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }
}
