//! Backoff schedule for `establish_with_retry`.
//!
//! Retries are always bounded: a tunnel that keeps failing is reported to the
//! caller instead of being retried forever.

use std::time::Duration;

/// How often and how patiently `establish_with_retry` tries again.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Wait before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single wait
    pub max_delay: Duration,
    /// Growth factor per retry. Values below 1 or not finite count as 1.
    pub multiplier: f64,
    /// Retries after the first attempt
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    fn growth(&self) -> f64 {
        if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            1.0
        }
    }
}

/// Hands out the waits between establish attempts.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: ReconnectConfig,
    next: Duration,
    retries: u32,
}

impl ExponentialBackoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            next: config.initial_delay.min(config.max_delay),
            retries: 0,
            config,
        }
    }

    /// Wait before the next retry, or `None` once the retries are used up
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.config.max_attempts {
            return None;
        }
        self.retries += 1;

        let delay = self.next;
        let grown = delay.as_secs_f64() * self.config.growth();
        self.next = Duration::try_from_secs_f64(grown)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay);

        Some(delay)
    }

    /// Retries handed out so far
    pub fn retries(&self) -> u32 {
        self.retries
    }
}
