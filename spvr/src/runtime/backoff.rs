//! Exponential retry delays.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Ceiling for the doubling delay.
    pub max: Duration,
    /// Retries allowed after the first failure before giving up. `None`
    /// retries forever.
    pub max_retries: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(2),
            max_retries: Some(10),
        }
    }
}

/// Consecutive-failure tracker producing doubling delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
    current: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial.min(config.max);
        Self {
            config,
            failures: 0,
            current,
        }
    }

    /// Records a failure and returns how long to wait before retrying, or
    /// `None` once the retry budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if let Some(max_retries) = self.config.max_retries
            && self.failures > max_retries
        {
            return None;
        }
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.config.max);
        Some(delay)
    }

    /// Forgets past failures after a success.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.current = self.config.initial.min(self.config.max);
    }

    /// Failures since the last reset.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }
}
