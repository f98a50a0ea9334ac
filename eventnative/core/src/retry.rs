//! Respawn budget for template workers.
//!
//! A worker that fails to start is retried with exponential backoff. The
//! number of attempts is bounded: once the budget is spent the failure is
//! surfaced to the caller instead of retrying forever.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;

/// Default number of spawn attempts per (re)spawn.
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Default delay before the second attempt in milliseconds.
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;

/// Default upper bound for a single backoff delay in milliseconds.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 2000;

/// Exponential backoff settings for spawning worker processes.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts including the first one (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Delay before the second attempt in milliseconds (default: 100ms).
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Cap for any single delay in milliseconds (default: 2000ms).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl RetryConfig {
    /// Delays between attempts, doubling from `initial_backoff_ms` up to the cap.
    ///
    /// Yields `max_attempts - 1` delays since the first attempt runs immediately.
    pub fn strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor(self.initial_backoff_ms / 2)
            .max_delay(Duration::from_millis(self.max_backoff_ms))
            .take(self.max_attempts.saturating_sub(1))
    }

    /// Number of attempts actually made, never less than one.
    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }

    /// Template-level settings win over executor-level ones.
    pub fn merge(executor: &Option<RetryConfig>, template: &Option<RetryConfig>) -> RetryConfig {
        match (executor, template) {
            (_, Some(template)) => template.clone(),
            (Some(executor), None) => executor.clone(),
            (None, None) => RetryConfig::default(),
        }
    }
}

fn default_max_attempts() -> usize {
    DEFAULT_MAX_ATTEMPTS
}

fn default_initial_backoff_ms() -> u64 {
    DEFAULT_INITIAL_BACKOFF_MS
}

fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_BACKOFF_MS
}
