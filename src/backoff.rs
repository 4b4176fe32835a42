//! Reconnection delays
//!
//! A [`ReconnectPolicy`] decides whether a failed connection is retried and how
//! long to wait first. Failures are counted from 1 and reset once a connection
//! reaches the ready state.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay strategy between reconnection attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum Backoff {
    /// Retry without waiting
    Immediate,
    /// Wait the same delay before every retry
    Fixed { delay_ms: u64 },
    /// Double (or scale by `factor`) the delay after every failure, up to `max_ms`
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        #[serde(default = "default_factor")]
        factor: f64,
        #[serde(default)]
        jitter_ms: u64,
    },
}

fn default_factor() -> f64 {
    2.0
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial_ms: 250,
            max_ms: 5_000,
            factor: default_factor(),
            jitter_ms: 100,
        }
    }
}

impl Backoff {
    /// Delay before the retry that follows the `failures`-th consecutive failure
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            Backoff::Immediate => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential {
                initial_ms,
                max_ms,
                factor,
                jitter_ms,
            } => {
                let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
                let scaled = (initial_ms as f64) * factor.max(1.0).powi(exponent);
                let base = if scaled.is_finite() {
                    (scaled as u64).min(max_ms)
                } else {
                    max_ms
                };
                let jitter = if jitter_ms > 0 {
                    rand::rng().random_range(0..=jitter_ms)
                } else {
                    0
                };
                Duration::from_millis(base.saturating_add(jitter))
            }
        }
    }
}

/// Whether and when to re-establish a failed connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Maximum consecutive retries; unbounded when absent
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub backoff: Backoff,
}

impl ReconnectPolicy {
    pub fn new(backoff: Backoff, max_retries: Option<u32>) -> Self {
        Self {
            backoff,
            max_retries,
        }
    }

    /// Retry at once, forever
    pub fn immediate() -> Self {
        Self::new(Backoff::Immediate, None)
    }

    /// Never retry
    pub fn disabled() -> Self {
        Self::new(Backoff::Immediate, Some(0))
    }

    /// Delay before the next attempt, or `None` once retries are exhausted
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        match self.max_retries {
            Some(max) if failures > max => None,
            _ => Some(self.backoff.delay(failures)),
        }
    }
}
