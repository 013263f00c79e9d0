//! Retry with exponential backoff, shared by tool calls and reconnects.

use crate::error::ProtocolError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How randomness is applied to a computed backoff delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Use the computed delay as-is.
    #[default]
    None,
    /// Pick uniformly from `[0, delay]`.
    Full,
    /// Scale the delay by a random factor in `[0.75, 1.25]`.
    Proportional,
}

/// Configuration for retry behavior on transient errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries).
    pub max_retries: u32,
    /// Delay in milliseconds before the first retry.
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds between retries.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_factor: f64,
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    /// Tool-call policy: two retries, 500ms then 2s.
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 500,
            max_delay_ms: 2000,
            backoff_factor: 4.0,
            jitter: Jitter::None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(calculate_delay(self, attempt))
    }
}

/// Returns `true` if the error is transient and the request should be retried.
pub fn is_retryable(error: &ProtocolError) -> bool {
    error.is_transient()
}

/// Calculate the delay in milliseconds before the next retry attempt.
///
/// Exponential backoff: `initial_delay_ms * backoff_factor^attempt`, clamped
/// to `max_delay_ms`, then jittered according to the policy.
pub fn calculate_delay(policy: &RetryPolicy, attempt: u32) -> u64 {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let base = policy.initial_delay_ms as f64 * policy.backoff_factor.powi(exponent);
    let clamped = base.min(policy.max_delay_ms as f64);

    let jittered = match policy.jitter {
        Jitter::None => clamped,
        Jitter::Full => rand::rng().random_range(0.0..=clamped),
        Jitter::Proportional => clamped * rand::rng().random_range(0.75..=1.25),
    };

    (jittered as u64).min(policy.max_delay_ms)
}
