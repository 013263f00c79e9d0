//! Per-server circuit breaker.
//!
//! Consecutive transient failures within `window_ms` trip the circuit open.
//! After `cooldown_ms` exactly one trial call is let through; its outcome
//! closes the circuit again or re-opens it for another cooldown.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Failures further apart than this start a new count.
    pub window_ms: u64,
    /// Time spent open before a trial call is allowed.
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            cooldown_ms: 30_000,
        }
    }
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast.
    Open,
    /// One trial call is testing whether the server recovered.
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    first_failure: Option<Instant>,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            first_failure: None,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.config.cooldown_ms)
    }

    /// Ask to send a call. `Err` carries how long until a trial is possible.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Err(Duration::ZERO),
            CircuitState::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.cooldown() {
                    self.state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(self.cooldown() - elapsed)
                }
            }
        }
    }

    /// The server answered, even if the answer was an error.
    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            tracing::info!("circuit closed after successful trial call");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.first_failure = None;
        self.opened_at = None;
    }

    /// A transient failure: timeout or lost connection.
    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::HalfOpen => self.trip(now),
            CircuitState::Open => {}
            CircuitState::Closed => {
                let window = Duration::from_millis(self.config.window_ms);
                let stale = self
                    .first_failure
                    .is_none_or(|first| now.saturating_duration_since(first) > window);
                if stale {
                    self.first_failure = Some(now);
                    self.consecutive_failures = 0;
                }
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.trip(now);
                }
            }
        }
    }

    /// Give back an acquired slot without judging the server, e.g. when the
    /// call ended for a reason unrelated to the server's health.
    pub fn release(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Open;
        }
    }

    fn trip(&mut self, now: Instant) {
        tracing::warn!(
            failures = self.consecutive_failures,
            "circuit opened for {}ms",
            self.config.cooldown_ms
        );
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.consecutive_failures = 0;
        self.first_failure = None;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
