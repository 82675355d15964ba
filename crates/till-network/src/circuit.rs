//! Circuit breaker state machine
//!
//! ```text
//! Closed --(threshold consecutive failures)--> Open
//! Open   --(reset timeout elapsed, next call)--> HalfOpen
//! HalfOpen admits one trial call at a time
//! HalfOpen --success--> Closed
//! HalfOpen --failure--> Open (timeout restarts)
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitStateKind::Closed => "closed",
            CircuitStateKind::Open => "open",
            CircuitStateKind::HalfOpen => "half-open",
        }
    }
}

impl std::fmt::Display for CircuitStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<i64>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            trial_in_flight: false,
        }
    }

    /// Whether a call may proceed. Moves an expired open circuit to half-open.
    ///
    /// While half-open only one caller is admitted until its outcome is
    /// recorded or the trial is released.
    pub fn allow(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !std::mem::replace(&mut self.trial_in_flight, true),
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.reset_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                    tracing::info!("Circuit transitioned to half-open after reset timeout");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Hand back a half-open trial that ended without an outcome.
    pub fn release_trial(&mut self) {
        self.trial_in_flight = false;
    }

    pub fn record_success(&mut self) {
        self.trial_in_flight = false;
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                self.failure_count = 0;
                self.state = CircuitState::Closed;
                tracing::info!("Circuit closed after successful trial call");
            }
            CircuitState::Open { .. } => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.trial_in_flight = false;
        self.last_failure_at = Some(Utc::now().timestamp_millis());

        match self.state {
            CircuitState::Closed => {
                self.failure_count = self.failure_count.saturating_add(1);
                if self.failure_count >= self.failure_threshold {
                    self.state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                    tracing::warn!(
                        failures = self.failure_count,
                        threshold = self.failure_threshold,
                        "Circuit opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.failure_count = self.failure_count.saturating_add(1);
                self.state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                tracing::warn!("Circuit re-opened after half-open failure");
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Force the circuit closed and forget past failures.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.last_failure_at = None;
        self.trial_in_flight = false;
    }

    pub fn state(&self) -> CircuitStateKind {
        match self.state {
            CircuitState::Closed => CircuitStateKind::Closed,
            CircuitState::Open { .. } => CircuitStateKind::Open,
            CircuitState::HalfOpen => CircuitStateKind::HalfOpen,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure_at(&self) -> Option<i64> {
        self.last_failure_at
    }
}
