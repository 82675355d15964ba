//! Retry and circuit breaker configuration

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound for jitter, as a fraction of the computed delay.
const MAX_JITTER_RATIO: f64 = 0.3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per call, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Growth factor between consecutive retries
    pub multiplier: f64,
    /// Cap applied before jitter
    pub max_delay_ms: u64,
    /// Random spread around the computed delay, clamped to ±30%
    pub jitter_ratio: f64,
    /// Deadline for a single attempt
    pub timeout_ms: u64,
    /// Consecutive failed calls that open the circuit
    pub circuit_failure_threshold: u32,
    /// Time the circuit stays open before a trial call is allowed
    pub circuit_reset_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_ratio: 0.3,
            timeout_ms: 15_000,
            circuit_failure_threshold: 5,
            circuit_reset_timeout_ms: 60_000,
        }
    }
}

impl RetryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn circuit_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_reset_timeout_ms)
    }

    /// Delay after failed attempt `attempt` (1-indexed), before jitter:
    /// `min(base × multiplier^(attempt-1), max)`. Non-decreasing in `attempt`.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let max_ms = self.max_delay_ms as f64;
        let multiplier = if self.multiplier.is_finite() {
            self.multiplier.max(1.0)
        } else {
            1.0
        };

        // powi saturates to infinity long before this exponent matters
        let exponent = attempt.saturating_sub(1).min(1_024) as i32;
        let raw = self.base_delay_ms as f64 * multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(max_ms)
        } else {
            max_ms
        };

        Duration::from_millis(capped as u64)
    }

    /// [`Self::base_delay_for_attempt`] with random jitter applied. Never
    /// exceeds `max_delay × 1.3`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay_for_attempt(attempt).as_millis() as f64;
        let ratio = if self.jitter_ratio.is_finite() {
            self.jitter_ratio.clamp(0.0, MAX_JITTER_RATIO)
        } else {
            0.0
        };

        let jitter = if ratio > 0.0 {
            let spread = base_ms * ratio;
            rand::rng().random_range(-spread..=spread)
        } else {
            0.0
        };

        Duration::from_millis((base_ms + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_grows_and_caps() {
        let config = RetryConfig {
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 1_000,
            ..RetryConfig::default()
        };

        let delays: Vec<u64> = (1..=8)
            .map(|n| config.base_delay_for_attempt(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000, 1_000, 1_000]);
    }

    #[test]
    fn test_delays_non_decreasing_and_bounded() {
        let config = RetryConfig {
            base_delay_ms: 250,
            multiplier: 3.0,
            max_delay_ms: 10_000,
            ..RetryConfig::default()
        };
        let bound = (10_000.0 * 1.3) as u128;

        let mut previous = Duration::ZERO;
        for attempt in 1..=20 {
            let base = config.base_delay_for_attempt(attempt);
            assert!(base >= previous);
            previous = base;

            let jittered = config.delay_for_attempt(attempt);
            assert!(jittered.as_millis() <= bound);
        }
    }

    #[test]
    fn test_cap_holds_for_extreme_multipliers() {
        for multiplier in [1e300, f64::INFINITY, f64::NAN, 0.1, -5.0] {
            let config = RetryConfig {
                base_delay_ms: 1_000,
                multiplier,
                max_delay_ms: 5_000,
                jitter_ratio: 5.0,
                ..RetryConfig::default()
            };

            for attempt in [1, 2, 50, u32::MAX] {
                let base = config.base_delay_for_attempt(attempt);
                assert!(base <= Duration::from_millis(5_000));
                assert!(config.delay_for_attempt(attempt) <= Duration::from_millis(6_500));
            }
        }
    }
}
