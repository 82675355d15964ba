//! Session timing configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::SessionError;
use crate::Result;

const MINUTE_MS: u64 = 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lifetime granted on login and on every extension
    pub max_lifetime_ms: u64,
    pub expiry_check_interval_ms: u64,
    /// Remaining lifetime at which the first warning fires
    pub warning_threshold_ms: u64,
    /// Remaining lifetime at which the critical warning fires
    pub critical_threshold_ms: u64,
    /// Server re-validation period; `None` disables automatic extension
    pub extension_interval_ms: Option<u64>,
    /// Automatic extension stops after this long without operator activity
    pub idle_timeout_ms: u64,
    /// Minimum spacing between activity broadcasts to other tabs
    pub activity_broadcast_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_lifetime_ms: 8 * 60 * MINUTE_MS,
            expiry_check_interval_ms: 30 * 1000,
            warning_threshold_ms: 5 * MINUTE_MS,
            critical_threshold_ms: MINUTE_MS,
            extension_interval_ms: Some(15 * MINUTE_MS),
            idle_timeout_ms: 30 * MINUTE_MS,
            activity_broadcast_interval_ms: MINUTE_MS,
        }
    }
}

impl SessionConfig {
    /// Thresholds must satisfy `critical < warning < max_lifetime`.
    pub fn validate(&self) -> Result<()> {
        if self.critical_threshold_ms >= self.warning_threshold_ms {
            return Err(SessionError::InvalidConfig(format!(
                "critical threshold ({}ms) must be below warning threshold ({}ms)",
                self.critical_threshold_ms, self.warning_threshold_ms
            )));
        }
        if self.warning_threshold_ms >= self.max_lifetime_ms {
            return Err(SessionError::InvalidConfig(format!(
                "warning threshold ({}ms) must be below max lifetime ({}ms)",
                self.warning_threshold_ms, self.max_lifetime_ms
            )));
        }
        if self.expiry_check_interval_ms == 0 {
            return Err(SessionError::InvalidConfig(
                "expiry check interval must be positive".to_string(),
            ));
        }
        if self.extension_interval_ms == Some(0) {
            return Err(SessionError::InvalidConfig(
                "extension interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn lifetime_ms(&self) -> i64 {
        to_i64(self.max_lifetime_ms)
    }

    pub(crate) fn warning_ms(&self) -> i64 {
        to_i64(self.warning_threshold_ms)
    }

    pub(crate) fn critical_ms(&self) -> i64 {
        to_i64(self.critical_threshold_ms)
    }

    pub(crate) fn idle_ms(&self) -> i64 {
        to_i64(self.idle_timeout_ms)
    }

    pub(crate) fn activity_broadcast_ms(&self) -> i64 {
        to_i64(self.activity_broadcast_interval_ms)
    }

    pub fn expiry_check_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_check_interval_ms)
    }

    pub fn extension_interval(&self) -> Option<Duration> {
        self.extension_interval_ms.map(Duration::from_millis)
    }
}

fn to_i64(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}
