//! Network error type
//!
//! One error type for every failure a server call can produce, discriminated
//! by [`ErrorCode`]. Cloneable so deduplicated callers can share an outcome.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The host reports no connectivity
    Offline,
    /// An attempt exceeded its deadline
    Timeout,
    /// The call was cancelled
    Aborted,
    /// The circuit breaker is rejecting calls
    CircuitOpen,
    /// The server answered with a non-success HTTP status
    Http,
    /// Generic transport failure (connection refused, reset, DNS…)
    Network,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Offline => "OFFLINE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::Http => "HTTP",
            ErrorCode::Network => "NETWORK",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct NetworkError {
    code: ErrorCode,
    status: Option<u16>,
    message: String,
    retryable: Option<bool>,
}

impl NetworkError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            status: None,
            message: message.into(),
            retryable: None,
        }
    }

    pub fn offline() -> Self {
        Self::new(ErrorCode::Offline, "network is offline")
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("request timed out after {}ms", after.as_millis()),
        )
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Aborted, message)
    }

    pub fn circuit_open() -> Self {
        Self::new(
            ErrorCode::CircuitOpen,
            "service degraded: circuit breaker is open",
        )
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(ErrorCode::Http, message)
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Network, message)
    }

    /// Override the default retry classification. Has no effect on 401/403,
    /// which are never retried.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_offline(&self) -> bool {
        self.code == ErrorCode::Offline
    }

    pub fn is_timeout(&self) -> bool {
        self.code == ErrorCode::Timeout
    }

    pub fn is_aborted(&self) -> bool {
        self.code == ErrorCode::Aborted
    }

    pub fn is_circuit_open(&self) -> bool {
        self.code == ErrorCode::CircuitOpen
    }

    /// The server explicitly refused the credentials (HTTP 401/403).
    pub fn is_auth_rejection(&self) -> bool {
        self.code == ErrorCode::Http && matches!(self.status, Some(401 | 403))
    }

    pub fn is_server_error(&self) -> bool {
        self.code == ErrorCode::Http && self.status.is_some_and(|s| s >= 500)
    }

    pub fn is_retryable(&self) -> bool {
        if self.is_auth_rejection() {
            return false;
        }
        if let Some(retryable) = self.retryable {
            return retryable;
        }

        match self.code {
            ErrorCode::Timeout | ErrorCode::Network => true,
            ErrorCode::Http => matches!(self.status, Some(408 | 429)) || self.is_server_error(),
            ErrorCode::Offline | ErrorCode::Aborted | ErrorCode::CircuitOpen => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }

    /// Failures that say the service itself is unhealthy.
    pub(crate) fn counts_toward_circuit(&self) -> bool {
        matches!(self.code, ErrorCode::Timeout | ErrorCode::Network) || self.is_server_error()
    }
}
