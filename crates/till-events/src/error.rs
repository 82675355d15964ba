//! Event bus error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Timed out after {timeout_ms}ms waiting for event: {event}")]
    Timeout { event: String, timeout_ms: u64 },

    #[error("Event bus closed before {0} was emitted")]
    Closed(String),
}
