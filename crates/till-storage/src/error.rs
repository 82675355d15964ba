//! Storage error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Reasons a session payload is rejected. Never thrown to callers; the
/// token store reports them through a boolean and a log line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Session payload has no user")]
    MissingUser,

    #[error("Session payload has no token")]
    MissingToken,

    #[error("Malformed token (expected \"<id>|<secret>\")")]
    MalformedToken,

    #[error("Expiry {expires_at} is not after login time {login_at}")]
    InvalidExpiry { login_at: i64, expires_at: i64 },
}
