//! Session error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Network error: {0}")]
    Network(#[from] till_network::NetworkError),

    #[error("Malformed login response: {0}")]
    MalformedResponse(String),

    #[error("Invalid session config: {0}")]
    InvalidConfig(String),

    #[error("Session manager destroyed")]
    Destroyed,
}
