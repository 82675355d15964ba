//! Till Network Resilience
//!
//! Wraps async server calls with:
//! - Bounded exponential backoff with jitter
//! - A hard per-attempt timeout
//! - A circuit breaker that fails fast while the server is unhealthy
//! - In-flight deduplication keyed by caller-supplied labels

mod circuit;
mod config;
mod error;
mod retry;

pub use circuit::{CircuitBreaker, CircuitStateKind};
pub use config::RetryConfig;
pub use error::{ErrorCode, NetworkError};
pub use retry::{ExecuteOptions, NetworkRetry, NetworkStatus, RetryCallback, RetryInfo};

pub type Result<T> = std::result::Result<T, NetworkError>;
