//! Network Retry
//!
//! Every server call of the session layer goes through [`NetworkRetry::execute`].
//! Callers sharing a dedupe key attach to the same in-flight call instead of
//! issuing their own, so retried side effects are never duplicated.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::circuit::{CircuitBreaker, CircuitStateKind};
use crate::config::RetryConfig;
use crate::error::{ErrorCode, NetworkError};
use crate::Result;

/// Details handed to [`ExecuteOptions::on_retry`] before each backoff sleep.
#[derive(Debug, Clone)]
pub struct RetryInfo {
    /// The attempt that just failed (1-indexed)
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub error: NetworkError,
}

pub type RetryCallback = Arc<dyn Fn(&RetryInfo) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ExecuteOptions {
    pub max_attempts: Option<u32>,
    pub dedupe_key: Option<String>,
    pub on_retry: Option<RetryCallback>,
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RetryInfo) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("max_attempts", &self.max_attempts)
            .field("dedupe_key", &self.dedupe_key)
            .field("on_retry", &self.on_retry.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub is_online: bool,
    pub circuit_state: CircuitStateKind,
    pub failure_count: u32,
    pub pending_requests: usize,
    pub last_failure_at: Option<i64>,
}

type SharedCall<T> = Shared<BoxFuture<'static, Result<T>>>;

struct Inner {
    config: RetryConfig,
    circuit: Mutex<CircuitBreaker>,
    online: AtomicBool,
    pending: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
    in_flight: AtomicUsize,
    shutdown: watch::Sender<bool>,
}

/// Decrements the in-flight counter when a call finishes or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Half-open trial held by an attempt; released if the attempt ends without
/// recording an outcome.
struct Trial<'a> {
    circuit: &'a Mutex<CircuitBreaker>,
    held: bool,
}

impl Trial<'_> {
    fn settle(&mut self) {
        self.held = false;
    }
}

impl Drop for Trial<'_> {
    fn drop(&mut self) {
        if self.held {
            self.circuit.lock().release_trial();
        }
    }
}

pub struct NetworkRetry {
    inner: Arc<Inner>,
}

impl NetworkRetry {
    pub fn new(config: RetryConfig) -> Self {
        let circuit = CircuitBreaker::new(
            config.circuit_failure_threshold,
            config.circuit_reset_timeout(),
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                circuit: Mutex::new(circuit),
                online: AtomicBool::new(true),
                pending: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.inner.config
    }

    /// Run `operation` under the retry policy.
    ///
    /// `operation` is invoked once per attempt. With a dedupe key, concurrent
    /// callers share one underlying call and all observe its outcome.
    pub async fn execute<T, F, Fut>(&self, operation: F, options: ExecuteOptions) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let Some(key) = options.dedupe_key.clone() else {
            return self.run(operation, options).await;
        };

        let call: SharedCall<T> = {
            let mut pending = self.inner.pending.lock();
            let existing = pending
                .get(&key)
                .and_then(|entry| entry.downcast_ref::<SharedCall<T>>())
                .cloned();

            match existing {
                Some(call) => {
                    tracing::debug!(dedupe_key = %key, "Joining in-flight request");
                    call
                }
                None => {
                    let this = self.clone();
                    let cleanup_key = key.clone();
                    let call = async move {
                        let result = this.run(operation, options).await;
                        this.inner.pending.lock().remove(&cleanup_key);
                        result
                    }
                    .boxed()
                    .shared();

                    pending.insert(key, Box::new(call.clone()));
                    call
                }
            }
        };

        call.await
    }

    async fn run<T, F, Fut>(&self, mut operation: F, options: ExecuteOptions) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let config = &self.inner.config;
        let max_attempts = options.max_attempts.unwrap_or(config.max_attempts).max(1);
        let timeout = options.timeout.unwrap_or_else(|| config.timeout());
        let mut shutdown = self.inner.shutdown.subscribe();
        let _in_flight = InFlight::enter(&self.inner.in_flight);
        let mut attempt = 0u32;

        loop {
            if *shutdown.borrow() {
                return Err(NetworkError::aborted("network layer shut down"));
            }
            if !self.is_online() {
                tracing::debug!("Rejecting request while offline");
                return Err(NetworkError::offline());
            }
            let mut trial = {
                let mut circuit = self.inner.circuit.lock();
                if !circuit.allow() {
                    tracing::debug!("Rejecting request while circuit is open");
                    return Err(NetworkError::circuit_open());
                }
                Trial {
                    circuit: &self.inner.circuit,
                    held: circuit.state() == CircuitStateKind::HalfOpen,
                }
            };

            attempt += 1;
            let outcome = match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(NetworkError::timeout(timeout)),
            };

            let error = match outcome {
                Ok(value) => {
                    self.inner.circuit.lock().record_success();
                    trial.settle();
                    if attempt > 1 {
                        tracing::debug!(attempts = attempt, "Request succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            // a half-open trial gets a single attempt
            if error.is_retryable() && attempt < max_attempts && !trial.held {
                let delay = config.delay_for_attempt(attempt);
                tracing::debug!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying request after failure"
                );

                if let Some(callback) = &options.on_retry {
                    let info = RetryInfo {
                        attempt,
                        max_attempts,
                        delay,
                        error: error.clone(),
                    };
                    if catch_unwind(AssertUnwindSafe(|| callback(&info))).is_err() {
                        tracing::error!("Retry callback panicked");
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        return Err(NetworkError::aborted("network layer shut down during backoff"));
                    }
                }
                continue;
            }

            {
                let mut circuit = self.inner.circuit.lock();
                if error.counts_toward_circuit() {
                    circuit.record_failure();
                    trial.settle();
                } else if error.code() == ErrorCode::Http {
                    // the server answered, so it is reachable
                    circuit.record_success();
                    trial.settle();
                }
            }

            tracing::warn!(
                attempts = attempt,
                code = %error.code(),
                status = ?error.status(),
                error = %error,
                "Request failed"
            );
            return Err(error);
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Mirror the host's connectivity signal.
    pub fn set_online(&self, online: bool) {
        let previous = self.inner.online.swap(online, Ordering::SeqCst);
        if previous != online {
            tracing::info!(online, "Network connectivity changed");
        }
    }

    pub fn reset_circuit_breaker(&self) {
        self.inner.circuit.lock().reset();
        tracing::info!("Circuit breaker reset");
    }

    /// Abort pending backoff sleeps and reject further calls with `ABORTED`.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    pub fn status(&self) -> NetworkStatus {
        let circuit = self.inner.circuit.lock();
        NetworkStatus {
            is_online: self.is_online(),
            circuit_state: circuit.state(),
            failure_count: circuit.failure_count(),
            pending_requests: self.inner.in_flight.load(Ordering::SeqCst),
            last_failure_at: circuit.last_failure_at(),
        }
    }
}

impl Default for NetworkRetry {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl Clone for NetworkRetry {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
