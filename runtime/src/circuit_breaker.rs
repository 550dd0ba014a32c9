//! Circuit breaker for payment provider calls.
//!
//! # States
//!
//! - **Closed**: calls pass through; consecutive failures are counted.
//! - **Open**: calls are rejected without being attempted until `open_for`
//!   has elapsed.
//! - **HalfOpen**: one probe call at a time is let through; a success closes
//!   the circuit, a failure opens it again.
//!
//! Only errors the caller classifies as failures count. A provider that
//! rejects a request is answering, so that does not trip the breaker.

use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: usize,
    /// How long the circuit stays open before a probe is allowed
    pub open_for: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_for: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Calls pass through
    Closed,
    /// Calls are rejected
    Open,
    /// A probe call is in flight or allowed
    HalfOpen,
}

/// Result of a call through the breaker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, the call was not attempted
    #[error("Circuit breaker is open")]
    Open,
    /// The call was attempted and failed
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: State,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker shared by clones.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<Inner>>,
}

impl CircuitBreaker {
    /// Create a closed breaker; `name` appears in logs.
    #[must_use]
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Arc::new(Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            })),
        }
    }

    /// Current state.
    pub async fn state(&self) -> State {
        self.inner.lock().await.state
    }

    /// Run `operation` unless the circuit is open.
    ///
    /// `is_failure` decides which errors count towards opening the circuit.
    ///
    /// # Errors
    ///
    /// [`CircuitBreakerError::Open`] if the call was not attempted,
    /// [`CircuitBreakerError::Inner`] if it failed.
    pub async fn call<F, Fut, T, E, P>(
        &self,
        operation: F,
        is_failure: P,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        if !self.admit().await {
            return Err(CircuitBreakerError::Open);
        }

        let result = operation().await;
        let failed = matches!(&result, Err(err) if is_failure(err));
        self.record(failed).await;
        result.map_err(CircuitBreakerError::Inner)
    }

    async fn admit(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            State::Closed => true,
            State::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
            State::Open => {
                let elapsed = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.open_for);
                if elapsed {
                    tracing::info!(breaker = self.name, "Circuit half-open, probing");
                    inner.state = State::HalfOpen;
                    inner.probe_in_flight = true;
                }
                elapsed
            }
        }
    }

    async fn record(&self, failed: bool) {
        let mut inner = self.inner.lock().await;
        inner.probe_in_flight = false;

        if !failed {
            if inner.state != State::Closed {
                tracing::info!(breaker = self.name, "Circuit closed");
            }
            inner.state = State::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            return;
        }

        inner.consecutive_failures += 1;
        let reopen = inner.state == State::HalfOpen;
        if reopen || inner.consecutive_failures >= self.config.failure_threshold {
            if inner.state != State::Open {
                tracing::warn!(
                    breaker = self.name,
                    failures = inner.consecutive_failures,
                    "Circuit opened"
                );
            }
            inner.state = State::Open;
            inner.opened_at = Some(Instant::now());
        }
    }
}
