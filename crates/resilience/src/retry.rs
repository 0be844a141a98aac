//! Retry with exponential backoff.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreaker;

/// Classifies a failure as worth retrying or not.
///
/// Network errors, timeouts, rate limiting and 5xx responses are retryable;
/// validation failures and other 4xx responses are not.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Backoff configuration for retried operations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Returns a copy of this policy with a different attempt budget.
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self.clone()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based):
    /// `min(base * multiplier^(attempt - 1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.powi(exponent);
        let delay = self.base_delay.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay.max(0.0))
        }
    }
}

/// Errors returned by [`Retrier::execute`].
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    #[error("Operation failed after {attempts} attempts: {error}")]
    Exhausted { attempts: u32, error: E },

    /// An attempt failed with an error that must not be retried.
    #[error("Operation failed: {error}")]
    NonRetryable { attempt: u32, error: E },

    /// The circuit breaker rejected the call before the dependency was reached.
    #[error("Circuit breaker '{breaker}' is open")]
    CircuitOpen { breaker: String },
}

impl<E> RetryError<E> {
    /// Returns the last error reported by the operation, if it ran at all.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted { error, .. } | RetryError::NonRetryable { error, .. } => {
                Some(error)
            }
            RetryError::CircuitOpen { .. } => None,
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::Exhausted { error, .. } | RetryError::NonRetryable { error, .. } => {
                Some(error)
            }
            RetryError::CircuitOpen { .. } => None,
        }
    }
}

/// Executes fallible operations with backoff, optionally behind a circuit breaker.
///
/// In-flight attempt numbers are tracked per operation id on this instance,
/// so concurrent distinct operations never share backoff state.
#[derive(Debug)]
pub struct Retrier {
    policy: RetryPolicy,
    breaker: Option<Arc<CircuitBreaker>>,
    in_flight: Mutex<HashMap<String, u32>>,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            breaker: None,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Routes every attempt through `breaker`.
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// Returns the attempt currently running for `operation_id`, if any.
    pub fn current_attempt(&self, operation_id: &str) -> Option<u32> {
        self.attempts().get(operation_id).copied()
    }

    /// Runs `operation` with the default policy.
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation_id: &str,
        operation: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let policy = self.policy.clone();
        self.execute_with_policy(operation_id, &policy, operation)
            .await
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or `policy.max_attempts` is exhausted.
    pub async fn execute_with_policy<T, E, F, Fut>(
        &self,
        operation_id: &str,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _tracking = AttemptTracking {
            retrier: self,
            operation_id,
        };
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            if let Some(breaker) = &self.breaker
                && !breaker.try_acquire()
            {
                debug!(operation_id, breaker = breaker.name(), "Rejected by open circuit");
                return Err(RetryError::CircuitOpen {
                    breaker: breaker.name().to_string(),
                });
            }

            self.attempts().insert(operation_id.to_string(), attempt);
            metrics::counter!("retry_attempts_total").increment(1);

            match operation().await {
                Ok(value) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success();
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => {
                    // The dependency answered; only transient failures count against it.
                    if let Some(breaker) = &self.breaker {
                        breaker.record_success();
                    }
                    debug!(operation_id, attempt, error = %e, "Non-retryable failure");
                    return Err(RetryError::NonRetryable { attempt, error: e });
                }
                Err(e) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.record_failure();
                    }
                    if attempt >= max_attempts {
                        warn!(operation_id, attempt, error = %e, "Retries exhausted");
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            error: e,
                        });
                    }

                    let delay = policy.delay_for_attempt(attempt);
                    debug!(operation_id, attempt, ?delay, error = %e, "Retrying after failure");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn attempts(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Retrier {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

struct AttemptTracking<'a> {
    retrier: &'a Retrier,
    operation_id: &'a str,
}

impl Drop for AttemptTracking<'_> {
    fn drop(&mut self) {
        self.retrier.attempts().remove(self.operation_id);
    }
}
