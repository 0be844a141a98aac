//! Resilience primitives for calls to external collaborators.
//!
//! - [`Retrier`] re-executes a fallible operation with exponential backoff,
//!   stopping early for errors classified as non-retryable.
//! - [`CircuitBreaker`] sheds load from a degraded dependency after repeated
//!   failures and lets a single trial call through after a cooldown.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::{Retrier, RetryError, RetryPolicy, Retryable};
