use std::sync::Arc;

use chrono::Duration;
use resilience::{CircuitBreaker, CircuitBreakerConfig, Retrier, RetryPolicy};

/// Tunables shared by the order and shipment orchestrators.
#[derive(Debug, Clone)]
pub struct FulfillmentPolicy {
    /// Hold window for reservations made during order creation.
    pub reservation_ttl: Duration,
    /// How long a shipment creation lock is honored before it may be retaken.
    pub shipment_lock_ttl: Duration,
    /// Attempts at opening a payment session before giving up.
    pub payment_max_attempts: u32,
    /// Backoff for every collaborator call.
    pub retry: RetryPolicy,
}

impl Default for FulfillmentPolicy {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::minutes(15),
            shipment_lock_ttl: Duration::seconds(180),
            payment_max_attempts: 3,
            retry: RetryPolicy::default(),
        }
    }
}

impl FulfillmentPolicy {
    pub fn payment_retry(&self) -> RetryPolicy {
        self.retry.with_max_attempts(self.payment_max_attempts)
    }
}

/// One retrier per remote dependency, each behind its own circuit breaker.
///
/// Share a single instance between every component that calls the same
/// dependency so they trip and recover together.
#[derive(Debug, Clone)]
pub struct DependencyGuards {
    pub payment: Arc<Retrier>,
    pub shipment: Arc<Retrier>,
}

impl DependencyGuards {
    pub fn new(retry: RetryPolicy, breaker: CircuitBreakerConfig) -> Self {
        let guarded = |name: &str| {
            Arc::new(
                Retrier::new(retry.clone())
                    .with_circuit_breaker(Arc::new(CircuitBreaker::new(name, breaker.clone()))),
            )
        };
        Self {
            payment: guarded("payment_gateway"),
            shipment: guarded("shipment_provider"),
        }
    }
}

impl Default for DependencyGuards {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), CircuitBreakerConfig::default())
    }
}
