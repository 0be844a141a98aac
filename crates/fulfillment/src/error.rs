//! Fulfillment error types.

use common::{OrderId, StockUnitKey};
use domain::{OrderStatus, PaymentStatus};
use ledger::LedgerError;
use resilience::{RetryError, Retryable};
use serde::Serialize;
use store::StoreError;
use thiserror::Error;

/// Failure reported by an external collaborator (checkout, catalog,
/// payment gateway, shipment provider).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The call did not complete in time.
    #[error("Request timed out")]
    Timeout,

    /// The connection failed before a response was received.
    #[error("Network error: {0}")]
    Network(String),

    /// The collaborator asked us to slow down (HTTP 429).
    #[error("Rate limited")]
    RateLimited,

    /// The collaborator rejected the request (4xx).
    #[error("Rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The collaborator failed internally (5xx).
    #[error("Upstream error {status}: {message}")]
    Upstream { status: u16, message: String },

    /// The response could not be understood.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ServiceError {
    /// Classifies a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => ServiceError::RateLimited,
            500..=599 => ServiceError::Upstream { status, message },
            _ => ServiceError::Rejected { status, message },
        }
    }
}

impl Retryable for ServiceError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Timeout
                | ServiceError::Network(_)
                | ServiceError::RateLimited
                | ServiceError::Upstream { .. }
        )
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ServiceError::Timeout
        } else if e.is_decode() {
            ServiceError::InvalidResponse(e.to_string())
        } else if let Some(status) = e.status() {
            ServiceError::from_status(status.as_u16(), e.to_string())
        } else {
            ServiceError::Network(e.to_string())
        }
    }
}

/// Stable failure category surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input; never retried.
    Validation,
    /// Referenced entity missing or in the wrong state; never retried.
    NotFound,
    /// Concurrent claim on the same resource; the caller may re-submit.
    Conflict,
    /// Network, timeout or 5xx from a dependency.
    TransientDependency,
    /// Unexpected persistence failure.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::TransientDependency => "transient_dependency",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors returned by the orchestrators.
#[derive(Debug, Error)]
pub enum FulfillmentError {
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Never existed, owned by someone else, or already consumed by a
    /// concurrent request. All three read the same to the caller.
    #[error("Checkout session not found or already processed")]
    CheckoutNotFound,

    #[error("Checkout session has expired")]
    CheckoutExpired,

    #[error("Checkout session has no items")]
    EmptyCheckout,

    #[error("Product {key} is no longer available")]
    ProductInactive { key: StockUnitKey },

    #[error("Only {available} left in stock for {key}, {requested} requested")]
    StockChanged {
        key: StockUnitKey,
        requested: u32,
        available: u32,
    },

    #[error("An order already exists for this checkout session")]
    DuplicateOrder,

    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    #[error("Order {order_id} is not ready to ship: {reason}")]
    OrderNotReady { order_id: OrderId, reason: String },

    #[error("Payment for order {order_id} cannot be retried while {status}")]
    PaymentNotRetryable {
        order_id: OrderId,
        status: PaymentStatus,
    },

    #[error("Order {order_id} cannot be changed while {status}")]
    InvalidOrderState {
        order_id: OrderId,
        status: OrderStatus,
    },

    #[error("No shipment has been created for order {0}")]
    ShipmentNotCreated(OrderId),

    /// The creation lock changed hands before the shipment could be recorded.
    #[error("Shipment creation lock for order {0} was lost")]
    LockLost(OrderId),

    #[error("{service} is temporarily unavailable")]
    CircuitOpen { service: &'static str },

    #[error("{service} call failed: {source}")]
    Dependency {
        service: &'static str,
        #[source]
        source: ServiceError,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl FulfillmentError {
    /// Wraps a retried collaborator failure.
    pub fn from_retry(service: &'static str, error: RetryError<ServiceError>) -> Self {
        match error.into_last_error() {
            Some(source) => FulfillmentError::Dependency { service, source },
            None => FulfillmentError::CircuitOpen { service },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FulfillmentError::Validation(_) => ErrorKind::Validation,
            FulfillmentError::CheckoutNotFound
            | FulfillmentError::CheckoutExpired
            | FulfillmentError::EmptyCheckout
            | FulfillmentError::OrderNotFound(_)
            | FulfillmentError::OrderNotReady { .. }
            | FulfillmentError::PaymentNotRetryable { .. }
            | FulfillmentError::InvalidOrderState { .. }
            | FulfillmentError::ShipmentNotCreated(_) => ErrorKind::NotFound,
            FulfillmentError::ProductInactive { .. }
            | FulfillmentError::StockChanged { .. }
            | FulfillmentError::DuplicateOrder
            | FulfillmentError::LockLost(_) => ErrorKind::Conflict,
            FulfillmentError::CircuitOpen { .. } => ErrorKind::TransientDependency,
            FulfillmentError::Dependency { source, .. } => {
                if source.is_retryable() {
                    ErrorKind::TransientDependency
                } else {
                    ErrorKind::Internal
                }
            }
            FulfillmentError::Ledger(e) => match e {
                LedgerError::Validation(_) => ErrorKind::Validation,
                LedgerError::InsufficientStock(_) | LedgerError::AlreadyReserved { .. } => {
                    ErrorKind::Conflict
                }
                LedgerError::StockLookup(_) => ErrorKind::TransientDependency,
                LedgerError::Store(_) => ErrorKind::Internal,
            },
            FulfillmentError::Store(_) => ErrorKind::Internal,
        }
    }
}

/// Convenience type alias for fulfillment results.
pub type Result<T> = std::result::Result<T, FulfillmentError>;
