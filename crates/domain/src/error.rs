//! Domain error types.

use thiserror::Error;

/// Errors raised when a value cannot be represented in the domain model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// A status column held a value outside the known set.
    #[error("Unknown {kind} value: {value}")]
    UnknownStatus { kind: &'static str, value: String },

    /// The payment method is not in the allowed set.
    #[error("Unsupported payment method: {0}")]
    UnsupportedPaymentMethod(String),

    /// A reservation quantity was zero.
    #[error("Quantity must be positive")]
    NonPositiveQuantity,
}
