use common::StockUnitKey;
use store::StoreError;
use thiserror::Error;

use crate::AvailabilityReport;

/// Errors returned by the reservation ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The request was malformed and was not attempted.
    #[error("Invalid reservation request: {0}")]
    Validation(String),

    /// At least one item cannot be covered by current availability.
    /// Holds one report per short item.
    #[error("Insufficient stock for {} item(s)", .0.len())]
    InsufficientStock(Vec<AvailabilityReport>),

    /// The checkout session already holds an active reservation for the unit.
    #[error("Stock unit {key} is already reserved by this checkout")]
    AlreadyReserved { key: StockUnitKey },

    /// On-hand stock could not be read from the catalog.
    #[error("Stock lookup failed: {0}")]
    StockLookup(String),

    /// The backing store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// Returns true for concurrent-claim outcomes (insufficient stock, already reserved).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            LedgerError::InsufficientStock(_) | LedgerError::AlreadyReserved { .. }
        )
    }
}

/// Convenience type alias for ledger results.
pub type Result<T> = std::result::Result<T, LedgerError>;
