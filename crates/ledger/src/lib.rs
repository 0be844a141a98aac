//! Reservation ledger.
//!
//! Grants time-bounded holds against stock unit availability and moves them
//! through `active → released | consumed | expired`. On-hand quantities are
//! read through [`StockLevels`] and never written.

pub mod error;
pub mod ledger;
pub mod stock;

pub use error::{LedgerError, Result};
pub use ledger::{AvailabilityReport, ReservationLedger};
pub use stock::{InMemoryStockLevels, StockLevels};
