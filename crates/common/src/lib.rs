//! Shared identifier types used across the ledger and fulfillment crates.

pub mod types;

pub use types::{
    AddressId, CheckoutSessionId, CompensationId, OrderId, ProductId, ReservationId,
    StockUnitKey, UserId,
};
