//! Domain layer for the reservation ledger and fulfillment orchestrator.
//!
//! This crate provides the data model shared by the store, the ledger and
//! the orchestrators:
//! - Reservations and their `active → released | consumed | expired` lifecycle
//! - Orders, order items, payment method and payment status
//! - Checkout sessions as read from the checkout collaborator
//! - Shipment creation locks and the provider linkage they guard
//! - Durable compensation records for out-of-band reconciliation

pub mod checkout;
pub mod compensation;
pub mod error;
pub mod order;
pub mod reservation;
pub mod shipment;

pub use checkout::{CheckoutItem, CheckoutSession, CheckoutStatus};
pub use compensation::{CompensationAction, CompensationStatus, PendingCompensation};
pub use error::DomainError;
pub use order::{Money, Order, OrderItem, OrderStatus, PaymentMethod, PaymentStatus};
pub use reservation::{Reservation, ReservationRequest, ReservationStatus};
pub use shipment::{CreationLock, CreationToken, LockAcquisition, LockStatus, ShipmentLinkage};
