//! Order fulfillment orchestration.
//!
//! This crate drives the two workflows that cross service boundaries:
//! - [`OrderOrchestrator`] turns a checkout session into an order, holding
//!   stock through the reservation ledger and compensating every failure that
//!   happens after the hold was granted
//! - [`ShipmentSynchronizer`] creates the provider-side shipment at most once
//!   per order, guarded by a token-gated lock in the shared store
//!
//! Failed compensations are queued durably and retried by the [`Reconciler`].

pub mod compensation;
pub mod error;
pub mod order_creation;
pub mod policy;
pub mod reconciler;
pub mod services;
pub mod shipment_sync;

pub use compensation::{CompensationPlan, CompensationReport, CompensationStep, StepOutcome};
pub use error::{ErrorKind, FulfillmentError, Result, ServiceError};
pub use order_creation::{CreateOrder, OrderCreated, OrderDetails, OrderOrchestrator, PaymentOutcome};
pub use policy::{DependencyGuards, FulfillmentPolicy};
pub use reconciler::{ReconcileSummary, Reconciler};
pub use shipment_sync::{ShipmentCreation, ShipmentSynchronizer};
