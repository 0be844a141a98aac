//! External collaborators consumed by the orchestrators.
//!
//! Each collaborator is a trait so the orchestrators can run against the
//! in-memory doubles in tests and against real services in production.

pub mod catalog;
pub mod checkout;
pub mod http_shipping;
pub mod payment;
pub mod shipping;

pub use catalog::{CatalogEntry, CatalogService, CatalogStockLevels, InMemoryCatalog};
pub use checkout::{CheckoutService, InMemoryCheckoutService};
pub use http_shipping::{HttpShipmentConfig, HttpShipmentProvider};
pub use payment::{InMemoryPaymentGateway, PaymentGateway, PaymentSession, RecordedRefund};
pub use shipping::{
    InMemoryShipmentProvider, ShipmentLine, ShipmentProvider, ShipmentRequest, TrackingEvent,
    TrackingInfo,
};
