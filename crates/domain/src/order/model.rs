//! Order rows and their line items.

use chrono::{DateTime, Utc};
use common::{AddressId, CheckoutSessionId, OrderId, StockUnitKey, UserId};
use serde::{Deserialize, Serialize};

use super::{Money, OrderStatus, PaymentMethod, PaymentStatus};
use crate::shipment::ShipmentLinkage;

/// An order created from exactly one checkout session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub checkout_session_id: CheckoutSessionId,
    pub total_amount: Money,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub shipping_address_id: Option<AddressId>,
    /// Provider identifiers, written once by the shipment creation lock.
    pub shipment: Option<ShipmentLinkage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Creates a new `pending/unpaid` order.
    pub fn new_pending(
        user_id: UserId,
        checkout_session_id: CheckoutSessionId,
        total_amount: Money,
        payment_method: PaymentMethod,
        shipping_address_id: Option<AddressId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OrderId::new(),
            user_id,
            checkout_session_id,
            total_amount,
            status: OrderStatus::Pending,
            payment_method,
            payment_status: PaymentStatus::Unpaid,
            shipping_address_id,
            shipment: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the order may be handed to the shipment provider.
    ///
    /// Pay-on-delivery orders ship straight away; online orders must be paid.
    pub fn is_ready_to_ship(&self) -> bool {
        self.status != OrderStatus::Cancelled
            && self.shipping_address_id.is_some()
            && (!self.payment_method.is_online() || self.payment_status == PaymentStatus::Paid)
    }
}

/// A price/name snapshot of a checkout line, immune to later catalog changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub order_id: OrderId,
    pub key: StockUnitKey,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: Money,
}

impl OrderItem {
    /// Returns the total price for this item (quantity * unit_price).
    pub fn total_price(&self) -> Money {
        self.unit_price.multiply(self.quantity)
    }
}
