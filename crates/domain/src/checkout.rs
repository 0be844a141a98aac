//! Checkout sessions as provided by the checkout collaborator.

use chrono::{DateTime, Utc};
use common::{CheckoutSessionId, StockUnitKey, UserId};
use serde::{Deserialize, Serialize};

use crate::order::Money;
use crate::reservation::ReservationRequest;

/// Status of a checkout session. Only `Pending` sessions can become orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Abandoned,
}

/// One line of a checkout, priced when the shopper added it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutItem {
    pub key: StockUnitKey,
    pub unit_price: Money,
    pub quantity: u32,
}

impl CheckoutItem {
    pub fn line_total(&self) -> Money {
        self.unit_price.multiply(self.quantity)
    }
}

/// A cart snapshot undergoing the purchase flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: CheckoutSessionId,
    pub user_id: UserId,
    pub status: CheckoutStatus,
    pub expires_at: DateTime<Utc>,
    pub items: Vec<CheckoutItem>,
}

impl CheckoutSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Returns the reservation requests covering every line of the checkout.
    pub fn reservation_requests(&self) -> Vec<ReservationRequest> {
        self.items
            .iter()
            .map(|item| ReservationRequest::new(item.key, item.quantity))
            .collect()
    }
}
