//! Durable records for compensations that could not complete synchronously.

use chrono::{DateTime, Utc};
use common::{CompensationId, OrderId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::order::Money;

/// The side effect a queued record still has to undo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompensationAction {
    /// Cancel the provider-side order record.
    CancelShipment {
        /// Provider order id when known, otherwise the local order id is used
        /// as the channel reference.
        provider_order_id: Option<String>,
    },
    /// Refund a captured payment.
    RefundPayment { amount: Money },
}

impl CompensationAction {
    pub fn kind(&self) -> &'static str {
        match self {
            CompensationAction::CancelShipment { .. } => "cancel_shipment",
            CompensationAction::RefundPayment { .. } => "refund_payment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    Pending,
    Resolved,
}

impl CompensationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompensationStatus::Pending => "pending",
            CompensationStatus::Resolved => "resolved",
        }
    }
}

impl std::str::FromStr for CompensationStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CompensationStatus::Pending),
            "resolved" => Ok(CompensationStatus::Resolved),
            other => Err(DomainError::UnknownStatus {
                kind: "compensation status",
                value: other.to_string(),
            }),
        }
    }
}

/// A compensation waiting for out-of-band retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCompensation {
    pub id: CompensationId,
    pub order_id: OrderId,
    pub action: CompensationAction,
    pub reason: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub status: CompensationStatus,
    pub created_at: DateTime<Utc>,
}

impl PendingCompensation {
    pub fn new(
        order_id: OrderId,
        action: CompensationAction,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CompensationId::new(),
            order_id,
            action,
            reason: reason.into(),
            attempts: 0,
            last_error: None,
            status: CompensationStatus::Pending,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_is_pending() {
        let record = PendingCompensation::new(
            OrderId::new(),
            CompensationAction::RefundPayment {
                amount: Money::from_cents(1200),
            },
            "shipment creation failed",
            Utc::now(),
        );
        assert_eq!(record.status, CompensationStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.action.kind(), "refund_payment");
    }

    #[test]
    fn action_serializes_with_kind_tag() {
        let action = CompensationAction::CancelShipment {
            provider_order_id: Some("SR-1".to_string()),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["kind"], "cancel_shipment");
        assert_eq!(json["provider_order_id"], "SR-1");
    }
}
