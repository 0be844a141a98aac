//! Reservations: time-bounded holds against a stock unit.

use chrono::{DateTime, Duration, Utc};
use common::{CheckoutSessionId, ReservationId, StockUnitKey};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The status of a reservation.
///
/// State transitions:
/// ```text
/// Active ──┬──► Released
///          ├──► Consumed
///          └──► Expired
/// ```
/// Released, consumed and expired are terminal; a reservation is never
/// re-activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    #[default]
    Active,
    Released,
    Consumed,
    Expired,
}

impl ReservationStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Active)
    }

    /// Returns true if a reservation in this state may move to `next`.
    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        matches!(self, ReservationStatus::Active) && next.is_terminal()
    }

    /// Returns the status as stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Released => "released",
            ReservationStatus::Consumed => "consumed",
            ReservationStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ReservationStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ReservationStatus::Active),
            "released" => Ok(ReservationStatus::Released),
            "consumed" => Ok(ReservationStatus::Consumed),
            "expired" => Ok(ReservationStatus::Expired),
            other => Err(DomainError::UnknownStatus {
                kind: "reservation status",
                value: other.to_string(),
            }),
        }
    }
}

/// A request to hold `quantity` units of a stock unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub key: StockUnitKey,
    pub quantity: u32,
}

impl ReservationRequest {
    pub fn new(key: StockUnitKey, quantity: u32) -> Self {
        Self { key, quantity }
    }
}

/// A logical hold against a stock unit, owned by a checkout session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub key: StockUnitKey,
    pub checkout_session_id: CheckoutSessionId,
    pub quantity: u32,
    pub expires_at: DateTime<Utc>,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    /// Creates a new active reservation expiring `ttl` after `now`.
    pub fn new_active(
        key: StockUnitKey,
        checkout_session_id: CheckoutSessionId,
        quantity: u32,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Self, DomainError> {
        if quantity == 0 {
            return Err(DomainError::NonPositiveQuantity);
        }
        Ok(Self {
            id: ReservationId::new(),
            key,
            checkout_session_id,
            quantity,
            expires_at: now + ttl,
            status: ReservationStatus::Active,
            created_at: now,
        })
    }

    /// Returns true if this reservation currently counts against availability.
    pub fn is_holding(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Active && self.expires_at > now
    }
}
