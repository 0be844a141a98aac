use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{CheckoutSessionId, CompensationId, OrderId, ReservationId, StockUnitKey};
use domain::{
    CreationLock, CreationToken, LockAcquisition, Order, OrderItem, OrderStatus, PaymentStatus,
    PendingCompensation, Reservation, ReservationStatus, ShipmentLinkage,
};

use crate::Result;

/// Outcome of an atomic per-unit reservation insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveUnitOutcome {
    /// The row was inserted as `active`.
    Inserted,
    /// Granting the hold would exceed on-hand stock; nothing was written.
    Insufficient { available: u32 },
    /// The session already holds an active reservation for this unit.
    AlreadyReserved,
}

/// Reservation rows.
///
/// Every status transition is scoped to rows that are still `active`, so a
/// row moved to a terminal state by one caller is skipped by every other.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Atomically checks capacity for one stock unit and inserts the reservation.
    ///
    /// Capacity is `on_hand` minus the active, unexpired holds at `now`.
    /// Concurrent calls for the same unit are serialized.
    async fn reserve_unit(
        &self,
        reservation: &Reservation,
        on_hand: u32,
        now: DateTime<Utc>,
    ) -> Result<ReserveUnitOutcome>;

    /// Returns the quantity held by active, unexpired reservations for a unit.
    async fn reserved_quantity(&self, key: &StockUnitKey, now: DateTime<Utc>) -> Result<u32>;

    /// Moves the given active reservations to `to`. Returns the rows changed.
    async fn transition_reservations(
        &self,
        ids: &[ReservationId],
        to: ReservationStatus,
    ) -> Result<u64>;

    /// Moves every active reservation of a session to `to`.
    async fn transition_session(
        &self,
        session_id: CheckoutSessionId,
        to: ReservationStatus,
    ) -> Result<u64>;

    /// Marks active reservations whose `expires_at` has passed as expired.
    async fn expire_reservations(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Retrieves all reservations owned by a session, in any status.
    async fn reservations_for_session(
        &self,
        session_id: CheckoutSessionId,
    ) -> Result<Vec<Reservation>>;
}

/// Orders and their line items.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts an order. A second order for the same checkout session fails
    /// with `UniqueViolation`.
    async fn insert_order(&self, order: &Order) -> Result<()>;

    /// Inserts all items atomically: either every item is stored or none is.
    async fn insert_order_items(&self, items: &[OrderItem]) -> Result<()>;

    /// Deletes an order and its items. Returns false if it did not exist.
    async fn delete_order(&self, order_id: OrderId) -> Result<bool>;

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>>;

    async fn order_items(&self, order_id: OrderId) -> Result<Vec<OrderItem>>;

    async fn update_order_status(&self, order_id: OrderId, status: OrderStatus) -> Result<bool>;

    async fn update_payment_status(
        &self,
        order_id: OrderId,
        status: PaymentStatus,
    ) -> Result<bool>;
}

/// Shipment creation locks.
#[async_trait]
pub trait ShipmentLockStore: Send + Sync {
    /// In one atomic step: report existing linkage, report a held lock, or
    /// take the lock with a fresh token.
    async fn acquire_creation_lock(
        &self,
        order_id: OrderId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<LockAcquisition>;

    /// In one atomic step: write the linkage onto the order and mark the
    /// lock done. Returns false when the token no longer owns a `locked` lock.
    async fn finalize_creation(
        &self,
        order_id: OrderId,
        token: CreationToken,
        linkage: &ShipmentLinkage,
    ) -> Result<bool>;

    /// Marks the lock failed if `token` still owns it.
    async fn mark_creation_failed(&self, order_id: OrderId, token: CreationToken) -> Result<bool>;

    async fn get_creation_lock(&self, order_id: OrderId) -> Result<Option<CreationLock>>;

    /// Marks `locked` rows past their TTL as failed.
    async fn release_expired_locks(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Durable queue of compensations awaiting out-of-band retry.
#[async_trait]
pub trait CompensationQueue: Send + Sync {
    async fn enqueue_compensation(&self, record: &PendingCompensation) -> Result<()>;

    /// Returns up to `limit` pending records, oldest first.
    async fn pending_compensations(&self, limit: usize) -> Result<Vec<PendingCompensation>>;

    async fn resolve_compensation(&self, id: CompensationId) -> Result<bool>;

    async fn record_compensation_attempt(&self, id: CompensationId, error: &str) -> Result<()>;
}

/// Everything the ledger and the orchestrators need from the store.
pub trait FulfillmentStore:
    ReservationStore + OrderStore + ShipmentLockStore + CompensationQueue + Clone + 'static
{
}

// Blanket implementation for every store providing all four capabilities
impl<T> FulfillmentStore for T where
    T: ReservationStore + OrderStore + ShipmentLockStore + CompensationQueue + Clone + 'static
{
}
