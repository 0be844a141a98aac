use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{CheckoutSessionId, CompensationId, OrderId, ReservationId, StockUnitKey};
use domain::{
    CompensationStatus, CreationLock, CreationToken, LockAcquisition, LockStatus, Order,
    OrderItem, OrderStatus, PaymentStatus, PendingCompensation, Reservation, ReservationStatus,
    ShipmentLinkage,
};
use tokio::sync::RwLock;

use crate::{
    Result, StoreError,
    store::{
        CompensationQueue, OrderStore, ReservationStore, ReserveUnitOutcome, ShipmentLockStore,
    },
};

#[derive(Default)]
struct InMemoryState {
    reservations: HashMap<ReservationId, Reservation>,
    orders: HashMap<OrderId, Order>,
    order_items: HashMap<OrderId, Vec<OrderItem>>,
    locks: HashMap<OrderId, CreationLock>,
    compensations: Vec<PendingCompensation>,
}

#[derive(Default)]
struct FailureSwitches {
    order_insert: AtomicBool,
    item_insert: AtomicBool,
    finalize: AtomicBool,
    enqueue: AtomicBool,
    payment_update: AtomicBool,
}

/// In-memory store implementation for testing and local runs.
///
/// Every operation takes the single write lock for its whole duration, which
/// gives the same per-unit and per-order atomicity as the PostgreSQL store.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<InMemoryState>>,
    failures: Arc<FailureSwitches>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures order inserts to fail.
    pub fn set_fail_on_order_insert(&self, fail: bool) {
        self.failures.order_insert.store(fail, Ordering::SeqCst);
    }

    /// Configures order item inserts to fail.
    pub fn set_fail_on_item_insert(&self, fail: bool) {
        self.failures.item_insert.store(fail, Ordering::SeqCst);
    }

    /// Configures lock finalization to fail.
    pub fn set_fail_on_finalize(&self, fail: bool) {
        self.failures.finalize.store(fail, Ordering::SeqCst);
    }

    /// Configures compensation enqueues to fail.
    pub fn set_fail_on_enqueue(&self, fail: bool) {
        self.failures.enqueue.store(fail, Ordering::SeqCst);
    }

    /// Configures payment status updates to fail.
    pub fn set_fail_on_payment_update(&self, fail: bool) {
        self.failures.payment_update.store(fail, Ordering::SeqCst);
    }

    /// Inserts a reservation row as-is, bypassing the capacity check.
    pub async fn seed_reservation(&self, reservation: Reservation) {
        self.state
            .write()
            .await
            .reservations
            .insert(reservation.id, reservation);
    }

    /// Returns the number of reservations in the given status.
    pub async fn reservation_count(&self, status: ReservationStatus) -> usize {
        self.state
            .read()
            .await
            .reservations
            .values()
            .filter(|r| r.status == status)
            .count()
    }

    /// Returns the total number of stored orders.
    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }

    /// Returns every compensation record, resolved or not.
    pub async fn all_compensations(&self) -> Vec<PendingCompensation> {
        self.state.read().await.compensations.clone()
    }

    fn check(switch: &AtomicBool, operation: &str) -> Result<()> {
        if switch.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{operation} failed")));
        }
        Ok(())
    }
}

fn held_quantity(state: &InMemoryState, key: &StockUnitKey, now: DateTime<Utc>) -> u64 {
    state
        .reservations
        .values()
        .filter(|r| r.key == *key && r.is_holding(now))
        .map(|r| u64::from(r.quantity))
        .sum()
}

#[async_trait]
impl ReservationStore for InMemoryStore {
    async fn reserve_unit(
        &self,
        reservation: &Reservation,
        on_hand: u32,
        now: DateTime<Utc>,
    ) -> Result<ReserveUnitOutcome> {
        let mut state = self.state.write().await;

        let duplicate = state.reservations.values().any(|r| {
            r.key == reservation.key
                && r.checkout_session_id == reservation.checkout_session_id
                && r.status == ReservationStatus::Active
        });
        if duplicate {
            return Ok(ReserveUnitOutcome::AlreadyReserved);
        }

        let held = held_quantity(&state, &reservation.key, now);
        if held + u64::from(reservation.quantity) > u64::from(on_hand) {
            let available = u64::from(on_hand).saturating_sub(held);
            return Ok(ReserveUnitOutcome::Insufficient {
                available: u32::try_from(available).unwrap_or(u32::MAX),
            });
        }

        state
            .reservations
            .insert(reservation.id, reservation.clone());
        Ok(ReserveUnitOutcome::Inserted)
    }

    async fn reserved_quantity(&self, key: &StockUnitKey, now: DateTime<Utc>) -> Result<u32> {
        let state = self.state.read().await;
        let held = held_quantity(&state, key, now);
        u32::try_from(held).map_err(|_| StoreError::OutOfRange {
            column: "quantity",
            value: i64::try_from(held).unwrap_or(i64::MAX),
        })
    }

    async fn transition_reservations(
        &self,
        ids: &[ReservationId],
        to: ReservationStatus,
    ) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut changed = 0;
        for id in ids {
            if let Some(reservation) = state.reservations.get_mut(id)
                && reservation.status.can_transition_to(to)
            {
                reservation.status = to;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn transition_session(
        &self,
        session_id: CheckoutSessionId,
        to: ReservationStatus,
    ) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut changed = 0;
        for reservation in state.reservations.values_mut() {
            if reservation.checkout_session_id == session_id
                && reservation.status.can_transition_to(to)
            {
                reservation.status = to;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn expire_reservations(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut changed = 0;
        for reservation in state.reservations.values_mut() {
            if reservation.status == ReservationStatus::Active && reservation.expires_at <= now {
                reservation.status = ReservationStatus::Expired;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn reservations_for_session(
        &self,
        session_id: CheckoutSessionId,
    ) -> Result<Vec<Reservation>> {
        let state = self.state.read().await;
        let mut reservations: Vec<_> = state
            .reservations
            .values()
            .filter(|r| r.checkout_session_id == session_id)
            .cloned()
            .collect();
        reservations.sort_by_key(|r| r.created_at);
        Ok(reservations)
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn insert_order(&self, order: &Order) -> Result<()> {
        Self::check(&self.failures.order_insert, "order insert")?;
        let mut state = self.state.write().await;

        if state.orders.contains_key(&order.id) {
            return Err(StoreError::UniqueViolation {
                constraint: "orders_pkey".to_string(),
            });
        }
        if state
            .orders
            .values()
            .any(|o| o.checkout_session_id == order.checkout_session_id)
        {
            return Err(StoreError::UniqueViolation {
                constraint: "unique_order_per_checkout".to_string(),
            });
        }

        state.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn insert_order_items(&self, items: &[OrderItem]) -> Result<()> {
        Self::check(&self.failures.item_insert, "order item insert")?;
        let mut state = self.state.write().await;
        for item in items {
            state
                .order_items
                .entry(item.order_id)
                .or_default()
                .push(item.clone());
        }
        Ok(())
    }

    async fn delete_order(&self, order_id: OrderId) -> Result<bool> {
        let mut state = self.state.write().await;
        state.order_items.remove(&order_id);
        state.locks.remove(&order_id);
        Ok(state.orders.remove(&order_id).is_some())
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        Ok(self.state.read().await.orders.get(&order_id).cloned())
    }

    async fn order_items(&self, order_id: OrderId) -> Result<Vec<OrderItem>> {
        Ok(self
            .state
            .read()
            .await
            .order_items
            .get(&order_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_order_status(&self, order_id: OrderId, status: OrderStatus) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.orders.get_mut(&order_id) {
            Some(order) => {
                order.status = status;
                order.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_payment_status(
        &self,
        order_id: OrderId,
        status: PaymentStatus,
    ) -> Result<bool> {
        Self::check(&self.failures.payment_update, "payment status update")?;
        let mut state = self.state.write().await;
        match state.orders.get_mut(&order_id) {
            Some(order) => {
                order.payment_status = status;
                order.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl ShipmentLockStore for InMemoryStore {
    async fn acquire_creation_lock(
        &self,
        order_id: OrderId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<LockAcquisition> {
        let mut state = self.state.write().await;

        let Some(order) = state.orders.get(&order_id) else {
            return Ok(LockAcquisition::OrderMissing);
        };
        if let Some(linkage) = &order.shipment {
            return Ok(LockAcquisition::AlreadyExists(linkage.clone()));
        }
        if state.locks.get(&order_id).is_some_and(|l| l.is_held(now)) {
            return Ok(LockAcquisition::InProgress);
        }

        let token = CreationToken::new();
        state.locks.insert(
            order_id,
            CreationLock {
                order_id,
                creation_token: token,
                status: LockStatus::Locked,
                lock_acquired_at: now,
                lock_ttl: ttl,
            },
        );
        Ok(LockAcquisition::Acquired(token))
    }

    async fn finalize_creation(
        &self,
        order_id: OrderId,
        token: CreationToken,
        linkage: &ShipmentLinkage,
    ) -> Result<bool> {
        Self::check(&self.failures.finalize, "shipment finalize")?;
        let mut state = self.state.write().await;

        let owns_lock = state.locks.get(&order_id).is_some_and(|l| {
            l.creation_token == token && l.status == LockStatus::Locked
        });
        let unlinked = state
            .orders
            .get(&order_id)
            .is_some_and(|o| o.shipment.is_none());
        if !owns_lock || !unlinked {
            return Ok(false);
        }

        if let Some(order) = state.orders.get_mut(&order_id) {
            order.shipment = Some(linkage.clone());
            order.updated_at = Utc::now();
        }
        if let Some(lock) = state.locks.get_mut(&order_id) {
            lock.status = LockStatus::Done;
        }
        Ok(true)
    }

    async fn mark_creation_failed(&self, order_id: OrderId, token: CreationToken) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.locks.get_mut(&order_id) {
            Some(lock) if lock.creation_token == token && lock.status == LockStatus::Locked => {
                lock.status = LockStatus::Failed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_creation_lock(&self, order_id: OrderId) -> Result<Option<CreationLock>> {
        Ok(self.state.read().await.locks.get(&order_id).cloned())
    }

    async fn release_expired_locks(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut released = 0;
        for lock in state.locks.values_mut() {
            if lock.status == LockStatus::Locked && lock.expires_at() <= now {
                lock.status = LockStatus::Failed;
                released += 1;
            }
        }
        Ok(released)
    }
}

#[async_trait]
impl CompensationQueue for InMemoryStore {
    async fn enqueue_compensation(&self, record: &PendingCompensation) -> Result<()> {
        Self::check(&self.failures.enqueue, "compensation enqueue")?;
        self.state.write().await.compensations.push(record.clone());
        Ok(())
    }

    async fn pending_compensations(&self, limit: usize) -> Result<Vec<PendingCompensation>> {
        let state = self.state.read().await;
        let mut pending: Vec<_> = state
            .compensations
            .iter()
            .filter(|c| c.status == CompensationStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|c| c.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn resolve_compensation(&self, id: CompensationId) -> Result<bool> {
        let mut state = self.state.write().await;
        match state
            .compensations
            .iter_mut()
            .find(|c| c.id == id && c.status == CompensationStatus::Pending)
        {
            Some(record) => {
                record.status = CompensationStatus::Resolved;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_compensation_attempt(&self, id: CompensationId, error: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(record) = state.compensations.iter_mut().find(|c| c.id == id) {
            record.attempts += 1;
            record.last_error = Some(error.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{AddressId, ProductId, UserId};
    use domain::{CompensationAction, Money, PaymentMethod};

    fn key() -> StockUnitKey {
        StockUnitKey::new(ProductId::new(), 1, 2)
    }

    fn reservation(key: StockUnitKey, session: CheckoutSessionId, qty: u32) -> Reservation {
        Reservation::new_active(key, session, qty, Utc::now(), Duration::minutes(15)).unwrap()
    }

    fn order() -> Order {
        Order::new_pending(
            UserId::new(),
            CheckoutSessionId::new(),
            Money::from_cents(4000),
            PaymentMethod::Cod,
            Some(AddressId::new()),
            Utc::now(),
        )
    }

    fn linkage() -> ShipmentLinkage {
        ShipmentLinkage {
            shipment_order_id: "SR-100".to_string(),
            shipment_id: "SH-200".to_string(),
            awb_code: Some("AWB-300".to_string()),
        }
    }

    #[tokio::test]
    async fn reserve_unit_respects_on_hand() {
        let store = InMemoryStore::new();
        let key = key();
        let now = Utc::now();

        let first = reservation(key, CheckoutSessionId::new(), 3);
        assert_eq!(
            store.reserve_unit(&first, 4, now).await.unwrap(),
            ReserveUnitOutcome::Inserted
        );

        let second = reservation(key, CheckoutSessionId::new(), 2);
        assert_eq!(
            store.reserve_unit(&second, 4, now).await.unwrap(),
            ReserveUnitOutcome::Insufficient { available: 1 }
        );
        assert_eq!(store.reserved_quantity(&key, now).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn duplicate_active_reservation_is_reported() {
        let store = InMemoryStore::new();
        let key = key();
        let session = CheckoutSessionId::new();
        let now = Utc::now();

        store
            .reserve_unit(&reservation(key, session, 1), 10, now)
            .await
            .unwrap();
        let outcome = store
            .reserve_unit(&reservation(key, session, 1), 10, now)
            .await
            .unwrap();
        assert_eq!(outcome, ReserveUnitOutcome::AlreadyReserved);
    }

    #[tokio::test]
    async fn released_reservation_does_not_block_retry() {
        let store = InMemoryStore::new();
        let key = key();
        let session = CheckoutSessionId::new();
        let now = Utc::now();

        let first = reservation(key, session, 1);
        store.reserve_unit(&first, 10, now).await.unwrap();
        store
            .transition_reservations(&[first.id], ReservationStatus::Released)
            .await
            .unwrap();

        let outcome = store
            .reserve_unit(&reservation(key, session, 1), 10, now)
            .await
            .unwrap();
        assert_eq!(outcome, ReserveUnitOutcome::Inserted);
    }

    #[tokio::test]
    async fn terminal_reservations_are_never_reactivated() {
        let store = InMemoryStore::new();
        let r = reservation(key(), CheckoutSessionId::new(), 1);
        store.reserve_unit(&r, 5, Utc::now()).await.unwrap();

        let ids = [r.id];
        assert_eq!(
            store
                .transition_reservations(&ids, ReservationStatus::Consumed)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .transition_reservations(&ids, ReservationStatus::Released)
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            store
                .transition_reservations(&ids, ReservationStatus::Active)
                .await
                .unwrap(),
            0
        );
        assert_eq!(store.reservation_count(ReservationStatus::Consumed).await, 1);
    }

    #[tokio::test]
    async fn expire_only_touches_stale_active_rows() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut stale = reservation(key(), CheckoutSessionId::new(), 1);
        stale.expires_at = now - Duration::minutes(1);
        let fresh = reservation(key(), CheckoutSessionId::new(), 1);
        let mut consumed = reservation(key(), CheckoutSessionId::new(), 1);
        consumed.expires_at = now - Duration::minutes(1);
        consumed.status = ReservationStatus::Consumed;

        store.seed_reservation(stale).await;
        store.seed_reservation(fresh).await;
        store.seed_reservation(consumed).await;

        assert_eq!(store.expire_reservations(now).await.unwrap(), 1);
        assert_eq!(store.expire_reservations(now).await.unwrap(), 0);
        assert_eq!(store.reservation_count(ReservationStatus::Expired).await, 1);
        assert_eq!(store.reservation_count(ReservationStatus::Active).await, 1);
    }

    #[tokio::test]
    async fn second_order_for_checkout_is_rejected() {
        let store = InMemoryStore::new();
        let first = order();
        store.insert_order(&first).await.unwrap();

        let mut second = order();
        second.checkout_session_id = first.checkout_session_id;
        let err = store.insert_order(&second).await.unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn delete_order_removes_items() {
        let store = InMemoryStore::new();
        let order = order();
        store.insert_order(&order).await.unwrap();
        store
            .insert_order_items(&[OrderItem {
                order_id: order.id,
                key: key(),
                product_name: "Scarf".to_string(),
                quantity: 1,
                unit_price: Money::from_cents(4000),
            }])
            .await
            .unwrap();

        assert!(store.delete_order(order.id).await.unwrap());
        assert!(store.get_order(order.id).await.unwrap().is_none());
        assert!(store.order_items(order.id).await.unwrap().is_empty());
        assert!(!store.delete_order(order.id).await.unwrap());
    }

    #[tokio::test]
    async fn creation_lock_lifecycle() {
        let store = InMemoryStore::new();
        let order = order();
        store.insert_order(&order).await.unwrap();
        let now = Utc::now();
        let ttl = Duration::seconds(180);

        let LockAcquisition::Acquired(token) =
            store.acquire_creation_lock(order.id, ttl, now).await.unwrap()
        else {
            panic!("expected lock to be acquired");
        };
        assert_eq!(
            store.acquire_creation_lock(order.id, ttl, now).await.unwrap(),
            LockAcquisition::InProgress
        );

        assert!(
            store
                .finalize_creation(order.id, token, &linkage())
                .await
                .unwrap()
        );
        assert_eq!(
            store.acquire_creation_lock(order.id, ttl, now).await.unwrap(),
            LockAcquisition::AlreadyExists(linkage())
        );
        let lock = store.get_creation_lock(order.id).await.unwrap().unwrap();
        assert_eq!(lock.status, LockStatus::Done);
    }

    #[tokio::test]
    async fn stale_token_cannot_finalize() {
        let store = InMemoryStore::new();
        let order = order();
        store.insert_order(&order).await.unwrap();
        let now = Utc::now();

        let LockAcquisition::Acquired(first) = store
            .acquire_creation_lock(order.id, Duration::seconds(1), now)
            .await
            .unwrap()
        else {
            panic!("expected lock to be acquired");
        };

        // The first holder's TTL lapses and a second caller takes over.
        let later = now + Duration::seconds(2);
        let LockAcquisition::Acquired(second) = store
            .acquire_creation_lock(order.id, Duration::seconds(180), later)
            .await
            .unwrap()
        else {
            panic!("expected expired lock to be re-acquired");
        };
        assert_ne!(first, second);

        assert!(
            !store
                .finalize_creation(order.id, first, &linkage())
                .await
                .unwrap()
        );
        assert!(!store.mark_creation_failed(order.id, first).await.unwrap());
        assert!(
            store
                .finalize_creation(order.id, second, &linkage())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn failed_lock_can_be_reacquired() {
        let store = InMemoryStore::new();
        let order = order();
        store.insert_order(&order).await.unwrap();
        let now = Utc::now();
        let ttl = Duration::seconds(180);

        let LockAcquisition::Acquired(token) =
            store.acquire_creation_lock(order.id, ttl, now).await.unwrap()
        else {
            panic!("expected lock to be acquired");
        };
        assert!(store.mark_creation_failed(order.id, token).await.unwrap());
        assert!(matches!(
            store.acquire_creation_lock(order.id, ttl, now).await.unwrap(),
            LockAcquisition::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn missing_order_cannot_be_locked() {
        let store = InMemoryStore::new();
        let outcome = store
            .acquire_creation_lock(OrderId::new(), Duration::seconds(180), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, LockAcquisition::OrderMissing);
    }

    #[tokio::test]
    async fn expired_locks_are_released_by_sweep() {
        let store = InMemoryStore::new();
        let order = order();
        store.insert_order(&order).await.unwrap();
        let now = Utc::now();
        store
            .acquire_creation_lock(order.id, Duration::seconds(10), now)
            .await
            .unwrap();

        assert_eq!(store.release_expired_locks(now).await.unwrap(), 0);
        assert_eq!(
            store
                .release_expired_locks(now + Duration::seconds(10))
                .await
                .unwrap(),
            1
        );
        let lock = store.get_creation_lock(order.id).await.unwrap().unwrap();
        assert_eq!(lock.status, LockStatus::Failed);
    }

    #[tokio::test]
    async fn compensation_queue_round() {
        let store = InMemoryStore::new();
        let record = PendingCompensation::new(
            OrderId::new(),
            CompensationAction::CancelShipment {
                provider_order_id: None,
            },
            "provider timeout",
            Utc::now(),
        );
        store.enqueue_compensation(&record).await.unwrap();
        store
            .record_compensation_attempt(record.id, "still down")
            .await
            .unwrap();

        let pending = store.pending_compensations(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("still down"));

        assert!(store.resolve_compensation(record.id).await.unwrap());
        assert!(store.pending_compensations(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_switches() {
        let store = InMemoryStore::new();
        store.set_fail_on_order_insert(true);
        assert!(matches!(
            store.insert_order(&order()).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_fail_on_order_insert(false);
        assert!(store.insert_order(&order()).await.is_ok());
    }
}
