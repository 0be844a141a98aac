//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container and need a Docker daemon.
//! Run with:
//!
//! ```bash
//! cargo test -p store --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{AddressId, CheckoutSessionId, OrderId, ProductId, StockUnitKey, UserId};
use domain::{
    CompensationAction, LockAcquisition, LockStatus, Money, Order, OrderItem, OrderStatus,
    PaymentMethod, PaymentStatus, PendingCompensation, Reservation, ReservationStatus,
    ShipmentLinkage,
};
use store::{
    CompensationQueue, OrderStore, PostgresStore, ReservationStore, ReserveUnitOutcome,
    ShipmentLockStore,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let store = PostgresStore::new(
                sqlx::PgPool::connect(&connection_string).await.unwrap(),
            );
            store.run_migrations().await.unwrap();
            store.pool().close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE stock_reservations, pending_compensations, shipment_creation_locks, order_items, orders",
    )
    .execute(&pool)
    .await
    .unwrap();

    PostgresStore::new(pool)
}

fn key() -> StockUnitKey {
    StockUnitKey::new(ProductId::new(), 3, 7)
}

fn reservation(key: StockUnitKey, session: CheckoutSessionId, qty: u32) -> Reservation {
    Reservation::new_active(key, session, qty, Utc::now(), Duration::minutes(15)).unwrap()
}

fn order() -> Order {
    Order::new_pending(
        UserId::new(),
        CheckoutSessionId::new(),
        Money::from_cents(129_900),
        PaymentMethod::Card,
        Some(AddressId::new()),
        Utc::now(),
    )
}

fn linkage() -> ShipmentLinkage {
    ShipmentLinkage {
        shipment_order_id: "SR-1".to_string(),
        shipment_id: "SH-1".to_string(),
        awb_code: None,
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_reserve_unit_capacity() {
    let store = get_test_store().await;
    let key = key();
    let now = Utc::now();

    let first = reservation(key, CheckoutSessionId::new(), 4);
    assert_eq!(
        store.reserve_unit(&first, 5, now).await.unwrap(),
        ReserveUnitOutcome::Inserted
    );

    let second = reservation(key, CheckoutSessionId::new(), 2);
    assert_eq!(
        store.reserve_unit(&second, 5, now).await.unwrap(),
        ReserveUnitOutcome::Insufficient { available: 1 }
    );
    assert_eq!(store.reserved_quantity(&key, now).await.unwrap(), 4);

    let stored = store
        .reservations_for_session(first.checkout_session_id)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].quantity, 4);
    assert_eq!(stored[0].status, ReservationStatus::Active);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_concurrent_reservations_never_oversell() {
    let store = get_test_store().await;
    let key = key();
    let now = Utc::now();

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                let r = reservation(key, CheckoutSessionId::new(), 1);
                store.reserve_unit(&r, 3, now).await.unwrap()
            })
        })
        .collect();

    let outcomes = futures_util::future::join_all(handles).await;
    let inserted = outcomes
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|o| *o == ReserveUnitOutcome::Inserted)
        .count();

    assert_eq!(inserted, 3);
    assert_eq!(store.reserved_quantity(&key, now).await.unwrap(), 3);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_duplicate_active_reservation() {
    let store = get_test_store().await;
    let key = key();
    let session = CheckoutSessionId::new();
    let now = Utc::now();

    let first = reservation(key, session, 1);
    store.reserve_unit(&first, 10, now).await.unwrap();
    assert_eq!(
        store
            .reserve_unit(&reservation(key, session, 1), 10, now)
            .await
            .unwrap(),
        ReserveUnitOutcome::AlreadyReserved
    );

    // Once released, the same session may reserve again.
    store
        .transition_session(session, ReservationStatus::Released)
        .await
        .unwrap();
    assert_eq!(
        store
            .reserve_unit(&reservation(key, session, 1), 10, now)
            .await
            .unwrap(),
        ReserveUnitOutcome::Inserted
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_transitions_only_touch_active_rows() {
    let store = get_test_store().await;
    let now = Utc::now();
    let session = CheckoutSessionId::new();
    let r = reservation(key(), session, 2);
    store.reserve_unit(&r, 10, now).await.unwrap();

    assert_eq!(
        store
            .transition_reservations(&[r.id], ReservationStatus::Consumed)
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        store
            .transition_reservations(&[r.id], ReservationStatus::Released)
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        store
            .transition_session(session, ReservationStatus::Expired)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_expire_reservations() {
    let store = get_test_store().await;
    let key = key();
    let now = Utc::now();
    let r = reservation(key, CheckoutSessionId::new(), 2);
    store.reserve_unit(&r, 10, now).await.unwrap();

    let later = r.expires_at + Duration::seconds(1);
    assert_eq!(store.reserved_quantity(&key, later).await.unwrap(), 0);
    assert_eq!(store.expire_reservations(later).await.unwrap(), 1);
    assert_eq!(store.expire_reservations(later).await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_order_round_trip() {
    let store = get_test_store().await;
    let order = order();
    store.insert_order(&order).await.unwrap();

    let items = vec![OrderItem {
        order_id: order.id,
        key: key(),
        product_name: "Wool coat".to_string(),
        quantity: 1,
        unit_price: Money::from_cents(129_900),
    }];
    store.insert_order_items(&items).await.unwrap();

    let loaded = store.get_order(order.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, order.id);
    assert_eq!(loaded.payment_method, PaymentMethod::Card);
    assert_eq!(loaded.status, OrderStatus::Pending);
    assert_eq!(loaded.shipment, None);
    assert_eq!(store.order_items(order.id).await.unwrap(), items);

    assert!(
        store
            .update_payment_status(order.id, PaymentStatus::Paid)
            .await
            .unwrap()
    );
    assert!(
        store
            .update_order_status(order.id, OrderStatus::Processing)
            .await
            .unwrap()
    );
    let loaded = store.get_order(order.id).await.unwrap().unwrap();
    assert_eq!(loaded.payment_status, PaymentStatus::Paid);
    assert_eq!(loaded.status, OrderStatus::Processing);

    assert!(store.delete_order(order.id).await.unwrap());
    assert!(store.order_items(order.id).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_one_order_per_checkout() {
    let store = get_test_store().await;
    let first = order();
    store.insert_order(&first).await.unwrap();

    let mut second = order();
    second.checkout_session_id = first.checkout_session_id;
    let err = store.insert_order(&second).await.unwrap_err();
    assert!(err.is_unique_violation());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_creation_lock_functions() {
    let store = get_test_store().await;
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
    assert!(
        !store
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
#[ignore = "requires Docker"]
async fn test_concurrent_lock_acquisition_single_winner() {
    let store = get_test_store().await;
    let order = order();
    store.insert_order(&order).await.unwrap();
    let now = Utc::now();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .acquire_creation_lock(order.id, Duration::seconds(180), now)
                    .await
                    .unwrap()
            })
        })
        .collect();

    let acquired = futures_util::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|o| matches!(o, LockAcquisition::Acquired(_)))
        .count();
    assert_eq!(acquired, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_expired_lock_release_and_missing_order() {
    let store = get_test_store().await;
    let order = order();
    store.insert_order(&order).await.unwrap();
    let now = Utc::now();

    store
        .acquire_creation_lock(order.id, Duration::seconds(5), now)
        .await
        .unwrap();
    assert_eq!(
        store
            .release_expired_locks(now + Duration::seconds(6))
            .await
            .unwrap(),
        1
    );
    assert!(matches!(
        store
            .acquire_creation_lock(order.id, Duration::seconds(5), now)
            .await
            .unwrap(),
        LockAcquisition::Acquired(_)
    ));

    assert_eq!(
        store
            .acquire_creation_lock(OrderId::new(), Duration::seconds(5), now)
            .await
            .unwrap(),
        LockAcquisition::OrderMissing
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_compensation_queue() {
    let store = get_test_store().await;
    let record = PendingCompensation::new(
        OrderId::new(),
        CompensationAction::RefundPayment {
            amount: Money::from_cents(5_000),
        },
        "gateway timeout",
        Utc::now(),
    );
    store.enqueue_compensation(&record).await.unwrap();
    store
        .record_compensation_attempt(record.id, "still failing")
        .await
        .unwrap();

    let pending = store.pending_compensations(5).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action, record.action);
    assert_eq!(pending[0].attempts, 1);

    assert!(store.resolve_compensation(record.id).await.unwrap());
    assert!(!store.resolve_compensation(record.id).await.unwrap());
    assert!(store.pending_compensations(5).await.unwrap().is_empty());
}
