//! Reservation ledger scenarios against the in-memory store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{CheckoutSessionId, ProductId, StockUnitKey};
use domain::{Reservation, ReservationRequest, ReservationStatus};
use ledger::{InMemoryStockLevels, LedgerError, ReservationLedger};
use proptest::prelude::*;
use store::InMemoryStore;

type TestLedger = ReservationLedger<InMemoryStore, InMemoryStockLevels>;

fn setup(on_hand: u32) -> (Arc<TestLedger>, InMemoryStore, StockUnitKey) {
    let store = InMemoryStore::new();
    let stock = InMemoryStockLevels::new();
    let key = StockUnitKey::new(ProductId::new(), 10, 42);
    stock.set_on_hand(key, on_hand);
    (
        Arc::new(ReservationLedger::new(store.clone(), stock)),
        store,
        key,
    )
}

async fn available(ledger: &TestLedger, key: StockUnitKey) -> u32 {
    ledger
        .check_availability(&[ReservationRequest::new(key, 1)])
        .await
        .unwrap()[0]
        .available
}

#[tokio::test]
async fn test_happy_path_reserve_then_consume() {
    let (ledger, store, key) = setup(5);
    let session = CheckoutSessionId::new();

    ledger
        .reserve(
            &[ReservationRequest::new(key, 2)],
            session,
            Duration::minutes(15),
        )
        .await
        .unwrap();
    assert_eq!(available(&ledger, key).await, 3);

    assert_eq!(ledger.consume(session).await.unwrap(), 1);

    // The on-hand decrement happens elsewhere; consumed rows no longer hold.
    assert_eq!(available(&ledger, key).await, 5);
    assert_eq!(store.reservation_count(ReservationStatus::Consumed).await, 1);
    assert_eq!(store.reservation_count(ReservationStatus::Active).await, 0);
}

#[tokio::test]
async fn test_contested_last_unit() {
    let (ledger, _store, key) = setup(1);

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .reserve(
                        &[ReservationRequest::new(key, 1)],
                        CheckoutSessionId::new(),
                        Duration::minutes(15),
                    )
                    .await
            })
        })
        .collect();

    let results: Vec<_> = futures_util::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1);
    let conflict = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(matches!(conflict, LedgerError::InsufficientStock(_)));
    assert!(conflict.is_conflict());
}

#[tokio::test]
async fn test_many_concurrent_reservations_never_oversell() {
    let (ledger, store, key) = setup(7);

    let handles: Vec<_> = (0..25)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .reserve(
                        &[ReservationRequest::new(key, 1)],
                        CheckoutSessionId::new(),
                        Duration::minutes(15),
                    )
                    .await
                    .is_ok()
            })
        })
        .collect();

    let granted = futures_util::future::join_all(handles)
        .await
        .into_iter()
        .filter(|r| *r.as_ref().unwrap())
        .count();

    assert_eq!(granted, 7);
    assert_eq!(store.reservation_count(ReservationStatus::Active).await, 7);
    assert_eq!(available(&ledger, key).await, 0);
}

#[tokio::test]
async fn test_expired_hold_is_ignored_before_sweep() {
    let (ledger, store, key) = setup(3);
    let now = Utc::now();
    let stale = Reservation::new_active(
        key,
        CheckoutSessionId::new(),
        3,
        now - Duration::minutes(30),
        Duration::minutes(15),
    )
    .unwrap();
    store.seed_reservation(stale).await;

    // Not swept yet, but the stale hold no longer counts.
    assert_eq!(available(&ledger, key).await, 3);
    ledger
        .reserve(
            &[ReservationRequest::new(key, 3)],
            CheckoutSessionId::new(),
            Duration::minutes(15),
        )
        .await
        .unwrap();

    assert_eq!(ledger.sweep_expired().await.unwrap(), 1);
    assert_eq!(ledger.sweep_expired().await.unwrap(), 0);
    assert_eq!(store.reservation_count(ReservationStatus::Expired).await, 1);
    assert_eq!(store.reservation_count(ReservationStatus::Active).await, 1);
}

#[tokio::test]
async fn test_sweep_skips_rows_already_terminal() {
    let (ledger, store, key) = setup(3);
    let session = CheckoutSessionId::new();
    let mut consumed = Reservation::new_active(
        key,
        session,
        1,
        Utc::now() - Duration::minutes(30),
        Duration::minutes(15),
    )
    .unwrap();
    consumed.status = ReservationStatus::Consumed;
    store.seed_reservation(consumed).await;

    assert_eq!(ledger.sweep_expired().await.unwrap(), 0);
    assert_eq!(store.reservation_count(ReservationStatus::Consumed).await, 1);
}

#[tokio::test]
async fn test_release_by_session_frees_capacity() {
    let (ledger, _store, key) = setup(4);
    let session = CheckoutSessionId::new();

    ledger
        .reserve(
            &[ReservationRequest::new(key, 4)],
            session,
            Duration::minutes(15),
        )
        .await
        .unwrap();
    assert_eq!(available(&ledger, key).await, 0);

    assert_eq!(ledger.release_by_session(session).await.unwrap(), 1);
    assert_eq!(available(&ledger, key).await, 4);

    // Releasing again is a no-op.
    assert_eq!(ledger.release_by_session(session).await.unwrap(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_active_holds_never_exceed_on_hand(
        on_hand in 0u32..20,
        requests in proptest::collection::vec(1u32..6, 1..15),
    ) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let (ledger, _store, key) = setup(on_hand);

            let handles: Vec<_> = requests
                .iter()
                .map(|&quantity| {
                    let ledger = ledger.clone();
                    tokio::spawn(async move {
                        ledger
                            .reserve(
                                &[ReservationRequest::new(key, quantity)],
                                CheckoutSessionId::new(),
                                Duration::minutes(15),
                            )
                            .await
                            .map(|reserved| reserved[0].quantity)
                            .unwrap_or(0)
                    })
                })
                .collect();

            let granted: u32 = futures_util::future::join_all(handles)
                .await
                .into_iter()
                .map(|r| r.unwrap())
                .sum();

            prop_assert!(granted <= on_hand);
            prop_assert_eq!(available(&ledger, key).await, on_hand - granted);
            Ok(())
        })?;
    }
}
