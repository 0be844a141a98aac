use std::collections::HashSet;

use chrono::{Duration, Utc};
use common::{CheckoutSessionId, ReservationId, StockUnitKey};
use domain::{DomainError, Reservation, ReservationRequest, ReservationStatus};
use serde::{Deserialize, Serialize};
use store::{ReservationStore, ReserveUnitOutcome};
use tracing::{debug, error, info, warn};

use crate::{LedgerError, Result, StockLevels};

/// Per-item result of an availability check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityReport {
    pub key: StockUnitKey,
    pub requested: u32,
    /// On-hand quantity minus active, unexpired holds.
    pub available: u32,
    pub sufficient: bool,
}

impl AvailabilityReport {
    fn new(key: StockUnitKey, requested: u32, available: u32) -> Self {
        Self {
            key,
            requested,
            available,
            sufficient: available >= requested,
        }
    }
}

/// Time-bounded holds against stock unit availability.
///
/// For every stock unit, the quantity held by active, unexpired reservations
/// never exceeds the on-hand quantity at the moment a hold is granted. Each
/// unit is reserved through the store's atomic capacity check, so concurrent
/// callers racing for the last units cannot both succeed.
pub struct ReservationLedger<S, K> {
    store: S,
    stock: K,
}

impl<S, K> ReservationLedger<S, K>
where
    S: ReservationStore,
    K: StockLevels,
{
    pub fn new(store: S, stock: K) -> Self {
        Self { store, stock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Reserves every item for `session_id` for `ttl`, or nothing at all.
    ///
    /// All items are checked first so the caller gets a diagnostic for every
    /// short item. Each unit is then claimed atomically; if any claim fails,
    /// the claims already made in this call are released before returning.
    #[tracing::instrument(skip(self, items), fields(items = items.len()))]
    pub async fn reserve(
        &self,
        items: &[ReservationRequest],
        session_id: CheckoutSessionId,
        ttl: Duration,
    ) -> Result<Vec<Reservation>> {
        if items.is_empty() {
            return Err(LedgerError::Validation("no items to reserve".to_string()));
        }
        if session_id.is_nil() {
            return Err(LedgerError::Validation(
                "checkout session id is empty".to_string(),
            ));
        }
        if ttl <= Duration::zero() {
            return Err(LedgerError::Validation(
                "hold window must be positive".to_string(),
            ));
        }
        validate_items(items)?;

        let shortfalls: Vec<_> = self
            .check_availability(items)
            .await?
            .into_iter()
            .filter(|report| !report.sufficient)
            .collect();
        if !shortfalls.is_empty() {
            metrics::counter!("reservations_conflicts_total").increment(1);
            info!(short_items = shortfalls.len(), "Insufficient stock");
            return Err(LedgerError::InsufficientStock(shortfalls));
        }

        let now = Utc::now();
        let mut reserved: Vec<Reservation> = Vec::with_capacity(items.len());

        for item in items {
            let outcome = self.claim(item, session_id, ttl, now).await;
            match outcome {
                Ok(reservation) => reserved.push(reservation),
                Err(e) => {
                    if e.is_conflict() {
                        metrics::counter!("reservations_conflicts_total").increment(1);
                    }
                    warn!(key = %item.key, error = %e, "Reservation claim failed, rolling back");
                    self.roll_back(&reserved).await;
                    return Err(e);
                }
            }
        }

        metrics::counter!("reservations_created_total").increment(reserved.len() as u64);
        debug!(count = reserved.len(), "Reserved stock");
        Ok(reserved)
    }

    /// Releases the given reservations. Rows already terminal are left alone.
    #[tracing::instrument(skip(self, reservation_ids), fields(count = reservation_ids.len()))]
    pub async fn release(&self, reservation_ids: &[ReservationId]) -> Result<u64> {
        let released = self
            .store
            .transition_reservations(reservation_ids, ReservationStatus::Released)
            .await?;
        debug!(released, "Released reservations");
        Ok(released)
    }

    /// Releases every active reservation owned by a checkout session.
    #[tracing::instrument(skip(self))]
    pub async fn release_by_session(&self, session_id: CheckoutSessionId) -> Result<u64> {
        let released = self
            .store
            .transition_session(session_id, ReservationStatus::Released)
            .await?;
        debug!(released, "Released session reservations");
        Ok(released)
    }

    /// Turns the session's active holds into permanent, non-reversible claims.
    ///
    /// Call only once the order and its items are durably stored.
    #[tracing::instrument(skip(self))]
    pub async fn consume(&self, session_id: CheckoutSessionId) -> Result<u64> {
        let consumed = self
            .store
            .transition_session(session_id, ReservationStatus::Consumed)
            .await?;
        debug!(consumed, "Consumed session reservations");
        Ok(consumed)
    }

    /// Read-only availability for each item. Never mutates state.
    #[tracing::instrument(skip(self, items), fields(items = items.len()))]
    pub async fn check_availability(
        &self,
        items: &[ReservationRequest],
    ) -> Result<Vec<AvailabilityReport>> {
        validate_items(items)?;
        let now = Utc::now();

        let mut reports = Vec::with_capacity(items.len());
        for item in items {
            let on_hand = self.on_hand(&item.key).await?;
            let held = self.store.reserved_quantity(&item.key, now).await?;
            reports.push(AvailabilityReport::new(
                item.key,
                item.quantity,
                on_hand.saturating_sub(held),
            ));
        }
        Ok(reports)
    }

    /// Expires active reservations whose hold window has passed.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_expired(&self) -> Result<u64> {
        let expired = self.store.expire_reservations(Utc::now()).await?;
        if expired > 0 {
            metrics::counter!("reservations_expired_total").increment(expired);
            info!(expired, "Expired stale reservations");
        }
        Ok(expired)
    }

    async fn claim(
        &self,
        item: &ReservationRequest,
        session_id: CheckoutSessionId,
        ttl: Duration,
        now: chrono::DateTime<Utc>,
    ) -> Result<Reservation> {
        let reservation = Reservation::new_active(item.key, session_id, item.quantity, now, ttl)
            .map_err(|e: DomainError| LedgerError::Validation(e.to_string()))?;
        let on_hand = self.on_hand(&item.key).await?;

        match self.store.reserve_unit(&reservation, on_hand, now).await? {
            ReserveUnitOutcome::Inserted => Ok(reservation),
            ReserveUnitOutcome::Insufficient { available } => {
                Err(LedgerError::InsufficientStock(vec![AvailabilityReport::new(
                    item.key,
                    item.quantity,
                    available,
                )]))
            }
            ReserveUnitOutcome::AlreadyReserved => {
                Err(LedgerError::AlreadyReserved { key: item.key })
            }
        }
    }

    async fn on_hand(&self, key: &StockUnitKey) -> Result<u32> {
        // Unknown units have nothing to hold.
        Ok(self.stock.on_hand(key).await?.unwrap_or(0))
    }

    async fn roll_back(&self, reserved: &[Reservation]) {
        if reserved.is_empty() {
            return;
        }
        let ids: Vec<_> = reserved.iter().map(|r| r.id).collect();
        if let Err(e) = self
            .store
            .transition_reservations(&ids, ReservationStatus::Released)
            .await
        {
            // The holds lapse on their own once the TTL passes.
            error!(error = %e, count = ids.len(), "Failed to roll back partial reservation");
        }
    }
}

fn validate_items(items: &[ReservationRequest]) -> Result<()> {
    let mut seen = HashSet::with_capacity(items.len());
    for item in items {
        if item.quantity == 0 {
            return Err(LedgerError::Validation(format!(
                "quantity for {} must be positive",
                item.key
            )));
        }
        if !item.key.is_well_formed() {
            return Err(LedgerError::Validation(format!(
                "malformed stock unit key {}",
                item.key
            )));
        }
        if !seen.insert(item.key) {
            return Err(LedgerError::Validation(format!(
                "stock unit {} listed more than once",
                item.key
            )));
        }
    }
    Ok(())
}
