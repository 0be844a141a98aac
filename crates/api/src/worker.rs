//! Periodic maintenance: reservation expiry, abandoned lock release and
//! compensation reconciliation.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use store::FulfillmentStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::AppState;

/// Compensations retried per pass.
pub const RECONCILE_BATCH: usize = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub reservations_expired: u64,
    pub locks_released: u64,
    pub compensations_resolved: usize,
    pub compensations_failed: usize,
}

/// Runs one maintenance pass. Each task runs even if an earlier one failed.
pub async fn run_maintenance<S: FulfillmentStore>(state: &AppState<S>) -> MaintenanceReport {
    let mut report = MaintenanceReport::default();

    match state.orders.ledger().sweep_expired().await {
        Ok(expired) => report.reservations_expired = expired,
        Err(e) => error!(error = %e, "Reservation sweep failed"),
    }
    match state.shipments.release_expired_locks().await {
        Ok(released) => report.locks_released = released,
        Err(e) => error!(error = %e, "Releasing expired shipment locks failed"),
    }
    match state.reconciler.run_once(RECONCILE_BATCH).await {
        Ok(summary) => {
            report.compensations_resolved = summary.resolved;
            report.compensations_failed = summary.failed;
        }
        Err(e) => error!(error = %e, "Compensation reconciliation failed"),
    }

    debug!(?report, "Maintenance pass finished");
    report
}

/// Spawns the maintenance loop. It stops when `shutdown` flips to `true`.
pub fn spawn<S: FulfillmentStore>(
    state: Arc<AppState<S>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = every.as_secs(), "Maintenance worker started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    run_maintenance(state.as_ref()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Maintenance worker stopped");
    })
}
