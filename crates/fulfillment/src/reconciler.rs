//! Out-of-band retry of queued compensations.

use domain::{CompensationAction, PendingCompensation};
use serde::Serialize;
use store::FulfillmentStore;
use tracing::{debug, info, warn};

use crate::compensation::{cancel_at_provider, refund_payment};
use crate::error::Result;
use crate::policy::DependencyGuards;
use crate::services::{PaymentGateway, ShipmentProvider};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub resolved: usize,
    pub failed: usize,
}

/// Drains the pending compensation queue.
///
/// Each record is retried at most once per pass. Run a single reconciler per
/// deployment; concurrent passes may retry the same record.
pub struct Reconciler<S, P, Sh> {
    store: S,
    payment: P,
    provider: Sh,
    guards: DependencyGuards,
}

impl<S, P, Sh> Reconciler<S, P, Sh>
where
    S: FulfillmentStore,
    P: PaymentGateway,
    Sh: ShipmentProvider,
{
    pub fn new(store: S, payment: P, provider: Sh, guards: DependencyGuards) -> Self {
        Self {
            store,
            payment,
            provider,
            guards,
        }
    }

    /// Retries up to `limit` of the oldest pending compensations once each.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self, limit: usize) -> Result<ReconcileSummary> {
        let pending = self.store.pending_compensations(limit).await?;
        let mut summary = ReconcileSummary::default();

        for record in pending {
            match self.retry(&record).await {
                Ok(()) => {
                    self.store.resolve_compensation(record.id).await?;
                    metrics::counter!(
                        "compensations_resolved_total",
                        "action" => record.action.kind()
                    )
                    .increment(1);
                    info!(
                        order_id = %record.order_id,
                        action = record.action.kind(),
                        "Compensation resolved"
                    );
                    summary.resolved += 1;
                }
                Err(e) => {
                    warn!(
                        order_id = %record.order_id,
                        action = record.action.kind(),
                        attempts = record.attempts + 1,
                        error = %e,
                        "Compensation retry failed"
                    );
                    self.store
                        .record_compensation_attempt(record.id, &e.to_string())
                        .await?;
                    summary.failed += 1;
                }
            }
        }

        if summary != ReconcileSummary::default() {
            debug!(resolved = summary.resolved, failed = summary.failed, "Reconciliation pass done");
        }
        Ok(summary)
    }

    async fn retry(&self, record: &PendingCompensation) -> Result<()> {
        match &record.action {
            CompensationAction::CancelShipment { provider_order_id } => {
                cancel_at_provider(
                    &self.provider,
                    &self.guards.shipment,
                    record.order_id,
                    provider_order_id.as_deref(),
                )
                .await
            }
            CompensationAction::RefundPayment { amount } => {
                refund_payment(
                    &self.store,
                    &self.payment,
                    &self.guards.payment,
                    record.order_id,
                    *amount,
                    &record.reason,
                )
                .await
            }
        }
    }
}
