//! Compensation saga for a shipment that could not be created.
//!
//! A [`CompensationPlan`] is an ordered list of steps. Each step is tried
//! synchronously; if a step that touches a remote dependency fails, its
//! fallback persists a [`PendingCompensation`] for the reconciler instead of
//! surfacing the failure.

use chrono::Utc;
use common::OrderId;
use domain::{
    CompensationAction, Money, Order, OrderStatus, PaymentStatus, PendingCompensation,
};
use resilience::Retrier;
use store::{CompensationQueue, OrderStore};
use tracing::{error, info, warn};

use crate::error::{FulfillmentError, Result};
use crate::services::{PaymentGateway, ShipmentProvider};

/// One compensating action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationStep {
    /// Cancel the provider-side shipment record. Fallback: pending cancellation.
    CancelShipment { provider_order_id: Option<String> },
    /// Refund a captured payment. Fallback: pending refund.
    RefundPayment { amount: Money },
    /// Mark the local order cancelled.
    CancelOrder,
}

impl CompensationStep {
    pub fn name(&self) -> &'static str {
        match self {
            CompensationStep::CancelShipment { .. } => "cancel_shipment",
            CompensationStep::RefundPayment { .. } => "refund_payment",
            CompensationStep::CancelOrder => "cancel_order",
        }
    }

    /// The durable record queued when this step fails.
    fn fallback(&self) -> Option<CompensationAction> {
        match self {
            CompensationStep::CancelShipment { provider_order_id } => {
                Some(CompensationAction::CancelShipment {
                    provider_order_id: provider_order_id.clone(),
                })
            }
            CompensationStep::RefundPayment { amount } => {
                Some(CompensationAction::RefundPayment { amount: *amount })
            }
            CompensationStep::CancelOrder => None,
        }
    }
}

/// How a single step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    /// The step failed and its fallback record was persisted.
    Queued,
    /// The step and its fallback both failed. Logged at error level.
    Failed { error: String },
}

/// Outcome of running a plan, in step order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationReport {
    pub steps: Vec<(&'static str, StepOutcome)>,
}

impl CompensationReport {
    pub fn outcome(&self, step: &str) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|(name, _)| *name == step)
            .map(|(_, outcome)| outcome)
    }

    pub fn queued(&self) -> usize {
        self.steps
            .iter()
            .filter(|(_, outcome)| *outcome == StepOutcome::Queued)
            .count()
    }
}

/// Remote collaborators a plan may call.
pub struct CompensationTargets<'a, P: ?Sized, Sh: ?Sized> {
    pub payment: &'a P,
    pub provider: &'a Sh,
    pub payment_retrier: &'a Retrier,
    pub shipment_retrier: &'a Retrier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationPlan {
    order_id: OrderId,
    reason: String,
    steps: Vec<CompensationStep>,
}

impl CompensationPlan {
    /// Plan for an order whose shipment creation failed after the lock was taken.
    ///
    /// `provider_order_id` is the provider's id when the provider answered
    /// before the failure.
    pub fn for_failed_shipment(
        order: &Order,
        provider_order_id: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        let mut steps = vec![CompensationStep::CancelShipment { provider_order_id }];
        if order.payment_status == PaymentStatus::Paid {
            steps.push(CompensationStep::RefundPayment {
                amount: order.total_amount,
            });
        }
        steps.push(CompensationStep::CancelOrder);
        Self {
            order_id: order.id,
            reason: reason.into(),
            steps,
        }
    }

    /// Plan for a provider order created by a caller that lost its lock.
    ///
    /// The order itself belongs to whoever holds the lock now, so only the
    /// orphaned provider record is cancelled.
    pub fn for_orphaned_shipment(
        order_id: OrderId,
        provider_order_id: String,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            order_id,
            reason: reason.into(),
            steps: vec![CompensationStep::CancelShipment {
                provider_order_id: Some(provider_order_id),
            }],
        }
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn steps(&self) -> &[CompensationStep] {
        &self.steps
    }

    /// Runs every step in order. Never fails: each step's failure is either
    /// queued durably or logged.
    #[tracing::instrument(skip(self, store, targets), fields(order_id = %self.order_id))]
    pub async fn execute<S, P, Sh>(
        &self,
        store: &S,
        targets: &CompensationTargets<'_, P, Sh>,
    ) -> CompensationReport
    where
        S: OrderStore + CompensationQueue,
        P: PaymentGateway + ?Sized,
        Sh: ShipmentProvider + ?Sized,
    {
        let mut report = CompensationReport::default();

        for step in &self.steps {
            let attempt = match step {
                CompensationStep::CancelShipment { provider_order_id } => {
                    cancel_at_provider(
                        targets.provider,
                        targets.shipment_retrier,
                        self.order_id,
                        provider_order_id.as_deref(),
                    )
                    .await
                }
                CompensationStep::RefundPayment { amount } => {
                    refund_payment(
                        store,
                        targets.payment,
                        targets.payment_retrier,
                        self.order_id,
                        *amount,
                        &self.reason,
                    )
                    .await
                }
                CompensationStep::CancelOrder => store
                    .update_order_status(self.order_id, OrderStatus::Cancelled)
                    .await
                    .map(|_| ())
                    .map_err(FulfillmentError::from),
            };

            let outcome = match attempt {
                Ok(()) => {
                    info!(step = step.name(), "Compensation step completed");
                    StepOutcome::Completed
                }
                Err(e) => self.fall_back(store, step, &e).await,
            };
            report.steps.push((step.name(), outcome));
        }
        report
    }

    async fn fall_back<S>(
        &self,
        store: &S,
        step: &CompensationStep,
        cause: &FulfillmentError,
    ) -> StepOutcome
    where
        S: CompensationQueue,
    {
        let Some(action) = step.fallback() else {
            error!(step = step.name(), error = %cause, "Compensation step failed");
            return StepOutcome::Failed {
                error: cause.to_string(),
            };
        };

        warn!(step = step.name(), error = %cause, "Compensation step failed, queueing for retry");
        let mut record = PendingCompensation::new(self.order_id, action, &self.reason, Utc::now());
        record.attempts = 1;
        record.last_error = Some(cause.to_string());

        match store.enqueue_compensation(&record).await {
            Ok(()) => {
                metrics::counter!("compensations_queued_total", "action" => record.action.kind())
                    .increment(1);
                StepOutcome::Queued
            }
            Err(e) => {
                error!(
                    step = step.name(),
                    error = %e,
                    "Failed to persist pending compensation"
                );
                StepOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }
}

/// Cancels the shipment record at the provider.
///
/// Without a provider id the local order id is sent, which the provider
/// stores as the channel order id.
pub(crate) async fn cancel_at_provider<Sh>(
    provider: &Sh,
    retrier: &Retrier,
    order_id: OrderId,
    provider_order_id: Option<&str>,
) -> Result<()>
where
    Sh: ShipmentProvider + ?Sized,
{
    let ids = [provider_order_id.map_or_else(|| order_id.to_string(), str::to_string)];
    retrier
        .execute(&format!("cancel_shipment:{order_id}"), || {
            provider.cancel_order(&ids)
        })
        .await
        .map_err(|e| FulfillmentError::from_retry("shipment provider", e))
}

/// Refunds the order's payment and records it as refunded.
///
/// Skips the gateway when the order is already marked refunded. Only a
/// gateway failure is returned as an error; after the money has moved, a
/// failed status write is logged and the step counts as done.
pub(crate) async fn refund_payment<S, P>(
    store: &S,
    payment: &P,
    retrier: &Retrier,
    order_id: OrderId,
    amount: Money,
    reason: &str,
) -> Result<()>
where
    S: OrderStore,
    P: PaymentGateway + ?Sized,
{
    let already_refunded = store
        .get_order(order_id)
        .await?
        .is_some_and(|order| order.payment_status == PaymentStatus::Refunded);
    if already_refunded {
        info!(%order_id, "Payment already refunded");
        return Ok(());
    }

    retrier
        .execute(&format!("refund:{order_id}"), || {
            payment.create_refund(order_id, amount, reason)
        })
        .await
        .map_err(|e| FulfillmentError::from_retry("payment gateway", e))?;

    if let Err(e) = store
        .update_payment_status(order_id, PaymentStatus::Refunded)
        .await
    {
        metrics::counter!("refund_status_unrecorded_total").increment(1);
        error!(%order_id, error = %e, "Refund issued but not recorded on the order");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use common::{AddressId, CheckoutSessionId, UserId};
    use domain::PaymentMethod;
    use resilience::RetryPolicy;
    use store::InMemoryStore;

    use super::*;
    use crate::services::{InMemoryPaymentGateway, InMemoryShipmentProvider};

    fn order(payment_status: PaymentStatus) -> Order {
        let mut order = Order::new_pending(
            UserId::new(),
            CheckoutSessionId::new(),
            Money::from_cents(4200),
            PaymentMethod::Card,
            Some(AddressId::new()),
            Utc::now(),
        );
        order.payment_status = payment_status;
        order
    }

    fn fast_retrier() -> Retrier {
        Retrier::new(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        })
    }

    #[test]
    fn test_plan_refunds_only_paid_orders() {
        let unpaid = CompensationPlan::for_failed_shipment(&order(PaymentStatus::Unpaid), None, "x");
        assert_eq!(
            unpaid.steps().iter().map(|s| s.name()).collect::<Vec<_>>(),
            vec!["cancel_shipment", "cancel_order"]
        );

        let paid = CompensationPlan::for_failed_shipment(&order(PaymentStatus::Paid), None, "x");
        assert_eq!(
            paid.steps().iter().map(|s| s.name()).collect::<Vec<_>>(),
            vec!["cancel_shipment", "refund_payment", "cancel_order"]
        );
    }

    #[tokio::test]
    async fn test_failed_steps_are_queued() {
        let store = InMemoryStore::new();
        let order = order(PaymentStatus::Paid);
        store.insert_order(&order).await.unwrap();

        let payment = InMemoryPaymentGateway::new();
        let provider = InMemoryShipmentProvider::new();
        payment.set_fail_on_refund(true);
        provider.set_fail_on_cancel(true);
        let retrier = fast_retrier();

        let plan = CompensationPlan::for_failed_shipment(&order, None, "provider down");
        let report = plan
            .execute(
                &store,
                &CompensationTargets {
                    payment: &payment,
                    provider: &provider,
                    payment_retrier: &retrier,
                    shipment_retrier: &retrier,
                },
            )
            .await;

        assert_eq!(report.queued(), 2);
        assert_eq!(report.outcome("cancel_order"), Some(&StepOutcome::Completed));

        let pending = store.pending_compensations(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|p| p.order_id == order.id));

        let stored = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_successful_refund_marks_order_refunded() {
        let store = InMemoryStore::new();
        let order = order(PaymentStatus::Paid);
        store.insert_order(&order).await.unwrap();

        let payment = InMemoryPaymentGateway::new();
        let provider = InMemoryShipmentProvider::new();
        let retrier = fast_retrier();

        let plan = CompensationPlan::for_failed_shipment(&order, Some("SR-9".into()), "finalize lost");
        let report = plan
            .execute(
                &store,
                &CompensationTargets {
                    payment: &payment,
                    provider: &provider,
                    payment_retrier: &retrier,
                    shipment_retrier: &retrier,
                },
            )
            .await;

        assert_eq!(report.queued(), 0);
        assert_eq!(provider.cancelled().await, vec!["SR-9".to_string()]);
        assert_eq!(payment.refunds().await[0].amount, Money::from_cents(4200));
        let stored = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Refunded);
    }

    #[test]
    fn test_orphan_plan_only_cancels_the_provider_record() {
        let plan = CompensationPlan::for_orphaned_shipment(OrderId::new(), "SR-4".into(), "lost");
        assert_eq!(
            plan.steps(),
            &[CompensationStep::CancelShipment {
                provider_order_id: Some("SR-4".to_string())
            }]
        );
    }

    #[tokio::test]
    async fn test_unrecorded_refund_is_not_queued_again() {
        let store = InMemoryStore::new();
        let order = order(PaymentStatus::Paid);
        store.insert_order(&order).await.unwrap();
        store.set_fail_on_payment_update(true);

        let payment = InMemoryPaymentGateway::new();
        let provider = InMemoryShipmentProvider::new();
        let retrier = fast_retrier();

        let report = CompensationPlan::for_failed_shipment(&order, Some("SR-2".into()), "x")
            .execute(
                &store,
                &CompensationTargets {
                    payment: &payment,
                    provider: &provider,
                    payment_retrier: &retrier,
                    shipment_retrier: &retrier,
                },
            )
            .await;

        assert_eq!(report.outcome("refund_payment"), Some(&StepOutcome::Completed));
        assert_eq!(report.queued(), 0);
        assert!(store.pending_compensations(10).await.unwrap().is_empty());
        assert_eq!(payment.refunds().await.len(), 1);
    }

    #[tokio::test]
    async fn test_refunded_order_skips_the_gateway() {
        let store = InMemoryStore::new();
        let order = order(PaymentStatus::Refunded);
        store.insert_order(&order).await.unwrap();
        let payment = InMemoryPaymentGateway::new();
        payment.set_fail_on_refund(true);

        refund_payment(
            &store,
            &payment,
            &fast_retrier(),
            order.id,
            order.total_amount,
            "retry",
        )
        .await
        .unwrap();
        assert!(payment.refunds().await.is_empty());
    }

    #[tokio::test]
    async fn test_unpersistable_fallback_is_reported() {
        let store = InMemoryStore::new();
        let order = order(PaymentStatus::Unpaid);
        store.insert_order(&order).await.unwrap();
        store.set_fail_on_enqueue(true);

        let payment = InMemoryPaymentGateway::new();
        let provider = InMemoryShipmentProvider::new();
        provider.set_fail_on_cancel(true);
        let retrier = fast_retrier();

        let report = CompensationPlan::for_failed_shipment(&order, None, "x")
            .execute(
                &store,
                &CompensationTargets {
                    payment: &payment,
                    provider: &provider,
                    payment_retrier: &retrier,
                    shipment_retrier: &retrier,
                },
            )
            .await;
        assert!(matches!(
            report.outcome("cancel_shipment"),
            Some(StepOutcome::Failed { .. })
        ));
    }
}
