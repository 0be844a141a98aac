//! At-most-once shipment creation against the external provider.
//!
//! Creation is coordinated through a token-gated lock row in the shared
//! store, so two callers racing for the same order (a user retry and a
//! webhook, or two processes) never both reach the provider.

use chrono::Utc;
use common::OrderId;
use domain::{CreationToken, LockAcquisition, Order, OrderStatus, ShipmentLinkage};
use serde::Serialize;
use store::FulfillmentStore;
use tracing::{error, info, warn};

use crate::compensation::{CompensationPlan, CompensationTargets, cancel_at_provider};
use crate::error::{FulfillmentError, Result};
use crate::policy::{DependencyGuards, FulfillmentPolicy};
use crate::services::{
    PaymentGateway, ShipmentLine, ShipmentProvider, ShipmentRequest, TrackingInfo,
};

/// Outcome of [`ShipmentSynchronizer::create_shipment_for_order`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "shipment", rename_all = "snake_case")]
pub enum ShipmentCreation {
    /// This call created the shipment.
    Created(ShipmentLinkage),
    /// A shipment already existed for the order.
    AlreadyExists(ShipmentLinkage),
    /// Another caller holds the creation lock.
    InProgress,
}

pub struct ShipmentSynchronizer<S, P, Sh> {
    store: S,
    payment: P,
    provider: Sh,
    guards: DependencyGuards,
    policy: FulfillmentPolicy,
}

impl<S, P, Sh> ShipmentSynchronizer<S, P, Sh>
where
    S: FulfillmentStore,
    P: PaymentGateway,
    Sh: ShipmentProvider,
{
    pub fn new(
        store: S,
        payment: P,
        provider: Sh,
        guards: DependencyGuards,
        policy: FulfillmentPolicy,
    ) -> Self {
        Self {
            store,
            payment,
            provider,
            guards,
            policy,
        }
    }

    /// Creates the provider-side shipment for an order, at most once.
    ///
    /// Lock contention and an existing shipment are reported as outcomes,
    /// not errors. When the provider call or the final write fails, the lock
    /// is marked failed and the compensation plan runs before the error is
    /// returned.
    #[tracing::instrument(skip(self))]
    pub async fn create_shipment_for_order(&self, order_id: OrderId) -> Result<ShipmentCreation> {
        let order = self.load_order(order_id).await?;
        if let Some(linkage) = &order.shipment {
            return Ok(ShipmentCreation::AlreadyExists(linkage.clone()));
        }
        if let Some(reason) = not_ready_reason(&order) {
            return Err(FulfillmentError::OrderNotReady {
                order_id,
                reason: reason.to_string(),
            });
        }

        let acquisition = self
            .store
            .acquire_creation_lock(order_id, self.policy.shipment_lock_ttl, Utc::now())
            .await?;
        let token = match acquisition {
            LockAcquisition::Acquired(token) => token,
            LockAcquisition::AlreadyExists(linkage) => {
                return Ok(ShipmentCreation::AlreadyExists(linkage));
            }
            LockAcquisition::InProgress => {
                metrics::counter!("shipment_lock_contention_total").increment(1);
                info!("Shipment creation already in progress");
                return Ok(ShipmentCreation::InProgress);
            }
            LockAcquisition::OrderMissing => return Err(FulfillmentError::OrderNotFound(order_id)),
        };

        self.create_under_lock(&order, token).await
    }

    async fn create_under_lock(&self, order: &Order, token: CreationToken) -> Result<ShipmentCreation> {
        let request = match self.shipment_request(order).await {
            Ok(request) => request,
            Err(e) => {
                // Nothing reached the provider yet.
                self.mark_failed(order.id, token).await;
                return Err(e);
            }
        };

        // A single attempt: a timed-out create may still have succeeded remotely.
        let single_attempt = self.policy.retry.with_max_attempts(1);
        let created = self
            .guards
            .shipment
            .execute_with_policy(
                &format!("create_shipment:{}", order.id),
                &single_attempt,
                || self.provider.create_order(&request),
            )
            .await;

        let linkage = match created {
            Ok(linkage) => linkage,
            Err(e) => {
                let error = FulfillmentError::from_retry("shipment provider", e);
                warn!(error = %error, "Provider shipment creation failed");
                self.fail_and_compensate(order, token, None, &error).await;
                return Err(error);
            }
        };

        match self
            .store
            .finalize_creation(order.id, token, &linkage)
            .await
        {
            Ok(true) => {
                metrics::counter!("shipments_created_total").increment(1);
                info!(shipment_order_id = %linkage.shipment_order_id, "Shipment created");
                Ok(ShipmentCreation::Created(linkage))
            }
            Ok(false) => {
                // A later caller took the lock over and owns the order from here.
                let error = FulfillmentError::LockLost(order.id);
                warn!("Creation lock lost before the shipment was recorded");
                let plan = CompensationPlan::for_orphaned_shipment(
                    order.id,
                    linkage.shipment_order_id,
                    format!("shipment creation failed: {error}"),
                );
                self.compensate(&plan).await;
                Err(error)
            }
            Err(e) => {
                let error = FulfillmentError::from(e);
                error!(error = %error, "Failed to record created shipment");
                self.fail_and_compensate(order, token, Some(linkage.shipment_order_id), &error)
                    .await;
                Err(error)
            }
        }
    }

    async fn fail_and_compensate(
        &self,
        order: &Order,
        token: CreationToken,
        provider_order_id: Option<String>,
        cause: &FulfillmentError,
    ) {
        self.mark_failed(order.id, token).await;

        let plan = CompensationPlan::for_failed_shipment(
            order,
            provider_order_id,
            format!("shipment creation failed: {cause}"),
        );
        self.compensate(&plan).await;
    }

    async fn compensate(&self, plan: &CompensationPlan) {
        let report = plan
            .execute(
                &self.store,
                &CompensationTargets {
                    payment: &self.payment,
                    provider: &self.provider,
                    payment_retrier: &self.guards.payment,
                    shipment_retrier: &self.guards.shipment,
                },
            )
            .await;
        info!(queued = report.queued(), "Shipment compensation finished");
    }

    async fn mark_failed(&self, order_id: OrderId, token: CreationToken) {
        match self.store.mark_creation_failed(order_id, token).await {
            Ok(true) => {}
            Ok(false) => warn!(%order_id, "Creation lock no longer owned when marking it failed"),
            Err(e) => error!(%order_id, error = %e, "Failed to mark creation lock failed"),
        }
    }

    /// Cancels the provider-side shipment and marks the order cancelled.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_shipment(&self, order_id: OrderId) -> Result<()> {
        let order = self.load_order(order_id).await?;
        let linkage = order
            .shipment
            .as_ref()
            .ok_or(FulfillmentError::ShipmentNotCreated(order_id))?;
        if !order.status.can_cancel() {
            return Err(FulfillmentError::InvalidOrderState {
                order_id,
                status: order.status,
            });
        }

        cancel_at_provider(
            &self.provider,
            &self.guards.shipment,
            order_id,
            Some(&linkage.shipment_order_id),
        )
        .await?;
        self.store
            .update_order_status(order_id, OrderStatus::Cancelled)
            .await?;
        info!("Shipment cancelled");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn track_shipment(&self, order_id: OrderId) -> Result<TrackingInfo> {
        let order = self.load_order(order_id).await?;
        let linkage = order
            .shipment
            .ok_or(FulfillmentError::ShipmentNotCreated(order_id))?;

        self.guards
            .shipment
            .execute(&format!("track_shipment:{order_id}"), || {
                self.provider.track_by_order_id(&linkage.shipment_order_id)
            })
            .await
            .map_err(|e| FulfillmentError::from_retry("shipment provider", e))
    }

    /// Returns one invoice document covering every given order.
    #[tracing::instrument(skip(self, order_ids), fields(orders = order_ids.len()))]
    pub async fn generate_invoice(&self, order_ids: &[OrderId]) -> Result<Vec<u8>> {
        if order_ids.is_empty() {
            return Err(FulfillmentError::Validation(
                "at least one order id is required".to_string(),
            ));
        }

        let mut provider_ids = Vec::with_capacity(order_ids.len());
        for order_id in order_ids {
            let order = self.load_order(*order_id).await?;
            let linkage = order
                .shipment
                .ok_or(FulfillmentError::ShipmentNotCreated(*order_id))?;
            provider_ids.push(linkage.shipment_order_id);
        }

        self.guards
            .shipment
            .execute(&invoice_operation_id(order_ids), || {
                self.provider.print_invoice(&provider_ids)
            })
            .await
            .map_err(|e| FulfillmentError::from_retry("shipment provider", e))
    }

    /// Frees creation locks abandoned past their TTL.
    pub async fn release_expired_locks(&self) -> Result<u64> {
        let released = self.store.release_expired_locks(Utc::now()).await?;
        if released > 0 {
            info!(released, "Released expired shipment creation locks");
        }
        Ok(released)
    }

    async fn load_order(&self, order_id: OrderId) -> Result<Order> {
        self.store
            .get_order(order_id)
            .await?
            .ok_or(FulfillmentError::OrderNotFound(order_id))
    }

    async fn shipment_request(&self, order: &Order) -> Result<ShipmentRequest> {
        let shipping_address_id =
            order
                .shipping_address_id
                .ok_or_else(|| FulfillmentError::OrderNotReady {
                    order_id: order.id,
                    reason: "order has no shipping address".to_string(),
                })?;
        let items = self
            .store
            .order_items(order.id)
            .await?
            .into_iter()
            .map(|item| ShipmentLine {
                sku: item.key.to_string(),
                selling_price: item.unit_price,
                units: item.quantity,
                name: item.product_name,
            })
            .collect();

        Ok(ShipmentRequest {
            order_id: order.id,
            user_id: order.user_id,
            shipping_address_id,
            payment_method: order.payment_method,
            sub_total: order.total_amount,
            items,
        })
    }
}

fn invoice_operation_id(order_ids: &[OrderId]) -> String {
    let ids: Vec<String> = order_ids.iter().map(ToString::to_string).collect();
    format!("print_invoice:{}", ids.join(","))
}

fn not_ready_reason(order: &Order) -> Option<&'static str> {
    if order.status == OrderStatus::Cancelled {
        Some("order is cancelled")
    } else if order.shipping_address_id.is_none() {
        Some("order has no shipping address")
    } else if !order.is_ready_to_ship() {
        Some("payment has not been completed")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use common::{AddressId, CheckoutSessionId, UserId};
    use domain::{Money, PaymentMethod, PaymentStatus};

    use super::*;

    fn order(method: PaymentMethod) -> Order {
        Order::new_pending(
            UserId::new(),
            CheckoutSessionId::new(),
            Money::from_cents(900),
            method,
            Some(AddressId::new()),
            Utc::now(),
        )
    }

    #[test]
    fn test_not_ready_reasons() {
        assert_eq!(not_ready_reason(&order(PaymentMethod::Cod)), None);

        let mut unpaid = order(PaymentMethod::Upi);
        assert_eq!(not_ready_reason(&unpaid), Some("payment has not been completed"));
        unpaid.payment_status = PaymentStatus::Paid;
        assert_eq!(not_ready_reason(&unpaid), None);

        let mut no_address = order(PaymentMethod::Cod);
        no_address.shipping_address_id = None;
        assert_eq!(
            not_ready_reason(&no_address),
            Some("order has no shipping address")
        );

        let mut cancelled = order(PaymentMethod::Cod);
        cancelled.status = OrderStatus::Cancelled;
        assert_eq!(not_ready_reason(&cancelled), Some("order is cancelled"));
    }

    #[test]
    fn test_invoice_operation_id_names_every_order() {
        let first = OrderId::new();
        let second = OrderId::new();
        let id = invoice_operation_id(&[first, second]);
        assert_eq!(id, format!("print_invoice:{first},{second}"));
        assert_ne!(id, invoice_operation_id(&[first]));
    }

    #[test]
    fn test_creation_outcome_serialization() {
        let json = serde_json::to_value(ShipmentCreation::InProgress).unwrap();
        assert_eq!(json["status"], "in_progress");
    }
}
