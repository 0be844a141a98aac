//! Order creation orchestrator.

use std::time::Instant;

use chrono::Utc;
use common::{AddressId, CheckoutSessionId, OrderId, UserId};
use domain::{
    CheckoutSession, Money, Order, OrderItem, OrderStatus, PaymentMethod, PaymentStatus,
    Reservation, ReservationRequest,
};
use ledger::{AvailabilityReport, ReservationLedger};
use resilience::RetryError;
use serde::Serialize;
use store::FulfillmentStore;
use tracing::{debug, error, info, warn};

use crate::error::{FulfillmentError, Result, ServiceError};
use crate::policy::{DependencyGuards, FulfillmentPolicy};
use crate::services::{
    CatalogService, CatalogStockLevels, CheckoutService, PaymentGateway, PaymentSession,
};

/// Input of [`OrderOrchestrator::create_order`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOrder {
    pub user_id: UserId,
    pub checkout_session_id: CheckoutSessionId,
    pub shipping_address_id: Option<AddressId>,
    /// Pay on delivery when absent.
    pub payment_method: Option<PaymentMethod>,
}

/// Result of opening a payment session for a new order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PaymentOutcome {
    /// Pay on delivery.
    NotRequired,
    Initiated(PaymentSession),
    /// The order stands; payment can be retried later.
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderCreated {
    pub order_id: OrderId,
    pub total_amount: Money,
    pub payment_required: bool,
    pub payment: PaymentOutcome,
}

/// An order with its line items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderDetails {
    pub order: Order,
    pub items: Vec<OrderItem>,
}

/// Turns a pending checkout session into an order.
///
/// Every failure after stock was reserved releases the reservations, and an
/// order is never left without its items.
pub struct OrderOrchestrator<S, C, K, P> {
    store: S,
    ledger: ReservationLedger<S, CatalogStockLevels<K>>,
    checkout: C,
    catalog: K,
    payment: P,
    guards: DependencyGuards,
    policy: FulfillmentPolicy,
}

impl<S, C, K, P> OrderOrchestrator<S, C, K, P>
where
    S: FulfillmentStore,
    C: CheckoutService,
    K: CatalogService + Clone,
    P: PaymentGateway,
{
    pub fn new(
        store: S,
        checkout: C,
        catalog: K,
        payment: P,
        guards: DependencyGuards,
        policy: FulfillmentPolicy,
    ) -> Self {
        let ledger = ReservationLedger::new(store.clone(), CatalogStockLevels(catalog.clone()));
        Self {
            store,
            ledger,
            checkout,
            catalog,
            payment,
            guards,
            policy,
        }
    }

    pub fn ledger(&self) -> &ReservationLedger<S, CatalogStockLevels<K>> {
        &self.ledger
    }

    /// Creates an order from a pending checkout session.
    ///
    /// A payment initiation failure does not fail the call: the order stays
    /// `pending/unpaid` and the outcome reports the failure.
    #[tracing::instrument(
        skip(self, request),
        fields(user_id = %request.user_id, session_id = %request.checkout_session_id)
    )]
    pub async fn create_order(&self, request: CreateOrder) -> Result<OrderCreated> {
        let started = Instant::now();
        let result = self.try_create_order(request).await;
        metrics::histogram!("order_creation_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(created) => {
                metrics::counter!("orders_created_total").increment(1);
                info!(order_id = %created.order_id, "Order created");
            }
            Err(e) => {
                metrics::counter!("order_creation_failures_total", "kind" => e.kind().as_str())
                    .increment(1);
                warn!(error = %e, "Order creation failed");
            }
        }
        result
    }

    async fn try_create_order(&self, request: CreateOrder) -> Result<OrderCreated> {
        validate(&request)?;
        let payment_method = request.payment_method.unwrap_or_default();

        let session = self
            .checkout
            .find_pending_session(request.checkout_session_id, request.user_id)
            .await
            .map_err(|source| FulfillmentError::Dependency {
                service: "checkout",
                source,
            })?
            .ok_or(FulfillmentError::CheckoutNotFound)?;
        if session.is_expired(Utc::now()) {
            return Err(FulfillmentError::CheckoutExpired);
        }
        if session.items.is_empty() {
            return Err(FulfillmentError::EmptyCheckout);
        }

        let names = self.recheck_catalog(&session).await?;
        let total_amount: Money = session.items.iter().map(|item| item.line_total()).sum();

        let reservations = self
            .ledger
            .reserve(
                &session.reservation_requests(),
                session.id,
                self.policy.reservation_ttl,
            )
            .await?;
        debug!(step = "reserve", count = reservations.len(), "Stock reserved");

        let order = Order::new_pending(
            request.user_id,
            session.id,
            total_amount,
            payment_method,
            request.shipping_address_id,
            Utc::now(),
        );
        if let Err(e) = self.store.insert_order(&order).await {
            self.release(&reservations, "insert_order").await;
            if e.is_unique_violation() {
                return Err(FulfillmentError::DuplicateOrder);
            }
            return Err(e.into());
        }

        let items: Vec<OrderItem> = session
            .items
            .iter()
            .zip(names)
            .map(|(item, product_name)| OrderItem {
                order_id: order.id,
                key: item.key,
                product_name,
                quantity: item.quantity,
                unit_price: item.unit_price,
            })
            .collect();
        if let Err(e) = self.store.insert_order_items(&items).await {
            if let Err(delete_error) = self.store.delete_order(order.id).await {
                error!(
                    order_id = %order.id,
                    error = %delete_error,
                    "Failed to delete order after item insert failure"
                );
            }
            self.release(&reservations, "insert_order_items").await;
            return Err(e.into());
        }

        if let Err(e) = self.ledger.consume(session.id).await {
            error!(order_id = %order.id, error = %e, "Failed to consume reservations");
        }

        if let Err(e) = self.checkout.mark_processing(session.id).await {
            warn!(error = %e, "Failed to mark checkout session processing");
        }

        let payment = if payment_method.is_online() {
            self.initiate_payment(&order).await
        } else {
            PaymentOutcome::NotRequired
        };

        Ok(OrderCreated {
            order_id: order.id,
            total_amount,
            payment_required: payment_method.is_online(),
            payment,
        })
    }

    /// Re-opens a payment session for an order that is still unpaid or whose
    /// payment failed.
    #[tracing::instrument(skip(self))]
    pub async fn retry_payment(&self, user_id: UserId, order_id: OrderId) -> Result<PaymentOutcome> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .filter(|order| order.user_id == user_id)
            .ok_or(FulfillmentError::OrderNotFound(order_id))?;

        if order.status == OrderStatus::Cancelled {
            return Err(FulfillmentError::InvalidOrderState {
                order_id,
                status: order.status,
            });
        }
        if !order.payment_method.is_online() {
            return Err(FulfillmentError::Validation(
                "order is paid on delivery".to_string(),
            ));
        }
        if !order.payment_status.can_retry_payment() {
            return Err(FulfillmentError::PaymentNotRetryable {
                order_id,
                status: order.payment_status,
            });
        }

        Ok(self.initiate_payment(&order).await)
    }

    /// Applies the gateway's verdict on a payment.
    ///
    /// A successful payment moves a pending order to `processing`.
    #[tracing::instrument(skip(self))]
    pub async fn record_payment_result(&self, order_id: OrderId, succeeded: bool) -> Result<Order> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or(FulfillmentError::OrderNotFound(order_id))?;

        if order.status == OrderStatus::Cancelled {
            return Err(FulfillmentError::InvalidOrderState {
                order_id,
                status: order.status,
            });
        }
        match (order.payment_status, succeeded) {
            (PaymentStatus::Paid, true) => return Ok(order),
            (PaymentStatus::Paid | PaymentStatus::Refunded, _) => {
                return Err(FulfillmentError::PaymentNotRetryable {
                    order_id,
                    status: order.payment_status,
                });
            }
            _ => {}
        }

        if succeeded {
            self.store
                .update_payment_status(order_id, PaymentStatus::Paid)
                .await?;
            if order.status.can_start_processing() {
                self.store
                    .update_order_status(order_id, OrderStatus::Processing)
                    .await?;
            }
            info!("Payment confirmed");
        } else {
            self.store
                .update_payment_status(order_id, PaymentStatus::Failed)
                .await?;
            info!("Payment failed");
        }

        self.store
            .get_order(order_id)
            .await?
            .ok_or(FulfillmentError::OrderNotFound(order_id))
    }

    pub async fn order_details(&self, order_id: OrderId) -> Result<OrderDetails> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or(FulfillmentError::OrderNotFound(order_id))?;
        let items = self.store.order_items(order_id).await?;
        Ok(OrderDetails { order, items })
    }

    /// Read-only availability for the given items.
    pub async fn check_stock_availability(
        &self,
        items: &[ReservationRequest],
    ) -> Result<Vec<AvailabilityReport>> {
        Ok(self.ledger.check_availability(items).await?)
    }

    /// Re-validates every checkout item against the live catalog and returns
    /// the product names in item order.
    async fn recheck_catalog(&self, session: &CheckoutSession) -> Result<Vec<String>> {
        let mut names = Vec::with_capacity(session.items.len());
        for item in &session.items {
            let entry = self
                .catalog
                .stock_snapshot(&item.key)
                .await
                .map_err(|source| FulfillmentError::Dependency {
                    service: "catalog",
                    source,
                })?
                .filter(|entry| entry.is_active)
                .ok_or(FulfillmentError::ProductInactive { key: item.key })?;

            if entry.stock_quantity < item.quantity {
                return Err(FulfillmentError::StockChanged {
                    key: item.key,
                    requested: item.quantity,
                    available: entry.stock_quantity,
                });
            }
            names.push(entry.product_name);
        }
        Ok(names)
    }

    async fn initiate_payment(&self, order: &Order) -> PaymentOutcome {
        let policy = self.policy.payment_retry();
        let result = self
            .guards
            .payment
            .execute_with_policy(&format!("payment:{}", order.id), &policy, || {
                self.payment.initiate_payment_session(
                    order.user_id,
                    order.id,
                    order.payment_method,
                    order.total_amount,
                )
            })
            .await;

        match result {
            Ok(session) => {
                debug!(order_id = %order.id, "Payment session opened");
                PaymentOutcome::Initiated(session)
            }
            Err(e) => {
                metrics::counter!("payment_initiation_failures_total").increment(1);
                warn!(order_id = %order.id, error = %e, "Payment initiation failed");
                PaymentOutcome::Failed {
                    message: payment_failure_message(&e).to_string(),
                }
            }
        }
    }

    async fn release(&self, reservations: &[Reservation], step: &'static str) {
        let ids: Vec<_> = reservations.iter().map(|r| r.id).collect();
        match self.ledger.release(&ids).await {
            Ok(released) => debug!(step, released, "Released reservations after failure"),
            Err(e) => error!(step, error = %e, "Failed to release reservations"),
        }
    }
}

fn validate(request: &CreateOrder) -> Result<()> {
    if request.user_id.is_nil() {
        return Err(FulfillmentError::Validation("user id is empty".to_string()));
    }
    if request.checkout_session_id.is_nil() {
        return Err(FulfillmentError::Validation(
            "checkout session id is empty".to_string(),
        ));
    }
    if request.shipping_address_id.is_some_and(|id| id.is_nil()) {
        return Err(FulfillmentError::Validation(
            "shipping address id is empty".to_string(),
        ));
    }
    Ok(())
}

fn payment_failure_message(error: &RetryError<ServiceError>) -> &'static str {
    match error {
        RetryError::CircuitOpen { .. } => "Payments are temporarily unavailable, please retry shortly",
        RetryError::NonRetryable { .. } => "This payment method could not be used for the order",
        RetryError::Exhausted { .. } => "Payment could not be started, please retry",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_rejects_nil_ids() {
        let request = CreateOrder {
            user_id: UserId::from_uuid(uuid_nil()),
            checkout_session_id: CheckoutSessionId::new(),
            shipping_address_id: None,
            payment_method: None,
        };
        assert!(matches!(
            validate(&request),
            Err(FulfillmentError::Validation(_))
        ));

        let request = CreateOrder {
            user_id: UserId::new(),
            checkout_session_id: CheckoutSessionId::new(),
            shipping_address_id: Some(AddressId::from_uuid(uuid_nil())),
            payment_method: Some(PaymentMethod::Card),
        };
        assert!(validate(&request).is_err());
    }

    #[test]
    fn test_payment_failure_messages_hide_provider_detail() {
        let message = payment_failure_message(&RetryError::Exhausted {
            attempts: 3,
            error: ServiceError::Upstream {
                status: 502,
                message: "stack trace from gateway".to_string(),
            },
        });
        assert!(!message.contains("stack trace"));
    }

    fn uuid_nil() -> uuid::Uuid {
        uuid::Uuid::nil()
    }
}
