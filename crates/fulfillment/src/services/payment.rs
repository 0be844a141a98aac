//! Payment gateway trait and in-memory implementation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use common::{OrderId, UserId};
use domain::{Money, PaymentMethod};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::ServiceError;

/// Descriptor of a payment session the shopper completes at the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSession {
    pub payment_session_id: String,
    pub provider_order_id: String,
    pub payment_url: String,
}

/// Trait for payment gateway operations.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens a payment session for an order.
    async fn initiate_payment_session(
        &self,
        user_id: UserId,
        order_id: OrderId,
        method: PaymentMethod,
        amount: Money,
    ) -> Result<PaymentSession, ServiceError>;

    /// Refunds a captured payment.
    async fn create_refund(
        &self,
        order_id: OrderId,
        amount: Money,
        reason: &str,
    ) -> Result<(), ServiceError>;
}

#[async_trait]
impl<T: PaymentGateway + ?Sized> PaymentGateway for Arc<T> {
    async fn initiate_payment_session(
        &self,
        user_id: UserId,
        order_id: OrderId,
        method: PaymentMethod,
        amount: Money,
    ) -> Result<PaymentSession, ServiceError> {
        (**self)
            .initiate_payment_session(user_id, order_id, method, amount)
            .await
    }

    async fn create_refund(
        &self,
        order_id: OrderId,
        amount: Money,
        reason: &str,
    ) -> Result<(), ServiceError> {
        (**self).create_refund(order_id, amount, reason).await
    }
}

/// A refund recorded by the in-memory gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRefund {
    pub order_id: OrderId,
    pub amount: Money,
    pub reason: String,
}

#[derive(Debug, Default)]
struct Switches {
    fail_on_initiate: AtomicBool,
    fail_on_refund: AtomicBool,
    reject_initiate: AtomicBool,
    transient_initiate_failures: AtomicU32,
    initiate_calls: AtomicU32,
    next_id: AtomicU32,
}

/// In-memory payment gateway for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentGateway {
    switches: Arc<Switches>,
    refunds: Arc<RwLock<Vec<RecordedRefund>>>,
}

impl InMemoryPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures every initiation to fail with a transient error.
    pub fn set_fail_on_initiate(&self, fail: bool) {
        self.switches.fail_on_initiate.store(fail, Ordering::SeqCst);
    }

    /// Configures initiation to be rejected as invalid (not retryable).
    pub fn set_reject_initiate(&self, reject: bool) {
        self.switches.reject_initiate.store(reject, Ordering::SeqCst);
    }

    /// Makes the next `count` initiations fail with a transient error.
    pub fn fail_next_initiations(&self, count: u32) {
        self.switches
            .transient_initiate_failures
            .store(count, Ordering::SeqCst);
    }

    /// Configures refunds to fail.
    pub fn set_fail_on_refund(&self, fail: bool) {
        self.switches.fail_on_refund.store(fail, Ordering::SeqCst);
    }

    /// Returns how many times initiation was attempted.
    pub fn initiate_calls(&self) -> u32 {
        self.switches.initiate_calls.load(Ordering::SeqCst)
    }

    pub async fn refunds(&self) -> Vec<RecordedRefund> {
        self.refunds.read().await.clone()
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn initiate_payment_session(
        &self,
        _user_id: UserId,
        order_id: OrderId,
        _method: PaymentMethod,
        _amount: Money,
    ) -> Result<PaymentSession, ServiceError> {
        let switches = &self.switches;
        switches.initiate_calls.fetch_add(1, Ordering::SeqCst);

        if switches.reject_initiate.load(Ordering::SeqCst) {
            return Err(ServiceError::Rejected {
                status: 400,
                message: "payment method not enabled".to_string(),
            });
        }
        if switches.fail_on_initiate.load(Ordering::SeqCst) {
            return Err(ServiceError::Timeout);
        }
        let pending_failures = switches.transient_initiate_failures.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
        if pending_failures.is_ok() {
            return Err(ServiceError::Upstream {
                status: 502,
                message: "gateway unavailable".to_string(),
            });
        }

        let id = switches.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PaymentSession {
            payment_session_id: format!("PS-{id:04}"),
            provider_order_id: format!("PO-{id:04}"),
            payment_url: format!("https://pay.example.test/session/PS-{id:04}?order={order_id}"),
        })
    }

    async fn create_refund(
        &self,
        order_id: OrderId,
        amount: Money,
        reason: &str,
    ) -> Result<(), ServiceError> {
        if self.switches.fail_on_refund.load(Ordering::SeqCst) {
            return Err(ServiceError::Upstream {
                status: 503,
                message: "refunds unavailable".to_string(),
            });
        }
        self.refunds.write().await.push(RecordedRefund {
            order_id,
            amount,
            reason: reason.to_string(),
        });
        Ok(())
    }
}
