//! Shipment provider trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{AddressId, OrderId, UserId};
use domain::{Money, PaymentMethod, ShipmentLinkage};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::ServiceError;

/// One line of a shipment order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShipmentLine {
    pub name: String,
    pub sku: String,
    pub units: u32,
    pub selling_price: Money,
}

/// Payload for creating a shipment order at the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShipmentRequest {
    /// Our order id, sent as the provider's channel order id.
    pub order_id: OrderId,
    pub user_id: UserId,
    pub shipping_address_id: AddressId,
    pub payment_method: PaymentMethod,
    pub sub_total: Money,
    pub items: Vec<ShipmentLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub status: String,
    pub location: Option<String>,
    pub timestamp: String,
}

/// Tracking state reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingInfo {
    pub current_status: String,
    pub awb_code: Option<String>,
    #[serde(default)]
    pub events: Vec<TrackingEvent>,
}

/// External shipment provider.
///
/// No call is idempotent on the provider side.
#[async_trait]
pub trait ShipmentProvider: Send + Sync {
    async fn create_order(&self, request: &ShipmentRequest)
    -> Result<ShipmentLinkage, ServiceError>;

    async fn cancel_order(&self, provider_order_ids: &[String]) -> Result<(), ServiceError>;

    async fn track_by_order_id(&self, provider_order_id: &str)
    -> Result<TrackingInfo, ServiceError>;

    async fn track_by_shipment_id(&self, shipment_id: &str) -> Result<TrackingInfo, ServiceError>;

    /// Returns the invoice document (PDF bytes) covering the given orders.
    async fn print_invoice(&self, provider_order_ids: &[String]) -> Result<Vec<u8>, ServiceError>;
}

#[async_trait]
impl<T: ShipmentProvider + ?Sized> ShipmentProvider for Arc<T> {
    async fn create_order(
        &self,
        request: &ShipmentRequest,
    ) -> Result<ShipmentLinkage, ServiceError> {
        (**self).create_order(request).await
    }

    async fn cancel_order(&self, provider_order_ids: &[String]) -> Result<(), ServiceError> {
        (**self).cancel_order(provider_order_ids).await
    }

    async fn track_by_order_id(
        &self,
        provider_order_id: &str,
    ) -> Result<TrackingInfo, ServiceError> {
        (**self).track_by_order_id(provider_order_id).await
    }

    async fn track_by_shipment_id(&self, shipment_id: &str) -> Result<TrackingInfo, ServiceError> {
        (**self).track_by_shipment_id(shipment_id).await
    }

    async fn print_invoice(&self, provider_order_ids: &[String]) -> Result<Vec<u8>, ServiceError> {
        (**self).print_invoice(provider_order_ids).await
    }
}

#[derive(Debug, Default)]
struct Switches {
    fail_on_create: AtomicBool,
    fail_on_cancel: AtomicBool,
    create_delay_ms: AtomicU64,
    create_calls: AtomicU32,
    next_id: AtomicU32,
}

#[derive(Debug, Default)]
struct ProviderState {
    orders: HashMap<String, ShipmentLinkage>,
    cancelled: Vec<String>,
}

/// In-memory shipment provider for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShipmentProvider {
    switches: Arc<Switches>,
    state: Arc<RwLock<ProviderState>>,
}

impl InMemoryShipmentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures order creation to fail with a provider error.
    pub fn set_fail_on_create(&self, fail: bool) {
        self.switches.fail_on_create.store(fail, Ordering::SeqCst);
    }

    /// Configures cancellation to fail.
    pub fn set_fail_on_cancel(&self, fail: bool) {
        self.switches.fail_on_cancel.store(fail, Ordering::SeqCst);
    }

    /// Delays every create call, keeping the creation lock held meanwhile.
    pub fn set_create_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.switches.create_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Returns how many times `create_order` was called.
    pub fn create_calls(&self) -> u32 {
        self.switches.create_calls.load(Ordering::SeqCst)
    }

    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }

    pub async fn cancelled(&self) -> Vec<String> {
        self.state.read().await.cancelled.clone()
    }

    fn tracking_for(linkage: Option<ShipmentLinkage>) -> Result<TrackingInfo, ServiceError> {
        let linkage = linkage.ok_or_else(|| ServiceError::Rejected {
            status: 404,
            message: "shipment not found".to_string(),
        })?;
        Ok(TrackingInfo {
            current_status: "PICKUP SCHEDULED".to_string(),
            awb_code: linkage.awb_code,
            events: Vec::new(),
        })
    }
}

#[async_trait]
impl ShipmentProvider for InMemoryShipmentProvider {
    async fn create_order(
        &self,
        request: &ShipmentRequest,
    ) -> Result<ShipmentLinkage, ServiceError> {
        self.switches.create_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.switches.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.switches.fail_on_create.load(Ordering::SeqCst) {
            return Err(ServiceError::Upstream {
                status: 500,
                message: format!("could not create order {}", request.order_id),
            });
        }

        let id = self.switches.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let linkage = ShipmentLinkage {
            shipment_order_id: format!("SR-{id:06}"),
            shipment_id: format!("SH-{id:06}"),
            awb_code: Some(format!("AWB{id:09}")),
        };
        self.state
            .write()
            .await
            .orders
            .insert(linkage.shipment_order_id.clone(), linkage.clone());
        Ok(linkage)
    }

    async fn cancel_order(&self, provider_order_ids: &[String]) -> Result<(), ServiceError> {
        if self.switches.fail_on_cancel.load(Ordering::SeqCst) {
            return Err(ServiceError::Upstream {
                status: 502,
                message: "cancellation unavailable".to_string(),
            });
        }
        let mut state = self.state.write().await;
        for id in provider_order_ids {
            state.orders.remove(id);
            state.cancelled.push(id.clone());
        }
        Ok(())
    }

    async fn track_by_order_id(
        &self,
        provider_order_id: &str,
    ) -> Result<TrackingInfo, ServiceError> {
        let linkage = self.state.read().await.orders.get(provider_order_id).cloned();
        Self::tracking_for(linkage)
    }

    async fn track_by_shipment_id(&self, shipment_id: &str) -> Result<TrackingInfo, ServiceError> {
        let linkage = self
            .state
            .read()
            .await
            .orders
            .values()
            .find(|l| l.shipment_id == shipment_id)
            .cloned();
        Self::tracking_for(linkage)
    }

    async fn print_invoice(&self, provider_order_ids: &[String]) -> Result<Vec<u8>, ServiceError> {
        let state = self.state.read().await;
        if let Some(missing) = provider_order_ids
            .iter()
            .find(|id| !state.orders.contains_key(*id))
        {
            return Err(ServiceError::Rejected {
                status: 404,
                message: format!("unknown order {missing}"),
            });
        }
        let mut document = b"%PDF-1.4\n".to_vec();
        document.extend_from_slice(format!("% invoice {}\n", provider_order_ids.join(",")).as_bytes());
        Ok(document)
    }
}
