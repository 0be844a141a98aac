//! Order creation, lookup and payment endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::{AddressId, CheckoutSessionId, OrderId, UserId};
use domain::{Order, OrderItem, PaymentMethod, ShipmentLinkage};
use fulfillment::{CreateOrder, OrderDetails, PaymentOutcome};
use serde::{Deserialize, Serialize};
use store::FulfillmentStore;

use super::parse_uuid;
use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub user_id: String,
    pub checkout_session_id: String,
    pub shipping_address_id: Option<String>,
    pub payment_method: Option<String>,
}

impl CreateOrderRequest {
    fn into_command(self) -> Result<CreateOrder, ApiError> {
        let shipping_address_id = self
            .shipping_address_id
            .as_deref()
            .map(|id| parse_uuid("shipping_address_id", id).map(AddressId::from_uuid))
            .transpose()?;
        let payment_method = self
            .payment_method
            .as_deref()
            .map(|m| {
                m.parse::<PaymentMethod>()
                    .map_err(|e| ApiError::BadRequest(e.to_string()))
            })
            .transpose()?;

        Ok(CreateOrder {
            user_id: UserId::from_uuid(parse_uuid("user_id", &self.user_id)?),
            checkout_session_id: CheckoutSessionId::from_uuid(parse_uuid(
                "checkout_session_id",
                &self.checkout_session_id,
            )?),
            shipping_address_id,
            payment_method,
        })
    }
}

#[derive(Deserialize)]
pub struct RetryPaymentRequest {
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentResult {
    Paid,
    Failed,
}

#[derive(Deserialize)]
pub struct PaymentResultRequest {
    pub status: PaymentResult,
}

// -- Response types --

#[derive(Serialize)]
pub struct OrderCreatedResponse {
    pub order_id: String,
    pub total_cents: i64,
    pub payment_required: bool,
    pub payment: PaymentOutcome,
}

#[derive(Serialize)]
pub struct OrderResponse {
    pub id: String,
    pub user_id: String,
    pub checkout_session_id: String,
    pub status: &'static str,
    pub payment_method: &'static str,
    pub payment_status: &'static str,
    pub total_cents: i64,
    pub shipping_address_id: Option<String>,
    pub shipment: Option<ShipmentLinkage>,
    pub items: Vec<OrderItemResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderResponse {
    fn new(order: Order, items: Vec<OrderItem>) -> Self {
        Self {
            id: order.id.to_string(),
            user_id: order.user_id.to_string(),
            checkout_session_id: order.checkout_session_id.to_string(),
            status: order.status.as_str(),
            payment_method: order.payment_method.as_str(),
            payment_status: order.payment_status.as_str(),
            total_cents: order.total_amount.cents(),
            shipping_address_id: order.shipping_address_id.map(|id| id.to_string()),
            shipment: order.shipment,
            items: items.into_iter().map(OrderItemResponse::from).collect(),
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

#[derive(Serialize)]
pub struct OrderItemResponse {
    pub product_id: String,
    pub color_id: i32,
    pub size_id: i32,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

impl From<OrderItem> for OrderItemResponse {
    fn from(item: OrderItem) -> Self {
        Self {
            product_id: item.key.product_id.to_string(),
            color_id: item.key.color_id,
            size_id: item.key.size_id,
            product_name: item.product_name,
            quantity: item.quantity,
            unit_price_cents: item.unit_price.cents(),
        }
    }
}

// -- Handlers --

/// POST /orders: create an order from a pending checkout session.
#[tracing::instrument(skip(state, req))]
pub async fn create<S: FulfillmentStore>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderCreatedResponse>), ApiError> {
    let command = req.into_command()?;
    let created = state.orders.create_order(command).await?;

    let response = OrderCreatedResponse {
        order_id: created.order_id.to_string(),
        total_cents: created.total_amount.cents(),
        payment_required: created.payment_required,
        payment: created.payment,
    };
    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /orders/{id}: the order with its items and shipment linkage.
#[tracing::instrument(skip(state))]
pub async fn get<S: FulfillmentStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let OrderDetails { order, items } = state.orders.order_details(order_id).await?;
    Ok(Json(OrderResponse::new(order, items)))
}

/// POST /orders/{id}/payment/retry: open a new payment session.
#[tracing::instrument(skip(state, req))]
pub async fn retry_payment<S: FulfillmentStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Json(req): Json<RetryPaymentRequest>,
) -> Result<Json<PaymentOutcome>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let user_id = UserId::from_uuid(parse_uuid("user_id", &req.user_id)?);
    let outcome = state.orders.retry_payment(user_id, order_id).await?;
    Ok(Json(outcome))
}

/// POST /orders/{id}/payment/result: payment gateway callback.
#[tracing::instrument(skip(state, req))]
pub async fn payment_result<S: FulfillmentStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Json(req): Json<PaymentResultRequest>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let order = state
        .orders
        .record_payment_result(order_id, req.status == PaymentResult::Paid)
        .await?;
    let OrderDetails { items, .. } = state.orders.order_details(order.id).await?;
    Ok(Json(OrderResponse::new(order, items)))
}

pub(crate) fn parse_order_id(id: &str) -> Result<OrderId, ApiError> {
    parse_uuid("order id", id).map(OrderId::from_uuid)
}
