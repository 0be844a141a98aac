//! Shipment creation, cancellation, tracking and invoice endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use fulfillment::ShipmentCreation;
use fulfillment::services::TrackingInfo;
use serde::{Deserialize, Serialize};
use store::FulfillmentStore;

use super::orders::parse_order_id;
use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct InvoiceRequest {
    pub order_ids: Vec<String>,
}

#[derive(Serialize)]
pub struct CancelledResponse {
    pub order_id: String,
    pub status: &'static str,
}

/// POST /orders/{id}/shipment: create the provider shipment at most once.
///
/// 201 when this call created it, 200 when it already existed and 409 while
/// another caller holds the creation lock.
#[tracing::instrument(skip(state))]
pub async fn create<S: FulfillmentStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<ShipmentCreation>), ApiError> {
    let order_id = parse_order_id(&id)?;
    let creation = state.shipments.create_shipment_for_order(order_id).await?;
    let status = match creation {
        ShipmentCreation::Created(_) => StatusCode::CREATED,
        ShipmentCreation::AlreadyExists(_) => StatusCode::OK,
        ShipmentCreation::InProgress => StatusCode::CONFLICT,
    };
    Ok((status, Json(creation)))
}

/// DELETE /orders/{id}/shipment
#[tracing::instrument(skip(state))]
pub async fn cancel<S: FulfillmentStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<CancelledResponse>, ApiError> {
    let order_id = parse_order_id(&id)?;
    state.shipments.cancel_shipment(order_id).await?;
    Ok(Json(CancelledResponse {
        order_id: order_id.to_string(),
        status: "cancelled",
    }))
}

/// GET /orders/{id}/shipment/tracking
#[tracing::instrument(skip(state))]
pub async fn tracking<S: FulfillmentStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<TrackingInfo>, ApiError> {
    let order_id = parse_order_id(&id)?;
    Ok(Json(state.shipments.track_shipment(order_id).await?))
}

/// POST /shipments/invoice: one PDF covering every listed order.
#[tracing::instrument(skip(state, req))]
pub async fn invoice<S: FulfillmentStore>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<InvoiceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let order_ids = req
        .order_ids
        .iter()
        .map(|id| parse_order_id(id))
        .collect::<Result<Vec<_>, _>>()?;
    let pdf = state.shipments.generate_invoice(&order_ids).await?;
    Ok(([(header::CONTENT_TYPE, "application/pdf")], pdf))
}
