//! Read-only stock availability.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use common::{ProductId, StockUnitKey};
use domain::ReservationRequest;
use ledger::AvailabilityReport;
use serde::Deserialize;
use store::FulfillmentStore;

use super::parse_uuid;
use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct AvailabilityRequest {
    pub items: Vec<AvailabilityItem>,
}

#[derive(Deserialize)]
pub struct AvailabilityItem {
    pub product_id: String,
    pub color_id: i32,
    pub size_id: i32,
    pub quantity: u32,
}

/// POST /stock/availability
#[tracing::instrument(skip(state, req))]
pub async fn availability<S: FulfillmentStore>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<AvailabilityRequest>,
) -> Result<Json<Vec<AvailabilityReport>>, ApiError> {
    let items = req
        .items
        .iter()
        .map(|item| {
            let product_id = ProductId::from_uuid(parse_uuid("product_id", &item.product_id)?);
            Ok(ReservationRequest::new(
                StockUnitKey::new(product_id, item.color_id, item.size_id),
                item.quantity,
            ))
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    Ok(Json(state.orders.check_stock_availability(&items).await?))
}
