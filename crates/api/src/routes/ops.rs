//! Liveness and Prometheus endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use resilience::{CircuitState, Retrier};
use serde::Serialize;
use store::FulfillmentStore;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Circuit state per remote dependency.
    pub dependencies: BTreeMap<String, &'static str>,
}

/// GET /health: always 200 while the process serves requests. Reports
/// `degraded` when any dependency circuit is not closed.
pub async fn health<S: FulfillmentStore>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<HealthResponse> {
    let mut dependencies = BTreeMap::new();
    let mut degraded = false;
    for retrier in [&state.guards.payment, &state.guards.shipment] {
        if let Some((name, circuit)) = breaker_state(retrier) {
            degraded |= circuit != CircuitState::Closed;
            dependencies.insert(name, circuit.as_str());
        }
    }

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" },
        dependencies,
    })
}

fn breaker_state(retrier: &Retrier) -> Option<(String, CircuitState)> {
    retrier
        .circuit_breaker()
        .map(|breaker| (breaker.name().to_string(), breaker.state()))
}

/// GET /metrics: Prometheus text exposition.
pub async fn metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        handle.render(),
    )
}
