//! HTTP API server for order fulfillment.
//!
//! Exposes order creation, payment retry, shipment creation and stock
//! availability over REST, with structured logging (tracing), Prometheus
//! metrics and a background maintenance worker.

pub mod config;
pub mod error;
pub mod routes;
pub mod worker;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use fulfillment::services::{CatalogService, CheckoutService, PaymentGateway, ShipmentProvider};
use fulfillment::{
    DependencyGuards, FulfillmentPolicy, OrderOrchestrator, Reconciler, ShipmentSynchronizer,
};
use metrics_exporter_prometheus::PrometheusHandle;
use store::FulfillmentStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub type SharedCheckout = Arc<dyn CheckoutService>;
pub type SharedCatalog = Arc<dyn CatalogService>;
pub type SharedPayment = Arc<dyn PaymentGateway>;
pub type SharedProvider = Arc<dyn ShipmentProvider>;

/// The services the orchestrators call out to.
#[derive(Clone)]
pub struct Collaborators {
    pub checkout: SharedCheckout,
    pub catalog: SharedCatalog,
    pub payment: SharedPayment,
    pub provider: SharedProvider,
}

/// Shared application state accessible from all handlers.
pub struct AppState<S> {
    pub guards: DependencyGuards,
    pub orders: OrderOrchestrator<S, SharedCheckout, SharedCatalog, SharedPayment>,
    pub shipments: ShipmentSynchronizer<S, SharedPayment, SharedProvider>,
    pub reconciler: Reconciler<S, SharedPayment, SharedProvider>,
}

/// Wires the orchestrators around one store and one set of dependency guards.
pub fn create_state<S: FulfillmentStore>(
    store: S,
    collaborators: Collaborators,
    guards: DependencyGuards,
    policy: FulfillmentPolicy,
) -> Arc<AppState<S>> {
    let Collaborators {
        checkout,
        catalog,
        payment,
        provider,
    } = collaborators;

    Arc::new(AppState {
        guards: guards.clone(),
        orders: OrderOrchestrator::new(
            store.clone(),
            checkout,
            catalog,
            payment.clone(),
            guards.clone(),
            policy.clone(),
        ),
        shipments: ShipmentSynchronizer::new(
            store.clone(),
            payment.clone(),
            provider.clone(),
            guards.clone(),
            policy,
        ),
        reconciler: Reconciler::new(store, payment, provider, guards),
    })
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: FulfillmentStore>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::ops::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::ops::health::<S>))
        .route("/orders", post(routes::orders::create::<S>))
        .route("/orders/{id}", get(routes::orders::get::<S>))
        .route(
            "/orders/{id}/payment/retry",
            post(routes::orders::retry_payment::<S>),
        )
        .route(
            "/orders/{id}/payment/result",
            post(routes::orders::payment_result::<S>),
        )
        .route(
            "/orders/{id}/shipment",
            post(routes::shipments::create::<S>).delete(routes::shipments::cancel::<S>),
        )
        .route(
            "/orders/{id}/shipment/tracking",
            get(routes::shipments::tracking::<S>),
        )
        .route("/shipments/invoice", post(routes::shipments::invoice::<S>))
        .route(
            "/stock/availability",
            post(routes::stock::availability::<S>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
