//! API server entry point.

use std::sync::Arc;

use api::config::Config;
use api::{Collaborators, SharedProvider};
use fulfillment::DependencyGuards;
use fulfillment::services::{
    HttpShipmentConfig, HttpShipmentProvider, InMemoryCatalog, InMemoryCheckoutService,
    InMemoryPaymentGateway, InMemoryShipmentProvider,
};
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::postgres::PgPoolOptions;
use store::{FulfillmentStore, InMemoryStore, PostgresStore};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn shipment_provider(config: &Config) -> SharedProvider {
    match &config.shipment_api {
        Some(api) => {
            let provider = HttpShipmentProvider::new(HttpShipmentConfig::new(
                api.base_url.as_str(),
                api.email.as_str(),
                api.password.as_str(),
            ))
            .expect("failed to build shipment provider client");
            tracing::info!(base_url = %api.base_url, "using HTTP shipment provider");
            Arc::new(provider)
        }
        None => {
            tracing::warn!("SHIPMENT_API_URL not set, using in-memory shipment provider");
            Arc::new(InMemoryShipmentProvider::new())
        }
    }
}

async fn serve<S: FulfillmentStore>(store: S, config: Config, metrics_handle: PrometheusHandle) {
    // Checkout, catalog and payment belong to neighbouring services; this
    // binary runs against local stand-ins for them.
    let collaborators = Collaborators {
        checkout: Arc::new(InMemoryCheckoutService::new()),
        catalog: Arc::new(InMemoryCatalog::new()),
        payment: Arc::new(InMemoryPaymentGateway::new()),
        provider: shipment_provider(&config),
    };
    let guards = DependencyGuards::new(config.retry_policy(), config.breaker_config());
    let state = api::create_state(store, collaborators, guards, config.policy());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = api::worker::spawn(state.clone(), config.maintenance_interval(), shutdown_rx);

    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    let _ = shutdown_tx.send(true);
    if let Err(e) = worker.await {
        tracing::error!(error = %e, "maintenance worker panicked");
    }
    tracing::info!("server shut down gracefully");
}

#[tokio::main]
async fn main() {
    let config = Config::from_env().expect("invalid configuration");

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Pick the store and serve
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .expect("failed to connect to PostgreSQL");
            let store = PostgresStore::new(pool);
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL store");
            serve(store, config, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            serve(InMemoryStore::new(), config, metrics_handle).await;
        }
    }
}
