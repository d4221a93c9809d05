//! HTTP API server for the purchase saga orchestrator.
//!
//! Provides REST endpoints to start, inspect and cancel purchase sagas,
//! with structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{Collaborators, PurchaseService, SagaOrchestrator, SimulatedCommerce, WorkerPool};
use saga_store::SagaStore;
use service_client::{ClientConfig, InMemoryTransport, ServiceClient};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;

/// Shared application state accessible from all handlers.
pub struct AppState<S: SagaStore + 'static> {
    pub purchases: PurchaseService<S>,
    /// The client behind the saga's collaborators, for breaker health.
    pub client: Arc<ServiceClient>,
}

impl<S: SagaStore + 'static> AppState<S> {
    /// Wires the orchestrator and worker pool over `store` and `client`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(store: S, client: Arc<ServiceClient>, config: &Config) -> Self {
        let orchestrator = SagaOrchestrator::new(
            store,
            Collaborators::remote(client.clone()),
            config.orchestrator_config(),
        );
        Self {
            purchases: PurchaseService::new(orchestrator, WorkerPool::new(config.pool_config())),
            client,
        }
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: SagaStore + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route("/sagas", post(routes::sagas::start::<S>))
        .route("/sagas/{id}", get(routes::sagas::get::<S>))
        .route("/sagas/{id}/cancel", post(routes::sagas::cancel::<S>))
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

/// A client whose calls are answered in-process by `sim`.
pub fn simulated_client(sim: &SimulatedCommerce, config: ClientConfig) -> Arc<ServiceClient> {
    let transport = InMemoryTransport::new();
    sim.install(&transport);
    Arc::new(ServiceClient::new(
        Arc::new(transport),
        Arc::new(SimulatedCommerce::registry()),
        config,
    ))
}
