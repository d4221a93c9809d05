//! API server entry point.

use std::sync::Arc;

use api::config::{Config, LogFormat};
use saga::SimulatedCommerce;
use saga_store::{InMemorySagaStore, PostgresSagaStore, SagaStore};
use service_client::{
    CachedRegistry, EurekaRegistry, HttpTransport, ServiceClient, ServiceRegistry, StaticRegistry,
};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
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

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Builds the client the saga's collaborators share.
fn build_client(config: &Config) -> Arc<ServiceClient> {
    if config.simulate_downstream {
        tracing::warn!("SIMULATE_DOWNSTREAM is set, downstream services are simulated in-process");
        return api::simulated_client(&SimulatedCommerce::new(), config.client_config());
    }

    let registry: Arc<dyn ServiceRegistry> = match &config.eureka_url {
        Some(url) => {
            tracing::info!(%url, "resolving services through Eureka");
            let eureka = EurekaRegistry::new(url.as_str(), config.call_timeout)
                .expect("failed to build Eureka client");
            Arc::new(CachedRegistry::new(eureka, config.registry_ttl))
        }
        None => {
            let registry = StaticRegistry::new();
            for (service, urls) in config.static_instances() {
                for url in urls {
                    registry.register(service, url);
                }
                tracing::info!(service, ?urls, "static service instances");
            }
            Arc::new(registry)
        }
    };

    let transport = HttpTransport::new(config.call_timeout).expect("failed to build HTTP client");
    Arc::new(ServiceClient::new(
        Arc::new(transport),
        registry,
        config.client_config(),
    ))
}

async fn serve<S: SagaStore + 'static>(
    store: S,
    client: Arc<ServiceClient>,
    config: &Config,
    metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
) {
    let state = Arc::new(api::AppState::new(store, client, config));

    // Pick up sagas interrupted by the previous shutdown
    let recovered = state
        .purchases
        .recover_unfinished()
        .await
        .expect("saga recovery failed");
    tracing::info!(recovered, "saga recovery finished");

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
}

#[tokio::main]
async fn main() {
    // 1. Load configuration
    let config = Config::from_env().expect("invalid configuration");

    // 2. Initialize tracing
    init_tracing(&config);

    // 3. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 4. Downstream services
    let client = build_client(&config);

    // 5. Saga store, then serve until shutdown
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(u32::try_from(config.workers).unwrap_or(u32::MAX).max(5))
                .connect(url)
                .await
                .expect("failed to connect to PostgreSQL");
            let store = PostgresSagaStore::new(pool);
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL saga store");
            serve(store, client, &config, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, sagas are kept in memory only");
            serve(InMemorySagaStore::new(), client, &config, metrics_handle).await;
        }
    }

    tracing::info!("server shut down gracefully");
}
