//! Health check endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use saga_store::SagaStore;
use serde::Serialize;
use service_client::BreakerState;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` while any breaker is not closed.
    pub status: &'static str,
    pub breakers: BTreeMap<String, BreakerState>,
    pub pool: PoolStatus,
}

#[derive(Serialize)]
pub struct PoolStatus {
    pub running: usize,
    pub queued: usize,
}

/// GET /health: returns system health and the breaker state of every
/// downstream service.
pub async fn check<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<HealthResponse> {
    let mut breakers = state.client.breaker_states();
    for service in saga::services::ALL_SERVICES {
        breakers
            .entry(service.to_string())
            .or_insert(BreakerState::Closed);
    }
    let status = if breakers.values().all(|b| *b == BreakerState::Closed) {
        "ok"
    } else {
        "degraded"
    };

    let pool = state.purchases.pool();
    Json(HealthResponse {
        status,
        breakers,
        pool: PoolStatus {
            running: pool.running(),
            queued: pool.queued(),
        },
    })
}
