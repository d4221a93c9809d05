//! Purchase saga endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{
    Money, OrderPayload, PaymentMethod, PaymentPayload, PurchaseInput, SagaId, ShippingPayload,
    UserId,
};
use saga::{SagaStatus, StartPurchase};
use saga_store::{SagaState, SagaStore};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Debug, Deserialize)]
pub struct StartSagaRequest {
    #[serde(default)]
    pub saga_id: Option<String>,
    pub user_id: i64,
    pub order: OrderRequest,
    pub payment_method: PaymentMethod,
    pub shipping_address: String,
}

#[derive(Debug, Deserialize)]
pub struct OrderRequest {
    pub sku: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Decimal amount, e.g. `8999.99`.
    pub fee: f64,
}

impl StartSagaRequest {
    fn into_command(self) -> Result<StartPurchase, ApiError> {
        let fee = Money::from_decimal(self.order.fee)
            .ok_or_else(|| ApiError::BadRequest("order.fee: must be a finite amount".into()))?;
        Ok(StartPurchase {
            saga_id: self.saga_id,
            input: PurchaseInput {
                user_id: UserId::new(self.user_id),
                order: OrderPayload {
                    sku: self.order.sku,
                    description: self.order.description,
                    fee,
                },
                payment: PaymentPayload {
                    method: self.payment_method,
                },
                shipping: ShippingPayload {
                    address: self.shipping_address,
                },
            },
        })
    }
}

// -- Response types --

#[derive(Serialize)]
pub struct SagaStateResponse {
    pub saga_id: SagaId,
    pub state: SagaState,
}

impl From<SagaStatus> for SagaStateResponse {
    fn from(status: SagaStatus) -> Self {
        Self {
            saga_id: status.saga_id,
            state: status.state,
        }
    }
}

// -- Handlers --

/// POST /sagas: start (or idempotently re-submit) a purchase saga.
#[tracing::instrument(skip(state, payload))]
pub async fn start<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    payload: Result<Json<StartSagaRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SagaStateResponse>), ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let status = state
        .purchases
        .start_purchase(request.into_command()?)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(status.into())))
}

/// GET /sagas/{id}: current state, step results and compensations.
#[tracing::instrument(skip(state))]
pub async fn get<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaStatus>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let status = state.purchases.get_saga_status(&saga_id).await?;
    Ok(Json(status))
}

/// POST /sagas/{id}/cancel: cancel a saga that has not captured payment.
#[tracing::instrument(skip(state))]
pub async fn cancel<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaStateResponse>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let status = state.purchases.cancel_saga(&saga_id).await?;
    Ok(Json(status.into()))
}

fn parse_saga_id(id: &str) -> Result<SagaId, ApiError> {
    SagaId::parse(id).map_err(|e| ApiError::BadRequest(format!("Invalid saga id: {e}")))
}
