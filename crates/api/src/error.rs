//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::SagaError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Bad request from the client.
    BadRequest(String),
    /// Saga operation error.
    Saga(SagaError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
        };

        metrics::counter!("http_errors_total", "status" => status.as_str().to_owned())
            .increment(1);
        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    let status = match &err {
        SagaError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
        SagaError::NotFound(_) => StatusCode::NOT_FOUND,
        SagaError::InvalidState { .. }
        | SagaError::IdempotencyConflict(_)
        | SagaError::ConcurrentModification(_) => StatusCode::CONFLICT,
        SagaError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
        SagaError::StepFailed { .. }
        | SagaError::CompensationFailed { .. }
        | SagaError::Store(_) => {
            tracing::error!(error = %err, "internal server error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SagaId;
    use saga_store::SagaState;

    fn status_of(err: SagaError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_status_mapping() {
        let id = SagaId::parse("s1").unwrap();
        assert_eq!(
            status_of(SagaError::ValidationFailed("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_of(SagaError::NotFound(id.clone())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(SagaError::InvalidState {
                saga_id: id.clone(),
                state: SagaState::Shipped,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(SagaError::IdempotencyConflict(id)),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(SagaError::Overloaded),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(SagaError::StepFailed {
                step: "order",
                cause: "boom".into(),
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
