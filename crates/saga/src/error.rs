//! Saga error types.

use common::SagaId;
use saga_store::{SagaState, StoreError};
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The start request is malformed; nothing was created.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("saga not found: {0}")]
    NotFound(SagaId),

    /// The saga is not in a state that allows the requested operation.
    #[error("saga {saga_id} is {state}, operation not allowed")]
    InvalidState { saga_id: SagaId, state: SagaState },

    /// The saga ID was already used with different inputs.
    #[error("saga {0} already exists with different inputs")]
    IdempotencyConflict(SagaId),

    /// The worker pool queue is full; nothing was created.
    #[error("orchestrator overloaded, try again later")]
    Overloaded,

    /// A forward step failed after exhausting its retries.
    #[error("step '{step}' failed: {cause}")]
    StepFailed { step: &'static str, cause: String },

    /// A compensating action failed after exhausting its retries.
    #[error("compensation '{action}' failed: {cause}")]
    CompensationFailed { action: &'static str, cause: String },

    /// Another writer advanced the saga first.
    #[error("saga {0} was modified concurrently")]
    ConcurrentModification(SagaId),

    #[error("saga store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for SagaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(saga_id) => SagaError::NotFound(saga_id),
            StoreError::ConcurrentModification { saga_id, .. } => {
                SagaError::ConcurrentModification(saga_id)
            }
            other => SagaError::Store(other),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
