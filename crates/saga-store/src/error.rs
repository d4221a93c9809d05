use common::SagaId;
use thiserror::Error;

use crate::state::SagaState;

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A saga with this ID was already created.
    #[error("Saga already exists: {0}")]
    AlreadyExists(SagaId),

    /// No saga is stored under this ID.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// Another writer moved the saga away from the state this update expected.
    #[error(
        "Concurrent modification of saga {saga_id}: expected state {expected}, found {actual}"
    )]
    ConcurrentModification {
        saga_id: SagaId,
        expected: SagaState,
        actual: SagaState,
    },

    /// The requested state change is not a legal saga transition.
    #[error("Invalid transition for saga {saga_id}: {from} -> {to}")]
    InvalidTransition {
        saga_id: SagaId,
        from: SagaState,
        to: SagaState,
    },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
