use async_trait::async_trait;
use common::SagaId;

use crate::{CompensationRecord, Result, Saga, SagaState, SagaStep};

/// Core trait for saga store implementations.
///
/// Every mutating operation is an atomic compare-and-set against the saga's
/// current state. A writer that lost the race gets
/// [`StoreError::ConcurrentModification`](crate::StoreError::ConcurrentModification)
/// and is expected to stop driving the saga.
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Persists a new saga.
    ///
    /// Fails with `AlreadyExists` if the saga ID is taken, which is what makes
    /// starting a saga idempotent.
    async fn create(&self, saga: Saga) -> Result<()>;

    /// Records the result of `step` and moves the saga to `new_state`.
    ///
    /// The saga must currently be in the step's prerequisite state and hold no
    /// result for the step. Returns the updated saga.
    async fn update_step(
        &self,
        saga_id: &SagaId,
        step: SagaStep,
        result: String,
        new_state: SagaState,
    ) -> Result<Saga>;

    /// Moves the saga from `expected` to `new_state` for transitions that
    /// carry no step result (finalize, start or finish compensation).
    async fn transition(
        &self,
        saga_id: &SagaId,
        expected: SagaState,
        new_state: SagaState,
        last_error: Option<String>,
    ) -> Result<Saga>;

    /// Appends a compensation record to a compensating saga.
    async fn record_compensation(
        &self,
        saga_id: &SagaId,
        record: CompensationRecord,
    ) -> Result<Saga>;

    /// Loads a saga. Fails only with `NotFound`.
    async fn get(&self, saga_id: &SagaId) -> Result<Saga>;

    /// Lists sagas that have not reached a terminal state, oldest first.
    async fn list_unfinished(&self) -> Result<Vec<Saga>>;
}
