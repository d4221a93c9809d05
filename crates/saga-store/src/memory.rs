use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use async_trait::async_trait;
use common::SagaId;
use tokio::sync::RwLock;

use crate::{CompensationRecord, Result, Saga, SagaState, SagaStep, SagaStore, StoreError};

/// In-memory saga store.
///
/// Every update checks the state the caller expects against the stored saga
/// under the write lock, so read, check and write happen as one step. The
/// PostgreSQL store instead checks `version` between its read and its write,
/// and can also reject a writer whose read went stale in that window.
/// Nothing survives a process restart.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    sagas: Arc<RwLock<HashMap<SagaId, Saga>>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory saga store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of sagas stored.
    pub async fn saga_count(&self) -> usize {
        self.sagas.read().await.len()
    }

    /// Applies `mutate` to a copy of the saga and swaps it in only on success.
    async fn modify<F>(&self, saga_id: &SagaId, mutate: F) -> Result<Saga>
    where
        F: FnOnce(&mut Saga) -> Result<()>,
    {
        let mut sagas = self.sagas.write().await;
        let current = sagas
            .get_mut(saga_id)
            .ok_or_else(|| StoreError::NotFound(saga_id.clone()))?;
        let mut updated = current.clone();
        mutate(&mut updated)?;
        *current = updated.clone();
        Ok(updated)
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn create(&self, saga: Saga) -> Result<()> {
        let mut sagas = self.sagas.write().await;
        match sagas.entry(saga.saga_id().clone()) {
            Entry::Occupied(entry) => Err(StoreError::AlreadyExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(saga);
                Ok(())
            }
        }
    }

    async fn update_step(
        &self,
        saga_id: &SagaId,
        step: SagaStep,
        result: String,
        new_state: SagaState,
    ) -> Result<Saga> {
        self.modify(saga_id, |saga| saga.record_step(step, result, new_state))
            .await
    }

    async fn transition(
        &self,
        saga_id: &SagaId,
        expected: SagaState,
        new_state: SagaState,
        last_error: Option<String>,
    ) -> Result<Saga> {
        self.modify(saga_id, |saga| {
            saga.transition(expected, new_state, last_error)
        })
        .await
    }

    async fn record_compensation(
        &self,
        saga_id: &SagaId,
        record: CompensationRecord,
    ) -> Result<Saga> {
        self.modify(saga_id, |saga| saga.push_compensation(record))
            .await
    }

    async fn get(&self, saga_id: &SagaId) -> Result<Saga> {
        self.sagas
            .read()
            .await
            .get(saga_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(saga_id.clone()))
    }

    async fn list_unfinished(&self) -> Result<Vec<Saga>> {
        let sagas = self.sagas.read().await;
        let mut unfinished: Vec<Saga> = sagas
            .values()
            .filter(|s| !s.state().is_terminal())
            .cloned()
            .collect();
        unfinished.sort_by_key(|s| s.created_at());
        Ok(unfinished)
    }
}
