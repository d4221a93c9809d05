use async_trait::async_trait;
use common::SagaId;
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{CompensationRecord, Result, Saga, SagaState, SagaStep, SagaStore, StoreError};

/// PostgreSQL-backed saga store.
///
/// Each saga is one row. Updates are optimistic: the row is read, the change
/// is applied in memory through [`Saga`]'s state machine, and written back with
/// `WHERE version = $expected`. Losing that race surfaces as
/// `ConcurrentModification`.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_saga(row: PgRow) -> Result<Saga> {
        let document: serde_json::Value = row.try_get("document")?;
        Ok(serde_json::from_value(document)?)
    }

    async fn fetch(&self, saga_id: &SagaId) -> Result<Option<Saga>> {
        let row = sqlx::query("SELECT document FROM sagas WHERE saga_id = $1")
            .bind(saga_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_saga).transpose()
    }

    async fn modify<F>(&self, saga_id: &SagaId, mutate: F) -> Result<Saga>
    where
        F: FnOnce(&mut Saga) -> Result<()> + Send,
    {
        let current = self
            .fetch(saga_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(saga_id.clone()))?;
        let expected_version = current.version();
        let expected_state = current.state();

        let mut updated = current;
        mutate(&mut updated)?;
        let document = serde_json::to_value(&updated)?;

        let result = sqlx::query(
            r#"
            UPDATE sagas
            SET state = $2, version = $3, document = $4, updated_at = $5
            WHERE saga_id = $1 AND version = $6
            "#,
        )
        .bind(saga_id.as_str())
        .bind(updated.state().as_str())
        .bind(updated.version())
        .bind(document)
        .bind(updated.updated_at())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Someone else wrote between our read and our update.
            let actual = self
                .fetch(saga_id)
                .await?
                .map(|s| s.state())
                .unwrap_or(expected_state);
            metrics::counter!("saga_store_conflicts_total").increment(1);
            return Err(StoreError::ConcurrentModification {
                saga_id: saga_id.clone(),
                expected: expected_state,
                actual,
            });
        }

        Ok(updated)
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn create(&self, saga: Saga) -> Result<()> {
        let document = serde_json::to_value(&saga)?;
        let result = sqlx::query(
            r#"
            INSERT INTO sagas (saga_id, state, version, document, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (saga_id) DO NOTHING
            "#,
        )
        .bind(saga.saga_id().as_str())
        .bind(saga.state().as_str())
        .bind(saga.version())
        .bind(document)
        .bind(saga.created_at())
        .bind(saga.updated_at())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(saga.saga_id().clone()));
        }
        tracing::debug!(saga_id = %saga.saga_id(), "saga persisted");
        Ok(())
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
        self.fetch(saga_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(saga_id.clone()))
    }

    async fn list_unfinished(&self) -> Result<Vec<Saga>> {
        let rows = sqlx::query(
            r#"
            SELECT document
            FROM sagas
            WHERE state NOT IN ('COMPLETED', 'FAILED')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_saga).collect()
    }
}
