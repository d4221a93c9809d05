//! Transport-agnostic entry points for purchase sagas.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use common::{PurchaseInput, SagaId};
use saga_store::{CompensationRecord, Saga, SagaState, SagaStep, SagaStore, StoreError};
use serde::Serialize;

use crate::error::{Result, SagaError};
use crate::orchestrator::SagaOrchestrator;
use crate::pool::{PoolSlot, WorkerPool};

/// A request to start a purchase.
#[derive(Debug, Clone)]
pub struct StartPurchase {
    /// Caller-chosen saga ID, doubling as idempotency key. Generated when absent.
    pub saga_id: Option<String>,
    pub input: PurchaseInput,
}

/// Externally visible view of a saga.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SagaStatus {
    pub saga_id: SagaId,
    pub state: SagaState,
    pub step_results: BTreeMap<SagaStep, String>,
    pub last_error: Option<String>,
    pub compensations: Vec<CompensationRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Saga> for SagaStatus {
    fn from(saga: &Saga) -> Self {
        Self {
            saga_id: saga.saga_id().clone(),
            state: saga.state(),
            step_results: saga.step_results().clone(),
            last_error: saga.last_error().map(str::to_string),
            compensations: saga.compensations().to_vec(),
            created_at: saga.created_at(),
            updated_at: saga.updated_at(),
        }
    }
}

type InFlight = Arc<Mutex<HashSet<SagaId>>>;

/// Starts, inspects and cancels purchase sagas.
///
/// Sagas are driven on the [`WorkerPool`]; at most one task per saga ID runs
/// in this process at a time. Across processes the store's compare-and-set
/// decides which writer wins.
pub struct PurchaseService<S>
where
    S: SagaStore + 'static,
{
    orchestrator: Arc<SagaOrchestrator<S>>,
    pool: WorkerPool,
    in_flight: InFlight,
}

impl<S> PurchaseService<S>
where
    S: SagaStore + 'static,
{
    pub fn new(orchestrator: SagaOrchestrator<S>, pool: WorkerPool) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            pool,
            in_flight: Arc::default(),
        }
    }

    pub fn orchestrator(&self) -> &SagaOrchestrator<S> {
        &self.orchestrator
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Records a new saga and schedules it.
    ///
    /// Repeating a request with the same saga ID and the same input returns
    /// the existing saga without executing anything twice.
    #[tracing::instrument(skip(self, request), fields(saga_id))]
    pub async fn start_purchase(&self, request: StartPurchase) -> Result<SagaStatus> {
        request
            .input
            .validate()
            .map_err(|e| SagaError::ValidationFailed(e.to_string()))?;
        let saga_id = match request.saga_id {
            Some(raw) => {
                SagaId::parse(raw).map_err(|e| SagaError::ValidationFailed(e.to_string()))?
            }
            None => SagaId::generate(),
        };
        tracing::Span::current().record("saga_id", tracing::field::display(&saga_id));

        let slot = self.pool.try_reserve()?;
        let saga = Saga::new(saga_id.clone(), request.input);
        let status = SagaStatus::from(&saga);
        let input = saga.input().clone();

        match self.orchestrator.store().create(saga).await {
            Ok(()) => {
                metrics::counter!("saga_started_total").increment(1);
                tracing::info!("saga started");
                self.schedule(slot, saga_id);
                Ok(status)
            }
            Err(StoreError::AlreadyExists(_)) => {
                let existing = self.orchestrator.store().get(&saga_id).await?;
                if existing.input() != &input {
                    return Err(SagaError::IdempotencyConflict(saga_id));
                }
                tracing::info!(state = %existing.state(), "saga already exists");
                if !existing.state().is_terminal() {
                    self.schedule(slot, saga_id);
                }
                Ok(SagaStatus::from(&existing))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_saga_status(&self, saga_id: &SagaId) -> Result<SagaStatus> {
        let saga = self.orchestrator.store().get(saga_id).await?;
        Ok(SagaStatus::from(&saga))
    }

    /// Cancels a saga that has not captured payment yet and waits for its
    /// compensation to finish.
    pub async fn cancel_saga(&self, saga_id: &SagaId) -> Result<SagaStatus> {
        let saga = self.orchestrator.cancel(saga_id).await?;
        Ok(SagaStatus::from(&saga))
    }

    /// Schedules every saga the store holds in a non-terminal state.
    ///
    /// Run once at startup. Sagas that do not fit in the queue stay in the
    /// store and are picked up by the next recovery or start request.
    pub async fn recover_unfinished(&self) -> Result<usize> {
        let unfinished = self.orchestrator.store().list_unfinished().await?;
        let total = unfinished.len();
        let mut scheduled = 0;

        for saga in unfinished {
            let slot = match self.pool.try_reserve() {
                Ok(slot) => slot,
                Err(_) => {
                    tracing::warn!(
                        scheduled,
                        remaining = total - scheduled,
                        "worker pool full, deferring recovery"
                    );
                    break;
                }
            };
            if self.schedule(slot, saga.saga_id().clone()) {
                scheduled += 1;
            }
        }

        tracing::info!(scheduled, total, "recovered unfinished sagas");
        Ok(scheduled)
    }

    /// Submits a task driving `saga_id`, unless one is already in flight.
    fn schedule(&self, slot: PoolSlot<'_>, saga_id: SagaId) -> bool {
        let Some(guard) = InFlightGuard::claim(&self.in_flight, saga_id) else {
            return false;
        };
        let orchestrator = self.orchestrator.clone();

        slot.submit(async move {
            let saga_id = guard.saga_id.clone();
            match orchestrator.run(&saga_id).await {
                Ok(saga) => {
                    tracing::debug!(saga_id = %saga_id, state = %saga.state(), "saga task finished")
                }
                Err(SagaError::ConcurrentModification(_)) => {
                    tracing::info!(saga_id = %saga_id, "saga owned by another writer, task stopped")
                }
                Err(e) => tracing::error!(saga_id = %saga_id, error = %e, "saga task failed"),
            }
            drop(guard);
        });
        true
    }
}

/// Marks a saga as driven by a task in this process until dropped.
struct InFlightGuard {
    set: InFlight,
    saga_id: SagaId,
}

impl InFlightGuard {
    fn claim(set: &InFlight, saga_id: SagaId) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(saga_id.clone());
        inserted.then(|| Self {
            set: set.clone(),
            saga_id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.saga_id);
    }
}
