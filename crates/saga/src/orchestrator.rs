//! Saga orchestrator driving one purchase through its steps.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use common::SagaId;
use saga_store::{
    CompensationAction, CompensationRecord, Saga, SagaState, SagaStep, SagaStore, StoreError,
};
use tokio::time::Instant;

use crate::error::{Result, SagaError};
use crate::services::{CallError, Collaborators};

/// `last_error` of a saga stopped by its caller.
pub const CANCELLED_BY_CALLER: &str = "cancelled by caller";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound for one step, including all of its retries.
    pub step_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(15),
        }
    }
}

type CompensationLocks = Mutex<HashMap<SagaId, Arc<tokio::sync::Mutex<()>>>>;

/// Orchestrates purchase sagas.
///
/// The orchestrator drives a saga from whatever state the store holds:
/// validate user, create order, capture payment, create shipment. Every step
/// result is recorded before the next step starts. When a step fails the saga
/// moves to `COMPENSATING` and every step that already succeeded is undone in
/// reverse order before the saga ends `FAILED`.
///
/// Compensation of one saga runs under a per-saga lock, so a cancel and a
/// worker task reaching `COMPENSATING` together issue each remote
/// compensation once.
pub struct SagaOrchestrator<S>
where
    S: SagaStore,
{
    store: S,
    collaborators: Collaborators,
    config: OrchestratorConfig,
    compensation_locks: CompensationLocks,
}

impl<S> SagaOrchestrator<S>
where
    S: SagaStore,
{
    pub fn new(store: S, collaborators: Collaborators, config: OrchestratorConfig) -> Self {
        Self {
            store,
            collaborators,
            config,
            compensation_locks: Mutex::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Drives the saga until it is `COMPLETED` or `FAILED`.
    ///
    /// Safe to call on a saga that was interrupted: completed steps are never
    /// executed again and recorded compensations are not repeated. Returns
    /// [`SagaError::ConcurrentModification`] if another writer took over.
    #[tracing::instrument(skip(self), fields(saga_id = %saga_id))]
    pub async fn run(&self, saga_id: &SagaId) -> Result<Saga> {
        let mut saga = self.store.get(saga_id).await?;
        if saga.state() != SagaState::Started && !saga.state().is_terminal() {
            tracing::info!(state = %saga.state(), "resuming saga");
            metrics::counter!("saga_resumed_total").increment(1);
        }

        loop {
            saga = match saga.state() {
                SagaState::Completed | SagaState::Failed => return Ok(saga),
                SagaState::Compensating => self.compensate(saga).await?,
                SagaState::Shipped => self.complete(saga).await?,
                state => match state.next_step() {
                    Some(step) => self.advance(saga, step).await?,
                    None => return Ok(saga),
                },
            };
        }
    }

    /// Cancels a saga that has not captured payment yet.
    ///
    /// The saga moves to `COMPENSATING`, its order (if any) is cancelled and
    /// it ends `FAILED`.
    #[tracing::instrument(skip(self), fields(saga_id = %saga_id))]
    pub async fn cancel(&self, saga_id: &SagaId) -> Result<Saga> {
        loop {
            let saga = self.store.get(saga_id).await?;
            let state = saga.state();
            if !state.is_cancellable() {
                return Err(SagaError::InvalidState {
                    saga_id: saga_id.clone(),
                    state,
                });
            }

            match self
                .store
                .transition(
                    saga_id,
                    state,
                    SagaState::Compensating,
                    Some(CANCELLED_BY_CALLER.to_string()),
                )
                .await
            {
                Ok(saga) => {
                    tracing::info!(from = %state, "saga cancelled by caller");
                    metrics::counter!("saga_cancelled_total").increment(1);
                    return self.compensate(saga).await;
                }
                // The saga advanced under us; re-check the cancellable window.
                Err(StoreError::ConcurrentModification { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn advance(&self, saga: Saga, step: SagaStep) -> Result<Saga> {
        if step == SagaStep::Order {
            if let Err(failure) = self.validate_user(&saga).await {
                return self.begin_compensation(&saga, failure).await;
            }
        }

        tracing::info!(%step, "saga step started");
        let started = Instant::now();
        let outcome = self.execute_step(&saga, step).await;
        metrics::histogram!("saga_step_duration_seconds", "step" => step.as_str())
            .record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(result) => self.record_step(&saga, step, result).await,
            Err(failure) => self.begin_compensation(&saga, failure).await,
        }
    }

    async fn validate_user(&self, saga: &Saga) -> Result<()> {
        let user_id = saga.input().user_id;
        let call = self.collaborators.users.validate_user(user_id);
        match tokio::time::timeout(self.config.step_timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) if err.rejection_code() == Some(404) => Err(SagaError::ValidationFailed(
                format!("user {user_id} not found"),
            )),
            Ok(Err(err)) => Err(SagaError::StepFailed {
                step: "validate_user",
                cause: err.to_string(),
            }),
            Err(_) => Err(self.step_timed_out("validate_user")),
        }
    }

    async fn execute_step(&self, saga: &Saga, step: SagaStep) -> Result<String> {
        let call = self.call_step(saga, step);
        match tokio::time::timeout(self.config.step_timeout, call).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(SagaError::StepFailed {
                step: step.as_str(),
                cause: err.to_string(),
            }),
            Err(_) => Err(self.step_timed_out(step.as_str())),
        }
    }

    async fn call_step(
        &self,
        saga: &Saga,
        step: SagaStep,
    ) -> std::result::Result<String, CallError> {
        let input = saga.input();
        match step {
            SagaStep::Order => {
                self.collaborators
                    .orders
                    .create_order(input.user_id, &input.order)
                    .await
            }
            SagaStep::Payment => {
                self.collaborators
                    .payments
                    .capture_payment(
                        recorded_order_id(saga)?,
                        input.payment.method,
                        input.order.fee,
                    )
                    .await
            }
            SagaStep::Shipping => {
                self.collaborators
                    .shipping
                    .create_shipment(recorded_order_id(saga)?, &input.shipping.address)
                    .await
            }
        }
    }

    async fn record_step(&self, saga: &Saga, step: SagaStep, result: String) -> Result<Saga> {
        let saga_id = saga.saga_id();
        match self
            .store
            .update_step(saga_id, step, result.clone(), step.completion())
            .await
        {
            Ok(updated) => {
                tracing::info!(%step, %result, "saga step completed");
                Ok(updated)
            }
            Err(StoreError::ConcurrentModification { actual, .. }) => {
                tracing::warn!(%step, %result, %actual, "saga taken over while step ran");
                self.compensate_orphan(step, &result).await;
                Err(SagaError::ConcurrentModification(saga_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn begin_compensation(&self, saga: &Saga, failure: SagaError) -> Result<Saga> {
        tracing::warn!(state = %saga.state(), error = %failure, "saga step failed, compensating");
        let updated = self
            .store
            .transition(
                saga.saga_id(),
                saga.state(),
                SagaState::Compensating,
                Some(failure.to_string()),
            )
            .await?;
        Ok(updated)
    }

    /// Undoes every succeeded step in reverse order, then marks the saga
    /// `FAILED`. Compensations already recorded as succeeded are skipped.
    ///
    /// Waits for any other compensation of the same saga in this process and
    /// then works from the stored saga, which that one may have finished.
    async fn compensate(&self, saga: Saga) -> Result<Saga> {
        let saga_id = saga.saga_id().clone();
        let lock = self.compensation_lock(&saga_id);
        let result = {
            let _held = lock.lock().await;
            match self.store.get(&saga_id).await {
                Ok(current) if current.state() == SagaState::Compensating => {
                    self.compensate_exclusive(current).await
                }
                Ok(current) => {
                    tracing::debug!(state = %current.state(), "compensation already finished");
                    Ok(current)
                }
                Err(e) => Err(e.into()),
            }
        };
        self.release_compensation_lock(&saga_id, &lock);
        result
    }

    fn compensation_lock(&self, saga_id: &SagaId) -> Arc<tokio::sync::Mutex<()>> {
        self.compensation_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(saga_id.clone())
            .or_default()
            .clone()
    }

    fn release_compensation_lock(&self, saga_id: &SagaId, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .compensation_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Held by the map and by us only: nobody is waiting.
        if Arc::strong_count(lock) == 2 {
            locks.remove(saga_id);
        }
    }

    async fn compensate_exclusive(&self, saga: Saga) -> Result<Saga> {
        let saga_id = saga.saga_id().clone();
        let mut saga = saga;
        let mut compensation_failure = None;

        for step in SagaStep::ALL.iter().rev() {
            let Some(action) = step.compensation() else {
                continue;
            };
            let Some(target) = saga.step_result(*step).map(str::to_string) else {
                continue;
            };
            if saga.compensation_succeeded(action) {
                continue;
            }

            let record = match self.apply_compensation(action, &target).await {
                Ok(()) => {
                    tracing::info!(%action, %target, "compensation applied");
                    CompensationRecord::succeeded(action, &target)
                }
                Err(cause) => {
                    // Not retried further: needs an operator.
                    tracing::error!(
                        saga_id = %saga_id,
                        %action,
                        %target,
                        error = %cause,
                        "compensation failed, manual intervention required"
                    );
                    metrics::counter!("saga_compensation_failed_total", "action" => action.as_str())
                        .increment(1);
                    let failure = SagaError::CompensationFailed {
                        action: action.as_str(),
                        cause: cause.clone(),
                    };
                    compensation_failure.get_or_insert(failure.to_string());
                    CompensationRecord::failed(action, &target, cause)
                }
            };
            saga = self.store.record_compensation(&saga_id, record).await?;
        }

        let failed = self
            .store
            .transition(
                &saga_id,
                SagaState::Compensating,
                SagaState::Failed,
                compensation_failure,
            )
            .await?;

        metrics::counter!("saga_failed_total").increment(1);
        record_duration(&failed);
        tracing::warn!(
            error = failed.last_error().unwrap_or("unknown"),
            compensations = failed.compensations().len(),
            "saga failed"
        );
        Ok(failed)
    }

    async fn complete(&self, saga: Saga) -> Result<Saga> {
        let completed = self
            .store
            .transition(
                saga.saga_id(),
                SagaState::Shipped,
                SagaState::Completed,
                None,
            )
            .await?;

        metrics::counter!("saga_completed_total").increment(1);
        record_duration(&completed);
        tracing::info!("saga completed successfully");
        Ok(completed)
    }

    async fn apply_compensation(
        &self,
        action: CompensationAction,
        target: &str,
    ) -> std::result::Result<(), String> {
        let call = async {
            match action {
                CompensationAction::CancelOrder => {
                    self.collaborators.orders.cancel_order(target).await
                }
                CompensationAction::RefundPayment => {
                    self.collaborators.payments.refund_payment(target).await
                }
            }
        };
        match tokio::time::timeout(self.config.step_timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!(
                "timed out after {}ms",
                self.config.step_timeout.as_millis()
            )),
        }
    }

    /// Undoes a side effect this task produced but could not record because
    /// another writer advanced the saga first.
    async fn compensate_orphan(&self, step: SagaStep, result: &str) {
        metrics::counter!("saga_orphaned_steps_total", "step" => step.as_str()).increment(1);
        let Some(action) = step.compensation() else {
            tracing::error!(
                %step,
                %result,
                "orphaned step has no compensation, manual cleanup required"
            );
            return;
        };
        match self.apply_compensation(action, result).await {
            Ok(()) => tracing::warn!(%step, %result, %action, "orphaned step compensated"),
            Err(cause) => tracing::error!(
                %step,
                %result,
                %action,
                error = %cause,
                "orphaned step compensation failed, manual cleanup required"
            ),
        }
    }

    fn step_timed_out(&self, step: &'static str) -> SagaError {
        SagaError::StepFailed {
            step,
            cause: format!(
                "timed out after {}ms",
                self.config.step_timeout.as_millis()
            ),
        }
    }
}

fn recorded_order_id(saga: &Saga) -> std::result::Result<&str, CallError> {
    saga.order_id()
        .ok_or_else(|| CallError::InvalidResponse("no order recorded for this saga".to_string()))
}

fn record_duration(saga: &Saga) {
    let elapsed = (Utc::now() - saga.created_at())
        .to_std()
        .unwrap_or_default();
    metrics::histogram!("saga_duration_seconds").record(elapsed.as_secs_f64());
}
