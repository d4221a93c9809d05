//! The persisted saga record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{PurchaseInput, SagaId};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::state::{CompensationAction, SagaState, SagaStep};

/// Outcome of one compensating call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompensationOutcome {
    Succeeded,
    Failed { reason: String },
}

/// A compensating action the orchestrator issued, kept for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationRecord {
    pub action: CompensationAction,
    /// Remote ID the action targeted (order ID or payment ID).
    pub target_id: String,
    pub outcome: CompensationOutcome,
    pub recorded_at: DateTime<Utc>,
}

impl CompensationRecord {
    pub fn succeeded(action: CompensationAction, target_id: impl Into<String>) -> Self {
        Self {
            action,
            target_id: target_id.into(),
            outcome: CompensationOutcome::Succeeded,
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(
        action: CompensationAction,
        target_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            action,
            target_id: target_id.into(),
            outcome: CompensationOutcome::Failed {
                reason: reason.into(),
            },
            recorded_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == CompensationOutcome::Succeeded
    }
}

/// One purchase attempt.
///
/// Mutations go through [`Saga::record_step`], [`Saga::transition`] and
/// [`Saga::push_compensation`], which enforce the state machine: states only
/// move forward or sideways into compensation, a step result is written in the
/// same update that advances the state, and terminal sagas never change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Saga {
    saga_id: SagaId,
    input: PurchaseInput,
    state: SagaState,
    step_results: BTreeMap<SagaStep, String>,
    #[serde(default)]
    compensations: Vec<CompensationRecord>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl Saga {
    /// Creates a new saga in the `STARTED` state.
    pub fn new(saga_id: SagaId, input: PurchaseInput) -> Self {
        let now = Utc::now();
        Self {
            saga_id,
            input,
            state: SagaState::Started,
            step_results: BTreeMap::new(),
            compensations: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Records a successful step and advances the state in one update.
    pub fn record_step(
        &mut self,
        step: SagaStep,
        result: impl Into<String>,
        new_state: SagaState,
    ) -> Result<()> {
        if new_state != step.completion() {
            return Err(StoreError::InvalidTransition {
                saga_id: self.saga_id.clone(),
                from: self.state,
                to: new_state,
            });
        }
        let expected = step.prerequisite();
        if self.state != expected || self.step_results.contains_key(&step) {
            return Err(self.conflict(expected));
        }
        self.step_results.insert(step, result.into());
        self.state = new_state;
        self.last_error = None;
        self.touch();
        Ok(())
    }

    /// Moves the saga from `expected` to `new_state` outside a step, e.g.
    /// `SHIPPED -> COMPLETED` or `* -> COMPENSATING`.
    ///
    /// `last_error` replaces the stored error when given.
    pub fn transition(
        &mut self,
        expected: SagaState,
        new_state: SagaState,
        last_error: Option<String>,
    ) -> Result<()> {
        if self.state != expected {
            return Err(self.conflict(expected));
        }
        let is_step_state = SagaStep::ALL.iter().any(|s| s.completion() == new_state);
        if !expected.can_transition_to(new_state) || is_step_state {
            return Err(StoreError::InvalidTransition {
                saga_id: self.saga_id.clone(),
                from: expected,
                to: new_state,
            });
        }
        self.state = new_state;
        if last_error.is_some() {
            self.last_error = last_error;
        }
        self.touch();
        Ok(())
    }

    /// Appends a compensation record. Only legal while compensating.
    pub fn push_compensation(&mut self, record: CompensationRecord) -> Result<()> {
        if self.state != SagaState::Compensating {
            return Err(self.conflict(SagaState::Compensating));
        }
        self.compensations.push(record);
        self.touch();
        Ok(())
    }

    fn conflict(&self, expected: SagaState) -> StoreError {
        StoreError::ConcurrentModification {
            saga_id: self.saga_id.clone(),
            expected,
            actual: self.state,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version += 1;
    }
}

// Query methods
impl Saga {
    pub fn saga_id(&self) -> &SagaId {
        &self.saga_id
    }

    /// Returns the inputs captured at start.
    pub fn input(&self) -> &PurchaseInput {
        &self.input
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    /// Returns the step results in step order.
    pub fn step_results(&self) -> &BTreeMap<SagaStep, String> {
        &self.step_results
    }

    /// Returns the recorded result of one step, if it succeeded.
    pub fn step_result(&self, step: SagaStep) -> Option<&str> {
        self.step_results.get(&step).map(String::as_str)
    }

    pub fn order_id(&self) -> Option<&str> {
        self.step_result(SagaStep::Order)
    }

    pub fn payment_id(&self) -> Option<&str> {
        self.step_result(SagaStep::Payment)
    }

    pub fn shipping_id(&self) -> Option<&str> {
        self.step_result(SagaStep::Shipping)
    }

    /// Returns the compensations issued so far, in issue order.
    pub fn compensations(&self) -> &[CompensationRecord] {
        &self.compensations
    }

    /// Returns true if `action` already succeeded for this saga.
    pub fn compensation_succeeded(&self, action: CompensationAction) -> bool {
        self.compensations
            .iter()
            .any(|c| c.action == action && c.is_success())
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Monotonic mutation counter, used as the compare-and-set token.
    pub fn version(&self) -> i64 {
        self.version
    }
}
