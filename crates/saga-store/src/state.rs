//! Saga state machine.

use serde::{Deserialize, Serialize};

/// The state of a purchase saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Started ──► OrderCreated ──► PaymentCaptured ──► Shipped ──► Completed
///    │             │                  │               │
///    └─────────────┴──────────────────┴───────────────┴──► Compensating ──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaState {
    /// Saga recorded, no step has succeeded yet.
    #[default]
    Started,

    /// The order service created the order.
    OrderCreated,

    /// The payment service captured the payment.
    PaymentCaptured,

    /// The shipping service created the shipment.
    Shipped,

    /// All steps completed successfully (terminal state).
    Completed,

    /// A step failed and compensating actions are in progress.
    Compensating,

    /// Compensation finished after a failure (terminal state).
    Failed,
}

impl SagaState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Completed | SagaState::Failed)
    }

    /// Returns true if the saga can begin compensation.
    pub fn can_compensate(&self) -> bool {
        !self.is_terminal() && *self != SagaState::Compensating
    }

    /// Returns true while a caller may still cancel the saga (before payment capture).
    pub fn is_cancellable(&self) -> bool {
        matches!(self, SagaState::Started | SagaState::OrderCreated)
    }

    /// Returns true if `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: SagaState) -> bool {
        use SagaState::*;
        match (self, next) {
            (Started, OrderCreated)
            | (OrderCreated, PaymentCaptured)
            | (PaymentCaptured, Shipped)
            | (Shipped, Completed)
            | (Compensating, Failed) => true,
            (from, Compensating) => from.can_compensate(),
            _ => false,
        }
    }

    /// Returns the step the saga runs next, if it is on the success path.
    pub fn next_step(&self) -> Option<SagaStep> {
        match self {
            SagaState::Started => Some(SagaStep::Order),
            SagaState::OrderCreated => Some(SagaStep::Payment),
            SagaState::PaymentCaptured => Some(SagaStep::Shipping),
            _ => None,
        }
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Started => "STARTED",
            SagaState::OrderCreated => "ORDER_CREATED",
            SagaState::PaymentCaptured => "PAYMENT_CAPTURED",
            SagaState::Shipped => "SHIPPED",
            SagaState::Completed => "COMPLETED",
            SagaState::Compensating => "COMPENSATING",
            SagaState::Failed => "FAILED",
        }
    }

    /// Parses the persisted state name.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == raw)
    }

    pub const ALL: [SagaState; 7] = [
        SagaState::Started,
        SagaState::OrderCreated,
        SagaState::PaymentCaptured,
        SagaState::Shipped,
        SagaState::Completed,
        SagaState::Compensating,
        SagaState::Failed,
    ];
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One forward step of the purchase saga. Ordered by execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStep {
    Order,
    Payment,
    Shipping,
}

impl SagaStep {
    /// All steps in execution order.
    pub const ALL: [SagaStep; 3] = [SagaStep::Order, SagaStep::Payment, SagaStep::Shipping];

    /// The state the saga must be in before this step may run.
    pub fn prerequisite(&self) -> SagaState {
        match self {
            SagaStep::Order => SagaState::Started,
            SagaStep::Payment => SagaState::OrderCreated,
            SagaStep::Shipping => SagaState::PaymentCaptured,
        }
    }

    /// The state the saga enters once this step's result is recorded.
    pub fn completion(&self) -> SagaState {
        match self {
            SagaStep::Order => SagaState::OrderCreated,
            SagaStep::Payment => SagaState::PaymentCaptured,
            SagaStep::Shipping => SagaState::Shipped,
        }
    }

    /// The action that semantically undoes this step.
    ///
    /// Shipping is the last step, so nothing after it can fail and require
    /// undoing a shipment.
    pub fn compensation(&self) -> Option<CompensationAction> {
        match self {
            SagaStep::Order => Some(CompensationAction::CancelOrder),
            SagaStep::Payment => Some(CompensationAction::RefundPayment),
            SagaStep::Shipping => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::Order => "order",
            SagaStep::Payment => "payment",
            SagaStep::Shipping => "shipping",
        }
    }
}

impl std::fmt::Display for SagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compensating action issued while a saga unwinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationAction {
    CancelOrder,
    RefundPayment,
}

impl CompensationAction {
    /// The forward step this action undoes.
    pub fn step(&self) -> SagaStep {
        match self {
            CompensationAction::CancelOrder => SagaStep::Order,
            CompensationAction::RefundPayment => SagaStep::Payment,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompensationAction::CancelOrder => "cancel_order",
            CompensationAction::RefundPayment => "refund_payment",
        }
    }
}

impl std::fmt::Display for CompensationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
