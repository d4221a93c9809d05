//! Purchase saga orchestration.
//!
//! A purchase runs as a saga over four downstream services:
//! 1. Validate the user
//! 2. Create the order
//! 3. Capture the payment
//! 4. Create the shipment
//!
//! Every step result is recorded in a [`SagaStore`](saga_store::SagaStore)
//! before the next step starts. If a step fails, the steps that already
//! succeeded are compensated in reverse order (refund, then cancel the order).

pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod purchase;
pub mod services;

pub use error::{Result, SagaError};
pub use orchestrator::{CANCELLED_BY_CALLER, OrchestratorConfig, SagaOrchestrator};
pub use pool::{PoolConfig, PoolSlot, WorkerPool};
pub use purchase::{PurchaseService, SagaStatus, StartPurchase};
pub use services::{
    Behavior, CallError, Collaborators, JournalEntry, Operation, OrderService, PaymentService,
    ShippingService, SimulatedCommerce, UserService,
};
