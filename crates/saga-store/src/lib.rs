//! Durable store for purchase saga records.
//!
//! A [`Saga`] is created once per saga ID and afterwards only changed through
//! compare-and-set updates, so exactly one writer can advance it at a time.
//! Two implementations are provided: [`InMemorySagaStore`] for tests and
//! single-process deployments, and [`PostgresSagaStore`] for crash-safe
//! persistence.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod saga;
pub mod state;
pub mod store;

pub use common::SagaId;
pub use error::{Result, StoreError};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use saga::{CompensationOutcome, CompensationRecord, Saga};
pub use state::{CompensationAction, SagaState, SagaStep};
pub use store::SagaStore;
