//! Shared types for the purchase saga orchestrator.

pub mod purchase;
pub mod types;

pub use purchase::{
    InputError, OrderPayload, PaymentMethod, PaymentPayload, PurchaseInput, ShippingPayload,
};
pub use types::{InvalidSagaId, MAX_SAGA_ID_LEN, Money, SagaId, UserId};
