//! Downstream collaborators of the purchase saga.
//!
//! Each collaborator is a trait so the orchestrator can be driven by remote
//! implementations over the [`ServiceClient`] or by test doubles.

pub mod order;
pub mod payment;
pub mod shipping;
pub mod simulated;
pub mod user;

use std::sync::Arc;

use serde_json::Value;
use service_client::{ServiceClient, ServiceError};
use thiserror::Error;

pub use order::{OrderService, RemoteOrderService};
pub use payment::{PaymentService, RemotePaymentService};
pub use shipping::{RemoteShippingService, ShippingService};
pub use simulated::{Behavior, JournalEntry, Operation, SimulatedCommerce};
pub use user::{RemoteUserService, UserService};

pub const USER_SERVICE: &str = "user-service";
pub const ORDER_SERVICE: &str = "order-service";
pub const PAYMENT_SERVICE: &str = "payment-service";
pub const SHIPPING_SERVICE: &str = "shipping-service";

/// Every service the saga calls, in step order.
pub const ALL_SERVICES: [&str; 4] = [USER_SERVICE, ORDER_SERVICE, PAYMENT_SERVICE, SHIPPING_SERVICE];

/// Failure of a collaborator call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The service answered 2xx with a body we cannot use.
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

impl CallError {
    pub fn rejection_code(&self) -> Option<u16> {
        match self {
            CallError::Service(err) => err.rejection_code(),
            CallError::InvalidResponse(_) => None,
        }
    }
}

/// The four services the saga talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub users: Arc<dyn UserService>,
    pub orders: Arc<dyn OrderService>,
    pub payments: Arc<dyn PaymentService>,
    pub shipping: Arc<dyn ShippingService>,
}

impl Collaborators {
    /// Remote collaborators sharing one client (and so one breaker per service).
    pub fn remote(client: Arc<ServiceClient>) -> Self {
        Self {
            users: Arc::new(RemoteUserService::new(client.clone())),
            orders: Arc::new(RemoteOrderService::new(client.clone())),
            payments: Arc::new(RemotePaymentService::new(client.clone())),
            shipping: Arc::new(RemoteShippingService::new(client)),
        }
    }
}

/// Reads an identifier the services return as either a number or a string.
fn extract_id(body: &Value, field: &str) -> Result<String, CallError> {
    match body.get(field) {
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(CallError::InvalidResponse(format!(
            "missing '{field}' in response"
        ))),
    }
}

/// Services key their entities by integer; send numeric IDs as numbers.
fn id_value(id: &str) -> Value {
    id.parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(id))
}

fn today() -> String {
    chrono::Utc::now().date_naive().to_string()
}
