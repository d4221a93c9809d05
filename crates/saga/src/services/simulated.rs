//! In-process fake of the user, order, payment and shipping services.
//!
//! Installed into an [`InMemoryTransport`], it answers the same paths the real
//! services expose, so the remote collaborators and the [`ServiceClient`]
//! (with its breakers and retries) run unchanged. Behaviour can be changed per
//! operation to inject failures, and every applied side effect is journaled.
//!
//! [`ServiceClient`]: service_client::ServiceClient

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use service_client::{InMemoryTransport, Method, RemoteRequest, StaticRegistry, TransportError};

use super::{ALL_SERVICES, ORDER_SERVICE, PAYMENT_SERVICE, SHIPPING_SERVICE, USER_SERVICE};

/// A remote operation the simulation answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ValidateUser,
    CreateOrder,
    CancelOrder,
    CapturePayment,
    RefundPayment,
    CreateShipment,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ValidateUser => "validate_user",
            Operation::CreateOrder => "create_order",
            Operation::CancelOrder => "cancel_order",
            Operation::CapturePayment => "capture_payment",
            Operation::RefundPayment => "refund_payment",
            Operation::CreateShipment => "create_shipment",
        }
    }
}

/// How the simulation answers an operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Behavior {
    #[default]
    Succeed,
    /// Answer with a 4xx status.
    Reject { code: u16, reason: String },
    /// Answer 503.
    Unavailable,
    /// Never answer; the caller's timeout decides.
    Hang,
    /// Answer 503 this many times, then succeed.
    FailTimes(u32),
}

impl Behavior {
    /// The rejection a card processor sends for a declined payment.
    pub fn declined() -> Self {
        Behavior::Reject {
            code: 402,
            reason: "payment declined".to_string(),
        }
    }
}

/// A side effect the simulation applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub operation: Operation,
    /// ID created or targeted by the operation.
    pub target: String,
}

#[derive(Debug, Default)]
struct State {
    users: HashSet<i64>,
    /// order ID -> cancelled
    orders: BTreeMap<u64, bool>,
    /// payment ID -> refunded
    payments: BTreeMap<u64, bool>,
    shipments: BTreeMap<u64, u64>,
    next_id: u64,
    behaviors: HashMap<Operation, Behavior>,
    journal: Vec<JournalEntry>,
}

enum Answer {
    Ok(Value),
    Err(TransportError),
    Hang,
}

/// Simulated commerce backend.
#[derive(Debug, Clone, Default)]
pub struct SimulatedCommerce {
    state: Arc<Mutex<State>>,
}

impl SimulatedCommerce {
    /// Creates a backend where users 1 through 10 exist.
    pub fn new() -> Self {
        Self::with_users(1..=10)
    }

    pub fn with_users(users: impl IntoIterator<Item = i64>) -> Self {
        let sim = Self::default();
        sim.lock().users.extend(users);
        sim
    }

    pub fn add_user(&self, user_id: i64) {
        self.lock().users.insert(user_id);
    }

    /// Changes how `operation` is answered from now on.
    pub fn set_behavior(&self, operation: Operation, behavior: Behavior) {
        self.lock().behaviors.insert(operation, behavior);
    }

    /// Registers handlers for all four services on `transport`.
    pub fn install(&self, transport: &InMemoryTransport) {
        for service in ALL_SERVICES {
            let sim = self.clone();
            transport.register(service, move |request: RemoteRequest| {
                let sim = sim.clone();
                async move { sim.handle(service, request).await }
            });
        }
    }

    /// A registry pointing every service at its in-memory address.
    pub fn registry() -> StaticRegistry {
        let registry = StaticRegistry::new();
        for service in ALL_SERVICES {
            registry.register(service, &format!("mem://{service}"));
        }
        registry
    }

    /// Side effects applied so far, in order.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.lock().journal.clone()
    }

    /// Number of applied side effects of one kind.
    pub fn count(&self, operation: Operation) -> usize {
        self.lock()
            .journal
            .iter()
            .filter(|e| e.operation == operation)
            .count()
    }

    /// Orders created and not cancelled.
    pub fn active_orders(&self) -> usize {
        self.lock().orders.values().filter(|c| !**c).count()
    }

    /// Payments captured and not refunded.
    pub fn active_payments(&self) -> usize {
        self.lock().payments.values().filter(|r| !**r).count()
    }

    pub fn shipment_count(&self) -> usize {
        self.lock().shipments.len()
    }

    async fn handle(&self, service: &str, request: RemoteRequest) -> Result<Value, TransportError> {
        let answer = self.answer(service, &request);
        match answer {
            Answer::Ok(value) => Ok(value),
            Answer::Err(err) => Err(err),
            Answer::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(TransportError::Timeout)
            }
        }
    }

    fn answer(&self, service: &str, request: &RemoteRequest) -> Answer {
        let Some((operation, target)) = route(service, request) else {
            return Answer::Err(status(404, "no such endpoint"));
        };

        let mut state = self.lock();
        match state.next_behavior(operation) {
            Behavior::Succeed => {}
            Behavior::Reject { code, reason } => return Answer::Err(status(code, &reason)),
            Behavior::Unavailable | Behavior::FailTimes(_) => {
                return Answer::Err(status(503, "service unavailable"));
            }
            Behavior::Hang => return Answer::Hang,
        }

        match operation {
            Operation::ValidateUser => {
                let user_id = target.and_then(|t| t.parse::<i64>().ok());
                match user_id {
                    Some(id) if state.users.contains(&id) => Answer::Ok(json!({"userId": id})),
                    _ => Answer::Err(status(404, "user not found")),
                }
            }
            Operation::CreateOrder => {
                let id = state.allocate();
                state.orders.insert(id, false);
                state.record(operation, id);
                Answer::Ok(json!({"orderId": id}))
            }
            Operation::CapturePayment => {
                let order_id = body_id(request, "orderId");
                if !order_id.is_some_and(|id| state.orders.get(&id) == Some(&false)) {
                    return Answer::Err(status(409, "order is not payable"));
                }
                let id = state.allocate();
                state.payments.insert(id, false);
                state.record(operation, id);
                Answer::Ok(json!({"paymentId": id, "isPaid": true}))
            }
            Operation::CreateShipment => {
                let Some(order_id) = body_id(request, "orderId") else {
                    return Answer::Err(status(400, "orderId is required"));
                };
                let id = state.allocate();
                state.shipments.insert(id, order_id);
                state.record(operation, id);
                Answer::Ok(json!({"shippingId": id}))
            }
            Operation::CancelOrder => {
                let id = target.and_then(|t| t.parse::<u64>().ok());
                let existing = id.and_then(|id| state.orders.get(&id).map(|c| (id, *c)));
                match existing {
                    Some((id, false)) => {
                        state.orders.insert(id, true);
                        state.record(operation, id);
                        Answer::Ok(Value::Null)
                    }
                    // Already cancelled
                    Some((_, true)) => Answer::Ok(Value::Null),
                    None => Answer::Err(status(404, "order not found")),
                }
            }
            Operation::RefundPayment => {
                let id = target.and_then(|t| t.parse::<u64>().ok());
                let existing = id.and_then(|id| state.payments.get(&id).map(|r| (id, *r)));
                match existing {
                    Some((id, false)) => {
                        state.payments.insert(id, true);
                        state.record(operation, id);
                        Answer::Ok(Value::Null)
                    }
                    Some((_, true)) => Answer::Ok(Value::Null),
                    None => Answer::Err(status(404, "payment not found")),
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl State {
    fn next_behavior(&mut self, operation: Operation) -> Behavior {
        let behavior = self.behaviors.entry(operation).or_default();
        match behavior {
            Behavior::FailTimes(0) => {
                *behavior = Behavior::Succeed;
                Behavior::Succeed
            }
            Behavior::FailTimes(n) => {
                *n -= 1;
                Behavior::FailTimes(*n + 1)
            }
            other => other.clone(),
        }
    }

    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn record(&mut self, operation: Operation, id: u64) {
        self.journal.push(JournalEntry {
            operation,
            target: id.to_string(),
        });
    }
}

fn route<'a>(service: &str, request: &'a RemoteRequest) -> Option<(Operation, Option<&'a str>)> {
    let (collection, resource) = match service {
        USER_SERVICE => ("/user-service/api/users", Operation::ValidateUser),
        ORDER_SERVICE => ("/order-service/api/orders", Operation::CreateOrder),
        PAYMENT_SERVICE => ("/payment-service/api/payments", Operation::CapturePayment),
        SHIPPING_SERVICE => ("/shipping-service/api/shippings", Operation::CreateShipment),
        _ => return None,
    };
    let rest = request.path.strip_prefix(collection)?;
    let target = rest.strip_prefix('/').filter(|t| !t.is_empty());

    let operation = match (service, request.method, target) {
        (USER_SERVICE, Method::Get, Some(_)) => resource,
        (USER_SERVICE, _, _) => return None,
        (_, Method::Post, None) => resource,
        (ORDER_SERVICE, Method::Delete, Some(_)) => Operation::CancelOrder,
        (PAYMENT_SERVICE, Method::Delete, Some(_)) => Operation::RefundPayment,
        _ => return None,
    };
    Some((operation, target))
}

fn body_id(request: &RemoteRequest, field: &str) -> Option<u64> {
    let value = request.body.as_ref()?.get(field)?;
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn status(code: u16, body: &str) -> TransportError {
    TransportError::Status {
        code,
        body: body.to_string(),
    }
}
