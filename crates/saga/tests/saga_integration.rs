//! Integration tests for the purchase saga.
//!
//! The downstream services are simulated in-process behind the real
//! `ServiceClient`, so retries, timeouts and breakers all take part. Time is
//! paused; sleeps advance the clock instantly.

use std::sync::Arc;
use std::time::Duration;

use common::{
    Money, OrderPayload, PaymentMethod, PaymentPayload, PurchaseInput, SagaId, ShippingPayload,
    UserId,
};
use async_trait::async_trait;
use saga::{
    Behavior, CallError, Collaborators, Operation, OrchestratorConfig, OrderService, PoolConfig,
    PurchaseService, SagaError, SagaOrchestrator, SagaStatus, SimulatedCommerce, StartPurchase,
    WorkerPool,
};
use saga_store::{
    CompensationAction, CompensationOutcome, CompensationRecord, InMemorySagaStore, Saga,
    SagaState, SagaStep, SagaStore,
};
use service_client::{ClientConfig, InMemoryTransport, ServiceClient};

/// Order service whose cancellations take a while to answer.
struct SlowCancelOrders {
    inner: Arc<dyn OrderService>,
    delay: Duration,
}

#[async_trait]
impl OrderService for SlowCancelOrders {
    async fn create_order(
        &self,
        user_id: UserId,
        order: &OrderPayload,
    ) -> Result<String, CallError> {
        self.inner.create_order(user_id, order).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), CallError> {
        tokio::time::sleep(self.delay).await;
        self.inner.cancel_order(order_id).await
    }
}

struct TestHarness {
    service: PurchaseService<InMemorySagaStore>,
    store: InMemorySagaStore,
    sim: SimulatedCommerce,
    collaborators: Collaborators,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_pool(PoolConfig::default())
    }

    fn with_pool(pool: PoolConfig) -> Self {
        Self::build(pool, |collaborators| collaborators)
    }

    /// Builds a harness whose orchestrator sees the collaborators as changed
    /// by `wrap`.
    fn build(pool: PoolConfig, wrap: impl FnOnce(Collaborators) -> Collaborators) -> Self {
        let transport = Arc::new(InMemoryTransport::new());
        let sim = SimulatedCommerce::new();
        sim.install(&transport);

        let client = Arc::new(ServiceClient::new(
            transport,
            Arc::new(SimulatedCommerce::registry()),
            ClientConfig::default(),
        ));
        let collaborators = wrap(Collaborators::remote(client));
        let store = InMemorySagaStore::new();
        let orchestrator = SagaOrchestrator::new(
            store.clone(),
            collaborators.clone(),
            OrchestratorConfig::default(),
        );

        Self {
            service: PurchaseService::new(orchestrator, WorkerPool::new(pool)),
            store,
            sim,
            collaborators,
        }
    }

    async fn start(&self, saga_id: &str) -> SagaStatus {
        self.service
            .start_purchase(request(saga_id, input()))
            .await
            .unwrap()
    }

    /// Polls until the saga satisfies `done`, advancing paused time.
    async fn wait_for(&self, saga_id: &str, done: impl Fn(&SagaStatus) -> bool) -> SagaStatus {
        let saga_id = id(saga_id);
        for _ in 0..2_000 {
            let status = self.service.get_saga_status(&saga_id).await.unwrap();
            if done(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("saga {saga_id} did not reach the expected state");
    }

    async fn wait_until_finished(&self, saga_id: &str) -> SagaStatus {
        self.wait_for(saga_id, |s| s.state.is_terminal()).await
    }

    fn position(&self, operation: Operation) -> usize {
        self.sim
            .journal()
            .iter()
            .position(|e| e.operation == operation)
            .unwrap()
    }
}

fn id(raw: &str) -> SagaId {
    SagaId::parse(raw).unwrap()
}

fn input() -> PurchaseInput {
    PurchaseInput {
        user_id: UserId::new(1),
        order: OrderPayload {
            sku: "MBP16".to_string(),
            description: Some("MacBook Pro 16".to_string()),
            fee: Money::from_cents(899_999),
        },
        payment: PaymentPayload {
            method: PaymentMethod::CreditCard,
        },
        shipping: ShippingPayload {
            address: "Carrera 15 #93-47, Bogota".to_string(),
        },
    }
}

fn request(saga_id: &str, input: PurchaseInput) -> StartPurchase {
    StartPurchase {
        saga_id: Some(saga_id.to_string()),
        input,
    }
}

#[tokio::test(start_paused = true)]
async fn test_happy_path_completes() {
    let h = TestHarness::new();

    let started = h.start("s1").await;
    assert_eq!(started.state, SagaState::Started);

    let status = h.wait_until_finished("s1").await;
    assert_eq!(status.state, SagaState::Completed);
    let steps: Vec<_> = status.step_results.keys().copied().collect();
    assert_eq!(steps, SagaStep::ALL);
    assert!(status.last_error.is_none());
    assert!(status.compensations.is_empty());

    assert_eq!(h.sim.count(Operation::CreateOrder), 1);
    assert_eq!(h.sim.count(Operation::CapturePayment), 1);
    assert_eq!(h.sim.shipment_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_generated_saga_id() {
    let h = TestHarness::new();
    let status = h
        .service
        .start_purchase(StartPurchase {
            saga_id: None,
            input: input(),
        })
        .await
        .unwrap();

    let status = h.wait_until_finished(status.saga_id.as_str()).await;
    assert_eq!(status.state, SagaState::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_input_creates_nothing() {
    let h = TestHarness::new();

    let mut bad = input();
    bad.user_id = UserId::new(0);
    let err = h.service.start_purchase(request("s1", bad)).await.unwrap_err();
    assert!(matches!(err, SagaError::ValidationFailed(_)));

    let err = h
        .service
        .start_purchase(request("not a valid id", input()))
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::ValidationFailed(_)));

    assert_eq!(h.store.saga_count().await, 0);
    assert!(h.sim.journal().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_declined_payment_cancels_order() {
    let h = TestHarness::new();
    h.sim
        .set_behavior(Operation::CapturePayment, Behavior::declined());

    h.start("s2").await;
    let status = h.wait_until_finished("s2").await;

    assert_eq!(status.state, SagaState::Failed);
    assert!(status.step_results.contains_key(&SagaStep::Order));
    assert!(!status.step_results.contains_key(&SagaStep::Payment));
    let error = status.last_error.unwrap();
    assert!(error.contains("payment"), "{error}");

    assert_eq!(status.compensations.len(), 1);
    assert_eq!(status.compensations[0].action, CompensationAction::CancelOrder);
    assert_eq!(
        status.compensations[0].outcome,
        CompensationOutcome::Succeeded
    );

    // Nothing was captured
    assert_eq!(h.sim.count(Operation::CapturePayment), 0);
    assert_eq!(h.sim.count(Operation::CancelOrder), 1);
    assert_eq!(h.sim.active_orders(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shipment_timeout_refunds_then_cancels() {
    let h = TestHarness::new();
    h.sim.set_behavior(Operation::CreateShipment, Behavior::Hang);

    h.start("s3").await;
    let status = h.wait_until_finished("s3").await;

    assert_eq!(status.state, SagaState::Failed);
    assert!(status.last_error.unwrap().contains("shipping"));
    let actions: Vec<_> = status.compensations.iter().map(|c| c.action).collect();
    assert_eq!(
        actions,
        [
            CompensationAction::RefundPayment,
            CompensationAction::CancelOrder
        ]
    );
    assert!(status.compensations.iter().all(CompensationRecord::is_success));

    assert!(h.position(Operation::RefundPayment) < h.position(Operation::CancelOrder));
    assert_eq!(h.sim.active_payments(), 0);
    assert_eq!(h.sim.active_orders(), 0);
    assert_eq!(h.sim.shipment_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let h = TestHarness::new();
    h.sim
        .set_behavior(Operation::CreateOrder, Behavior::FailTimes(2));

    h.start("s4").await;
    let status = h.wait_until_finished("s4").await;

    assert_eq!(status.state, SagaState::Completed);
    assert_eq!(h.sim.count(Operation::CreateOrder), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_user_fails_without_compensation() {
    let h = TestHarness::new();
    let mut unknown = input();
    unknown.user_id = UserId::new(99);

    h.service
        .start_purchase(request("s5", unknown))
        .await
        .unwrap();
    let status = h.wait_until_finished("s5").await;

    assert_eq!(status.state, SagaState::Failed);
    assert!(status.step_results.is_empty());
    assert!(status.compensations.is_empty());
    assert!(status.last_error.unwrap().contains("user 99 not found"));
    assert!(h.sim.journal().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_repeated_start_is_idempotent() {
    let h = TestHarness::new();

    h.start("s6").await;
    let first = h.wait_until_finished("s6").await;
    let second = h.start("s6").await;

    assert_eq!(second, first);
    assert_eq!(h.sim.count(Operation::CreateOrder), 1);
    assert_eq!(h.sim.count(Operation::CapturePayment), 1);
    assert_eq!(h.sim.shipment_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_same_id_with_different_input_conflicts() {
    let h = TestHarness::new();
    h.start("s7").await;

    let mut other = input();
    other.order.sku = "IPAD".to_string();
    let err = h
        .service
        .start_purchase(request("s7", other))
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::IdempotencyConflict(id) if id.as_str() == "s7"));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_starts_execute_once() {
    let h = TestHarness::new();

    let results = futures_util::future::join_all(
        (0..5).map(|_| h.service.start_purchase(request("s8", input()))),
    )
    .await;
    for result in &results {
        assert_eq!(result.as_ref().unwrap().saga_id.as_str(), "s8");
    }

    let status = h.wait_until_finished("s8").await;
    assert_eq!(status.state, SagaState::Completed);
    assert_eq!(h.store.saga_count().await, 1);
    assert_eq!(h.sim.count(Operation::CreateOrder), 1);
    assert_eq!(h.sim.count(Operation::CapturePayment), 1);
    assert_eq!(h.sim.shipment_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_after_order_created() {
    let h = TestHarness::new();
    h.sim.set_behavior(Operation::CapturePayment, Behavior::Hang);

    h.start("s9").await;
    h.wait_for("s9", |s| s.state == SagaState::OrderCreated)
        .await;

    let status = h.service.cancel_saga(&id("s9")).await.unwrap();
    assert_eq!(status.state, SagaState::Failed);
    assert_eq!(status.last_error.as_deref(), Some(saga::CANCELLED_BY_CALLER));
    assert_eq!(h.sim.count(Operation::CancelOrder), 1);

    // The task still waiting on payment loses the race and leaves it alone.
    tokio::time::sleep(Duration::from_secs(30)).await;
    let status = h.service.get_saga_status(&id("s9")).await.unwrap();
    assert_eq!(status.state, SagaState::Failed);
    assert_eq!(status.compensations.len(), 1);
    assert_eq!(h.sim.count(Operation::CancelOrder), 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_start_during_cancel_compensates_once() {
    let h = TestHarness::build(PoolConfig::default(), |collaborators| Collaborators {
        orders: Arc::new(SlowCancelOrders {
            inner: collaborators.orders.clone(),
            delay: Duration::from_millis(500),
        }),
        ..collaborators
    });
    let saga_id = id("s9b");

    // Stored by a previous process; no task is driving it here.
    let order_id = h
        .collaborators
        .orders
        .create_order(UserId::new(1), &input().order)
        .await
        .unwrap();
    h.store
        .create(Saga::new(saga_id.clone(), input()))
        .await
        .unwrap();
    h.store
        .update_step(&saga_id, SagaStep::Order, order_id, SagaState::OrderCreated)
        .await
        .unwrap();

    let service = Arc::new(h.service);
    let cancel = tokio::spawn({
        let service = service.clone();
        let saga_id = saga_id.clone();
        async move { service.cancel_saga(&saga_id).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = service
        .start_purchase(request("s9b", input()))
        .await
        .unwrap();
    assert_eq!(started.state, SagaState::Compensating);

    let cancelled = cancel.await.unwrap().unwrap();
    assert_eq!(cancelled.state, SagaState::Failed);

    // Let the task scheduled by the repeated start finish too.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let status = service.get_saga_status(&saga_id).await.unwrap();
    assert_eq!(status.state, SagaState::Failed);
    assert_eq!(status.compensations.len(), 1);
    assert_eq!(h.sim.count(Operation::CancelOrder), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_after_payment_is_refused() {
    let h = TestHarness::new();
    h.sim.set_behavior(Operation::CreateShipment, Behavior::Hang);

    h.start("s10").await;
    h.wait_for("s10", |s| s.state == SagaState::PaymentCaptured)
        .await;

    let err = h.service.cancel_saga(&id("s10")).await.unwrap_err();
    assert!(matches!(
        err,
        SagaError::InvalidState {
            state: SagaState::PaymentCaptured,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_unknown_and_finished_sagas() {
    let h = TestHarness::new();
    let err = h.service.cancel_saga(&id("missing")).await.unwrap_err();
    assert!(matches!(err, SagaError::NotFound(_)));

    h.start("s11").await;
    h.wait_until_finished("s11").await;
    let err = h.service.cancel_saga(&id("s11")).await.unwrap_err();
    assert!(matches!(
        err,
        SagaError::InvalidState {
            state: SagaState::Completed,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_failed_compensation_is_reported() {
    let h = TestHarness::new();
    h.sim
        .set_behavior(Operation::CapturePayment, Behavior::declined());
    h.sim
        .set_behavior(Operation::CancelOrder, Behavior::Unavailable);

    h.start("s12").await;
    let status = h.wait_until_finished("s12").await;

    assert_eq!(status.state, SagaState::Failed);
    let error = status.last_error.unwrap();
    assert!(error.starts_with("compensation 'cancel_order' failed"), "{error}");
    assert_eq!(status.compensations.len(), 1);
    assert!(matches!(
        status.compensations[0].outcome,
        CompensationOutcome::Failed { .. }
    ));
    assert_eq!(h.sim.active_orders(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resume_compensation_skips_applied_actions() {
    let h = TestHarness::new();
    let saga_id = id("s13");

    // A process died midway through compensating: payment already refunded.
    let order_id = h
        .collaborators
        .orders
        .create_order(UserId::new(1), &input().order)
        .await
        .unwrap();
    let payment_id = h
        .collaborators
        .payments
        .capture_payment(&order_id, PaymentMethod::CreditCard, input().order.fee)
        .await
        .unwrap();
    h.collaborators
        .payments
        .refund_payment(&payment_id)
        .await
        .unwrap();

    h.store
        .create(Saga::new(saga_id.clone(), input()))
        .await
        .unwrap();
    h.store
        .update_step(&saga_id, SagaStep::Order, order_id, SagaState::OrderCreated)
        .await
        .unwrap();
    h.store
        .update_step(
            &saga_id,
            SagaStep::Payment,
            payment_id.clone(),
            SagaState::PaymentCaptured,
        )
        .await
        .unwrap();
    h.store
        .transition(
            &saga_id,
            SagaState::PaymentCaptured,
            SagaState::Compensating,
            Some("step 'shipping' failed: unavailable".to_string()),
        )
        .await
        .unwrap();
    h.store
        .record_compensation(
            &saga_id,
            CompensationRecord::succeeded(CompensationAction::RefundPayment, payment_id),
        )
        .await
        .unwrap();

    let saga = h.service.orchestrator().run(&saga_id).await.unwrap();

    assert_eq!(saga.state(), SagaState::Failed);
    assert_eq!(
        saga.last_error(),
        Some("step 'shipping' failed: unavailable")
    );
    assert_eq!(saga.compensations().len(), 2);
    assert_eq!(h.sim.count(Operation::RefundPayment), 1);
    assert_eq!(h.sim.count(Operation::CancelOrder), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recover_unfinished_sagas() {
    let h = TestHarness::new();
    for raw in ["r1", "r2"] {
        h.store
            .create(Saga::new(id(raw), input()))
            .await
            .unwrap();
    }

    let scheduled = h.service.recover_unfinished().await.unwrap();
    assert_eq!(scheduled, 2);

    for raw in ["r1", "r2"] {
        let status = h.wait_until_finished(raw).await;
        assert_eq!(status.state, SagaState::Completed);
    }
    assert_eq!(h.service.recover_unfinished().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_is_overloaded() {
    let h = TestHarness::with_pool(PoolConfig {
        workers: 1,
        queue_capacity: 1,
    });
    let held = h.service.pool().try_reserve().unwrap();

    let err = h
        .service
        .start_purchase(request("s14", input()))
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::Overloaded));
    assert_eq!(h.store.saga_count().await, 0);

    drop(held);
    h.start("s14").await;
    let status = h.wait_until_finished("s14").await;
    assert_eq!(status.state, SagaState::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_status_serialization() {
    let h = TestHarness::new();
    h.start("s15").await;
    let status = h.wait_until_finished("s15").await;

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["saga_id"], "s15");
    assert_eq!(json["state"], "COMPLETED");
    assert!(json["step_results"]["order"].is_string());
    assert!(json["step_results"]["shipping"].is_string());
    assert!(json["last_error"].is_null());
}
