use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use serde_json::json;
use service_client::{
    BreakerConfig, CircuitBreaker, ClientConfig, InMemoryTransport, RemoteRequest, ServiceClient,
    StaticRegistry,
};

fn bench_breaker_acquire(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();
    let breaker = CircuitBreaker::new("order-service", BreakerConfig::default());

    c.bench_function("breaker/acquire_success", |b| {
        b.iter(|| {
            breaker.try_acquire().unwrap().success();
        });
    });
}

fn bench_client_call(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let transport = Arc::new(InMemoryTransport::new());
    transport.register("order-service", |_req: RemoteRequest| async {
        Ok(json!({"orderId": 1}))
    });
    let registry =
        Arc::new(StaticRegistry::new().with_instance("order-service", "http://localhost:8300"));
    let client = ServiceClient::new(transport, registry, ClientConfig::default());
    let request = RemoteRequest::post("create_order", "/order-service/api/orders", json!({}));

    c.bench_function("client/call_in_memory", |b| {
        b.iter(|| {
            rt.block_on(async {
                client.call("order-service", &request).await.unwrap();
            });
        });
    });
}

criterion_group!(benches, bench_breaker_acquire, bench_client_call);
criterion_main!(benches);
