use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::instrument;

use crate::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use crate::error::{RegistryError, ServiceError};
use crate::registry::{ServiceAddress, ServiceRegistry};
use crate::retry::RetryPolicy;
use crate::transport::{RemoteRequest, Transport};

/// Client configuration shared by every downstream service.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound for a single attempt
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    /// Registry lookups per attempt before the attempt fails as unavailable
    pub resolve_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            resolve_attempts: 2,
        }
    }
}

impl ClientConfig {
    /// Longest a single [`ServiceClient::call`] can take with this config.
    pub fn worst_case_latency(&self) -> Duration {
        self.retry.worst_case_latency(self.call_timeout)
    }
}

/// Resilient client for downstream services.
///
/// Every call goes through the service's circuit breaker, a registry lookup,
/// a timeout, and a bounded retry loop for transient failures. Breakers are
/// created lazily, one per service name.
pub struct ServiceClient {
    transport: Arc<dyn Transport>,
    registry: Arc<dyn ServiceRegistry>,
    config: ClientConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl ServiceClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<dyn ServiceRegistry>,
        config: ClientConfig,
    ) -> Self {
        Self {
            transport,
            registry,
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Calls `service` with the configured call timeout.
    pub async fn call(
        &self,
        service: &str,
        request: &RemoteRequest,
    ) -> Result<Value, ServiceError> {
        self.call_with_timeout(service, request, self.config.call_timeout)
            .await
    }

    /// Calls `service`, bounding each attempt by `timeout`.
    ///
    /// `Timeout`, `Unavailable` and `CircuitOpen` are retried up to
    /// `retry.max_retries` times; `RemoteRejected` is returned at once.
    #[instrument(skip(self, request, timeout), fields(operation = request.operation))]
    pub async fn call_with_timeout(
        &self,
        service: &str,
        request: &RemoteRequest,
        timeout: Duration,
    ) -> Result<Value, ServiceError> {
        let breaker = self.breaker(service);
        let mut retry = 0;

        loop {
            let attempt = retry + 1;
            let started = Instant::now();
            let result = self.attempt(&breaker, request, timeout).await;
            let elapsed = started.elapsed();

            let outcome = match &result {
                Ok(_) => "success",
                Err(e) => e.outcome(),
            };
            metrics::counter!(
                "service_calls_total",
                "service" => service.to_string(),
                "operation" => request.operation,
                "outcome" => outcome
            )
            .increment(1);
            metrics::histogram!("service_call_duration_seconds", "service" => service.to_string())
                .record(elapsed.as_secs_f64());

            match result {
                Ok(value) => {
                    tracing::debug!(
                        attempt,
                        latency_ms = elapsed.as_millis() as u64,
                        outcome,
                        "call succeeded"
                    );
                    return Ok(value);
                }
                Err(err) if err.is_transient() && retry < self.config.retry.max_retries => {
                    retry += 1;
                    let delay = self.config.retry.delay_for(retry);
                    tracing::warn!(
                        attempt,
                        latency_ms = elapsed.as_millis() as u64,
                        outcome,
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    tracing::warn!(
                        attempt,
                        latency_ms = elapsed.as_millis() as u64,
                        outcome,
                        error = %err,
                        "call failed"
                    );
                    return Err(err);
                }
            }
        }
    }

    async fn attempt(
        &self,
        breaker: &CircuitBreaker,
        request: &RemoteRequest,
        timeout: Duration,
    ) -> Result<Value, ServiceError> {
        let service = breaker.service();
        let permit = breaker.try_acquire()?;

        let address = match self.resolve(service).await {
            Ok(address) => address,
            Err(err) => {
                permit.failure();
                return Err(ServiceError::Unavailable(err.to_string()));
            }
        };

        match tokio::time::timeout(timeout, self.transport.send(&address, request)).await {
            Ok(Ok(value)) => {
                permit.success();
                Ok(value)
            }
            Ok(Err(err)) => {
                let err = ServiceError::from(err);
                if err.is_transient() {
                    permit.failure();
                    self.registry.invalidate(service);
                } else {
                    // The service answered; a rejection says it is healthy.
                    permit.success();
                }
                Err(err)
            }
            Err(_) => {
                permit.failure();
                self.registry.invalidate(service);
                Err(ServiceError::Timeout)
            }
        }
    }

    async fn resolve(&self, service: &str) -> Result<ServiceAddress, RegistryError> {
        let attempts = self.config.resolve_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.registry.resolve(service).await {
                Ok(address) => return Ok(address),
                Err(err) => {
                    tracing::debug!(attempt, error = %err, "service resolution failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| RegistryError::NoHealthyInstance(service.to_string())))
    }

    fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
        {
            return breaker.clone();
        }
        self.breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(service, self.config.breaker.clone()))
            })
            .clone()
    }

    /// Current breaker state for `service`; `Closed` if it was never called.
    pub fn breaker_state(&self, service: &str) -> BreakerState {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .map(|b| b.state())
            .unwrap_or(BreakerState::Closed)
    }

    /// Breaker state of every service called so far.
    pub fn breaker_states(&self) -> BTreeMap<String, BreakerState> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(service, breaker)| (service.clone(), breaker.state()))
            .collect()
    }
}
