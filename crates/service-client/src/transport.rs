//! Wire transports behind the service client.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;
use crate::registry::ServiceAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

/// A transport-agnostic request to a downstream service.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    /// Logical operation name, used for logs and metrics.
    pub operation: &'static str,
    pub method: Method,
    /// Path relative to the service's base URL, starting with `/`.
    pub path: String,
    pub body: Option<Value>,
}

impl RemoteRequest {
    pub fn get(operation: &'static str, path: impl Into<String>) -> Self {
        Self {
            operation,
            method: Method::Get,
            path: path.into(),
            body: None,
        }
    }

    pub fn post(operation: &'static str, path: impl Into<String>, body: Value) -> Self {
        Self {
            operation,
            method: Method::Post,
            path: path.into(),
            body: Some(body),
        }
    }

    pub fn delete(operation: &'static str, path: impl Into<String>) -> Self {
        Self {
            operation,
            method: Method::Delete,
            path: path.into(),
            body: None,
        }
    }
}

/// Sends one request to one resolved instance.
///
/// Implementations do not retry and do not enforce the call timeout; the
/// [`ServiceClient`](crate::ServiceClient) does both.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        address: &ServiceAddress,
        request: &RemoteRequest,
    ) -> Result<Value, TransportError>;
}

/// JSON over HTTP with reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        address: &ServiceAddress,
        request: &RemoteRequest,
    ) -> Result<Value, TransportError> {
        let url = format!("{}{}", address.base_url, request.path);
        let mut builder = match request.method {
            Method::Get => self.http.get(&url),
            Method::Post => self.http.post(&url),
            Method::Put => self.http.put(&url),
            Method::Delete => self.http.delete(&url),
        };
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;

        if !status.is_success() {
            return Err(TransportError::Status {
                code: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| TransportError::InvalidBody(e.to_string()))
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Connection(err.to_string())
    }
}

/// Handles requests for one service inside an [`InMemoryTransport`].
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn handle(&self, request: RemoteRequest) -> Result<Value, TransportError>;
}

#[async_trait]
impl<F, Fut> ServiceHandler for F
where
    F: Fn(RemoteRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TransportError>> + Send,
{
    async fn handle(&self, request: RemoteRequest) -> Result<Value, TransportError> {
        (self)(request).await
    }
}

/// A request that reached an [`InMemoryTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub service: String,
    pub operation: &'static str,
    pub method: Method,
    pub path: String,
}

/// Routes requests to in-process handlers by service name and records every
/// request it receives.
#[derive(Default)]
pub struct InMemoryTransport {
    handlers: RwLock<HashMap<String, Arc<dyn ServiceHandler>>>,
    calls: Mutex<Vec<CallRecord>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs (or replaces) the handler for `service`.
    pub fn register(&self, service: &str, handler: impl ServiceHandler + 'static) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.to_string(), Arc::new(handler));
    }

    /// Every request received so far, in arrival order.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self, service: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.service == service)
            .count()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(
        &self,
        address: &ServiceAddress,
        request: &RemoteRequest,
    ) -> Result<Value, TransportError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CallRecord {
                service: address.service.clone(),
                operation: request.operation,
                method: request.method,
                path: request.path.clone(),
            });

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address.service)
            .cloned();
        match handler {
            Some(handler) => handler.handle(request.clone()).await,
            None => Err(TransportError::Connection(format!(
                "connection refused: {}",
                address.base_url
            ))),
        }
    }
}
