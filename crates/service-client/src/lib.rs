//! Resilient calls to downstream services.
//!
//! [`ServiceClient`] combines a [`ServiceRegistry`] (where does the service
//! live), a [`Transport`] (how to reach it), a per-service [`CircuitBreaker`]
//! and a [`RetryPolicy`].

pub mod breaker;
pub mod client;
pub mod error;
pub mod registry;
pub mod retry;
pub mod transport;

pub use breaker::{BreakerConfig, BreakerPermit, BreakerState, CircuitBreaker};
pub use client::{ClientConfig, ServiceClient};
pub use error::{RegistryError, ServiceError, TransportError};
pub use registry::{CachedRegistry, EurekaRegistry, ServiceAddress, ServiceRegistry, StaticRegistry};
pub use retry::RetryPolicy;
pub use transport::{
    CallRecord, HttpTransport, InMemoryTransport, Method, RemoteRequest, ServiceHandler, Transport,
};
