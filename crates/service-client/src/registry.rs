//! Service name to address resolution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::RegistryError;

/// One reachable instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ServiceAddress {
    pub service: String,
    pub instance_id: String,
    /// Scheme, host and port, without a trailing slash.
    pub base_url: String,
}

impl ServiceAddress {
    pub fn new(service: impl Into<String>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            service: service.into(),
            instance_id: base_url.clone(),
            base_url,
        }
    }
}

/// Resolves a logical service name to a healthy instance.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn resolve(&self, service: &str) -> Result<ServiceAddress, RegistryError>;

    /// Forget any cached address for `service` after a failed call.
    fn invalidate(&self, _service: &str) {}
}

#[derive(Debug)]
struct Instance {
    address: ServiceAddress,
    healthy: bool,
}

#[derive(Debug, Default)]
struct Instances {
    instances: Vec<Instance>,
    next: AtomicUsize,
}

impl Instances {
    fn pick(&self) -> Option<ServiceAddress> {
        let healthy: Vec<&Instance> = self.instances.iter().filter(|i| i.healthy).collect();
        if healthy.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(healthy[idx].address.clone())
    }
}

/// Registry with a fixed set of instances, round-robin over healthy ones.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    services: RwLock<HashMap<String, Instances>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`StaticRegistry::register`].
    pub fn with_instance(self, service: &str, base_url: &str) -> Self {
        self.register(service, base_url);
        self
    }

    pub fn register(&self, service: &str, base_url: &str) {
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        services
            .entry(service.to_string())
            .or_default()
            .instances
            .push(Instance {
                address: ServiceAddress::new(service, base_url),
                healthy: true,
            });
    }

    /// Takes an instance out of rotation. Returns false if it is unknown.
    pub fn mark_down(&self, service: &str, base_url: &str) -> bool {
        self.set_health(service, base_url, false)
    }

    pub fn mark_up(&self, service: &str, base_url: &str) -> bool {
        self.set_health(service, base_url, true)
    }

    fn set_health(&self, service: &str, base_url: &str, healthy: bool) -> bool {
        let base_url = base_url.trim_end_matches('/');
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = services.get_mut(service) else {
            return false;
        };
        let mut found = false;
        for instance in entry
            .instances
            .iter_mut()
            .filter(|i| i.address.base_url == base_url)
        {
            instance.healthy = healthy;
            found = true;
        }
        found
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn resolve(&self, service: &str) -> Result<ServiceAddress, RegistryError> {
        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        services
            .get(service)
            .and_then(Instances::pick)
            .ok_or_else(|| RegistryError::NoHealthyInstance(service.to_string()))
    }
}

/// Registry backed by a Eureka server's REST API.
pub struct EurekaRegistry {
    base_url: String,
    http: reqwest::Client,
    next: AtomicUsize,
}

#[derive(Debug, Deserialize)]
struct EurekaApplicationEnvelope {
    application: EurekaApplication,
}

#[derive(Debug, Deserialize)]
struct EurekaApplication {
    #[serde(default)]
    instance: OneOrMany<EurekaInstance>,
}

/// Eureka renders a single instance as an object rather than a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EurekaInstance {
    instance_id: Option<String>,
    ip_addr: Option<String>,
    host_name: Option<String>,
    status: String,
    port: Option<EurekaPort>,
    home_page_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EurekaPort {
    #[serde(rename = "$")]
    number: u16,
}

impl EurekaInstance {
    fn into_address(self, service: &str) -> Option<ServiceAddress> {
        let base_url = match (self.home_page_url, self.ip_addr.or(self.host_name), self.port) {
            (Some(url), _, _) if !url.is_empty() => url,
            (_, Some(host), Some(port)) => format!("http://{host}:{}", port.number),
            _ => return None,
        };
        let mut address = ServiceAddress::new(service, base_url);
        if let Some(id) = self.instance_id {
            address.instance_id = id;
        }
        Some(address)
    }
}

impl EurekaRegistry {
    /// `base_url` is the Eureka server root, e.g. `http://localhost:8761`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::Lookup {
                service: "eureka".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            next: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ServiceRegistry for EurekaRegistry {
    async fn resolve(&self, service: &str) -> Result<ServiceAddress, RegistryError> {
        let lookup_error = |reason: String| RegistryError::Lookup {
            service: service.to_string(),
            reason,
        };
        let url = format!(
            "{}/eureka/apps/{}",
            self.base_url,
            service.to_ascii_uppercase()
        );
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| lookup_error(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RegistryError::NoHealthyInstance(service.to_string()));
        }
        let envelope: EurekaApplicationEnvelope = response
            .error_for_status()
            .map_err(|e| lookup_error(e.to_string()))?
            .json()
            .await
            .map_err(|e| lookup_error(e.to_string()))?;

        let up: Vec<ServiceAddress> = envelope
            .application
            .instance
            .into_vec()
            .into_iter()
            .filter(|i| i.status.eq_ignore_ascii_case("UP"))
            .filter_map(|i| i.into_address(service))
            .collect();
        if up.is_empty() {
            return Err(RegistryError::NoHealthyInstance(service.to_string()));
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % up.len();
        Ok(up[idx].clone())
    }
}

/// How long [`CachedRegistry`] keeps an answer unless told otherwise.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

/// Caches another registry's answers for at most `ttl`.
pub struct CachedRegistry<R> {
    inner: R,
    ttl: Duration,
    cache: Mutex<HashMap<String, (ServiceAddress, Instant)>>,
}

impl<R: ServiceRegistry> CachedRegistry<R> {
    pub fn new(inner: R, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

#[async_trait]
impl<R: ServiceRegistry> ServiceRegistry for CachedRegistry<R> {
    async fn resolve(&self, service: &str) -> Result<ServiceAddress, RegistryError> {
        {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            match cache.get(service) {
                Some((address, at)) if at.elapsed() < self.ttl => return Ok(address.clone()),
                _ => {}
            }
        }

        let address = self.inner.resolve(service).await?;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.to_string(), (address.clone(), Instant::now()));
        Ok(address)
    }

    fn invalidate(&self, service: &str) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(service);
        self.inner.invalidate(service);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_round_robin() {
        let registry = StaticRegistry::new()
            .with_instance("order-service", "http://a:8300")
            .with_instance("order-service", "http://b:8300/");

        let first = registry.resolve("order-service").await.unwrap();
        let second = registry.resolve("order-service").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(second.base_url, "http://b:8300");
    }

    #[tokio::test]
    async fn test_static_skips_unhealthy() {
        let registry = StaticRegistry::new()
            .with_instance("order-service", "http://a:8300")
            .with_instance("order-service", "http://b:8300");
        assert!(registry.mark_down("order-service", "http://a:8300"));

        for _ in 0..4 {
            let address = registry.resolve("order-service").await.unwrap();
            assert_eq!(address.base_url, "http://b:8300");
        }

        registry.mark_down("order-service", "http://b:8300");
        assert_eq!(
            registry.resolve("order-service").await.unwrap_err(),
            RegistryError::NoHealthyInstance("order-service".to_string())
        );

        registry.mark_up("order-service", "http://a:8300");
        assert!(registry.resolve("order-service").await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let registry = StaticRegistry::new();
        assert!(matches!(
            registry.resolve("user-service").await,
            Err(RegistryError::NoHealthyInstance(_))
        ));
        assert!(!registry.mark_down("user-service", "http://x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_respects_ttl() {
        let cached = CachedRegistry::new(
            StaticRegistry::new().with_instance("user-service", "http://a:8700"),
            Duration::from_secs(5),
        );
        cached.resolve("user-service").await.unwrap();

        // Inner registry loses the instance; the cache still answers.
        cached.inner().mark_down("user-service", "http://a:8700");
        assert!(cached.resolve("user-service").await.is_ok());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cached.resolve("user-service").await.is_err());
    }

    #[tokio::test]
    async fn test_cache_invalidate() {
        let cached = CachedRegistry::new(
            StaticRegistry::new().with_instance("user-service", "http://a:8700"),
            Duration::from_secs(60),
        );
        cached.resolve("user-service").await.unwrap();
        cached.inner().mark_down("user-service", "http://a:8700");
        cached.invalidate("user-service");
        assert!(cached.resolve("user-service").await.is_err());
    }

    #[test]
    fn test_eureka_payload_parsing() {
        let body = serde_json::json!({
            "application": {
                "name": "USER-SERVICE",
                "instance": [
                    {
                        "instanceId": "host:user-service:8700",
                        "hostName": "host",
                        "ipAddr": "10.0.0.5",
                        "status": "UP",
                        "port": {"$": 8700, "@enabled": "true"}
                    },
                    {
                        "instanceId": "host:user-service:8701",
                        "ipAddr": "10.0.0.6",
                        "status": "DOWN",
                        "port": {"$": 8701, "@enabled": "true"}
                    }
                ]
            }
        });
        let envelope: EurekaApplicationEnvelope = serde_json::from_value(body).unwrap();
        let up: Vec<_> = envelope
            .application
            .instance
            .into_vec()
            .into_iter()
            .filter(|i| i.status == "UP")
            .filter_map(|i| i.into_address("user-service"))
            .collect();
        assert_eq!(up.len(), 1);
        assert_eq!(up[0].base_url, "http://10.0.0.5:8700");
        assert_eq!(up[0].instance_id, "host:user-service:8700");
    }

    #[test]
    fn test_eureka_single_instance_object() {
        let body = serde_json::json!({
            "application": {
                "instance": {
                    "status": "UP",
                    "homePageUrl": "http://order-host:8300/"
                }
            }
        });
        let envelope: EurekaApplicationEnvelope = serde_json::from_value(body).unwrap();
        let instances = envelope.application.instance.into_vec();
        assert_eq!(instances.len(), 1);
        let address = instances
            .into_iter()
            .next()
            .and_then(|i| i.into_address("order-service"))
            .unwrap();
        assert_eq!(address.base_url, "http://order-host:8300");
    }
}
