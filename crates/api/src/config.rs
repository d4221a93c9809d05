//! Application configuration loaded from environment variables.

use std::time::Duration;

use saga::{OrchestratorConfig, PoolConfig};
use service_client::{BreakerConfig, ClientConfig, RetryPolicy};
use thiserror::Error;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got {value:?}")]
    InvalidValue {
        key: &'static str,
        expected: &'static str,
        value: String,
    },

    /// A step could be abandoned while its call is still being retried.
    #[error(
        "STEP_TIMEOUT_MS ({step_ms}ms) must be at least the worst-case call latency ({worst_case_ms}ms)"
    )]
    StepTimeoutTooShort { step_ms: u128, worst_case_ms: u128 },
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `text` or `json`
/// - `DATABASE_URL`: PostgreSQL saga store; in-memory when unset
/// - `EUREKA_URL`: resolve services through Eureka instead of static URLs
/// - `USER_SERVICE_URL`, `ORDER_SERVICE_URL`, `PAYMENT_SERVICE_URL`,
///   `SHIPPING_SERVICE_URL`: comma-separated static instances
/// - `SIMULATE_DOWNSTREAM`: answer all service calls in-process
/// - `SAGA_WORKERS`, `SAGA_QUEUE_CAPACITY`
/// - `CALL_TIMEOUT_MS`, `STEP_TIMEOUT_MS`, `MAX_RETRIES`
/// - `BREAKER_FAILURE_THRESHOLD`, `BREAKER_COOLDOWN_MS`
/// - `REGISTRY_TTL_MS`: cache lifetime of Eureka lookups
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub eureka_url: Option<String>,
    pub user_service_urls: Vec<String>,
    pub order_service_urls: Vec<String>,
    pub payment_service_urls: Vec<String>,
    pub shipping_service_urls: Vec<String>,
    pub simulate_downstream: bool,
    pub workers: usize,
    pub queue_capacity: usize,
    pub call_timeout: Duration,
    pub step_timeout: Duration,
    pub max_retries: u32,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: Duration,
    pub registry_ttl: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, which returns the raw value of a
    /// variable if set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let log_format = match var("LOG_FORMAT").as_deref().map(str::to_ascii_lowercase) {
            None => defaults.log_format,
            Some(f) if f == "text" => LogFormat::Text,
            Some(f) if f == "json" => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "LOG_FORMAT",
                    expected: "`text` or `json`",
                    value: other,
                });
            }
        };

        let config = Self {
            host: var("HOST").unwrap_or(defaults.host),
            port: parse(&var, "PORT", defaults.port)?,
            log_level: var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format,
            database_url: var("DATABASE_URL"),
            eureka_url: var("EUREKA_URL"),
            user_service_urls: urls(&var, "USER_SERVICE_URL", defaults.user_service_urls),
            order_service_urls: urls(&var, "ORDER_SERVICE_URL", defaults.order_service_urls),
            payment_service_urls: urls(&var, "PAYMENT_SERVICE_URL", defaults.payment_service_urls),
            shipping_service_urls: urls(
                &var,
                "SHIPPING_SERVICE_URL",
                defaults.shipping_service_urls,
            ),
            simulate_downstream: flag(&var, "SIMULATE_DOWNSTREAM", defaults.simulate_downstream)?,
            workers: parse(&var, "SAGA_WORKERS", defaults.workers)?,
            queue_capacity: parse(&var, "SAGA_QUEUE_CAPACITY", defaults.queue_capacity)?,
            call_timeout: millis(&var, "CALL_TIMEOUT_MS", defaults.call_timeout)?,
            step_timeout: millis(&var, "STEP_TIMEOUT_MS", defaults.step_timeout)?,
            max_retries: parse(&var, "MAX_RETRIES", defaults.max_retries)?,
            breaker_failure_threshold: parse(
                &var,
                "BREAKER_FAILURE_THRESHOLD",
                defaults.breaker_failure_threshold,
            )?,
            breaker_cooldown: millis(&var, "BREAKER_COOLDOWN_MS", defaults.breaker_cooldown)?,
            registry_ttl: millis(&var, "REGISTRY_TTL_MS", defaults.registry_ttl)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks settings that depend on each other.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SAGA_WORKERS",
                expected: "greater than zero",
                value: self.workers.to_string(),
            });
        }
        if self.breaker_failure_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                key: "BREAKER_FAILURE_THRESHOLD",
                expected: "greater than zero",
                value: self.breaker_failure_threshold.to_string(),
            });
        }
        let worst_case = self.client_config().worst_case_latency();
        if self.step_timeout < worst_case {
            return Err(ConfigError::StepTimeoutTooShort {
                step_ms: self.step_timeout.as_millis(),
                worst_case_ms: worst_case.as_millis(),
            });
        }
        Ok(())
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            call_timeout: self.call_timeout,
            retry: RetryPolicy::default().with_max_retries(self.max_retries),
            breaker: BreakerConfig {
                failure_threshold: self.breaker_failure_threshold,
                cooldown: self.breaker_cooldown,
                ..BreakerConfig::default()
            },
            ..ClientConfig::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            step_timeout: self.step_timeout,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
        }
    }

    /// Static instances per service, in the order the saga calls them.
    pub fn static_instances(&self) -> [(&'static str, &[String]); 4] {
        [
            (saga::services::USER_SERVICE, self.user_service_urls.as_slice()),
            (saga::services::ORDER_SERVICE, self.order_service_urls.as_slice()),
            (saga::services::PAYMENT_SERVICE, self.payment_service_urls.as_slice()),
            (saga::services::SHIPPING_SERVICE, self.shipping_service_urls.as_slice()),
        ]
    }
}

impl Default for Config {
    fn default() -> Self {
        let pool = PoolConfig::default();
        let client = ClientConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            eureka_url: None,
            user_service_urls: vec!["http://localhost:8700".to_string()],
            order_service_urls: vec!["http://localhost:8300".to_string()],
            payment_service_urls: vec!["http://localhost:8400".to_string()],
            shipping_service_urls: vec!["http://localhost:8600".to_string()],
            simulate_downstream: false,
            workers: pool.workers,
            queue_capacity: pool.queue_capacity,
            call_timeout: client.call_timeout,
            step_timeout: OrchestratorConfig::default().step_timeout,
            max_retries: client.retry.max_retries,
            breaker_failure_threshold: client.breaker.failure_threshold,
            breaker_cooldown: client.breaker.cooldown,
            registry_ttl: service_client::registry::DEFAULT_TTL,
        }
    }
}

fn parse<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match var(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key,
            expected: "a non-negative integer",
            value: raw,
        }),
    }
}

fn millis(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse(var, key, default_ms).map(Duration::from_millis)
}

fn flag(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match var(key).as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes") => Ok(true),
        Some("0" | "false" | "no") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            key,
            expected: "a boolean",
            value: other.to_string(),
        }),
    }
}

fn urls(var: &impl Fn(&str) -> Option<String>, key: &str, default: Vec<String>) -> Vec<String> {
    match var(key) {
        None => default,
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = load(&[]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.database_url.is_none());
        assert_eq!(config.workers, 32);
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.step_timeout, Duration::from_secs(15));
        assert_eq!(config.breaker_cooldown, Duration::from_secs(30));
        assert_eq!(config.order_service_urls, ["http://localhost:8300"]);
    }

    #[test]
    fn test_addr_formatting() {
        let config = load(&[("HOST", "127.0.0.1"), ("PORT", "8080")]).unwrap();
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("LOG_FORMAT", "JSON"),
            ("DATABASE_URL", "postgres://localhost/sagas"),
            ("PAYMENT_SERVICE_URL", "http://pay-1:8400, http://pay-2:8400"),
            ("SIMULATE_DOWNSTREAM", "true"),
            ("MAX_RETRIES", "1"),
            ("BREAKER_FAILURE_THRESHOLD", "3"),
            ("BREAKER_COOLDOWN_MS", "5000"),
        ])
        .unwrap();

        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/sagas")
        );
        assert_eq!(
            config.payment_service_urls,
            ["http://pay-1:8400", "http://pay-2:8400"]
        );
        assert!(config.simulate_downstream);

        let client = config.client_config();
        assert_eq!(client.retry.max_retries, 1);
        assert_eq!(client.breaker.failure_threshold, 3);
        assert_eq!(client.breaker.cooldown, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let err = load(&[("PORT", "http")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "PORT", .. }));

        let err = load(&[("CALL_TIMEOUT_MS", "-1")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CALL_TIMEOUT_MS",
                ..
            }
        ));

        let err = load(&[("SIMULATE_DOWNSTREAM", "maybe")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_step_timeout_must_cover_retries() {
        let err = load(&[("STEP_TIMEOUT_MS", "1000")]).unwrap_err();
        assert!(matches!(err, ConfigError::StepTimeoutTooShort { .. }));

        // Fewer retries lower the bound.
        let config = load(&[("STEP_TIMEOUT_MS", "3000"), ("MAX_RETRIES", "0")]).unwrap();
        assert_eq!(config.step_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_huge_retry_count_is_rejected() {
        let err = load(&[("MAX_RETRIES", "4294967295")]).unwrap_err();
        assert!(matches!(err, ConfigError::StepTimeoutTooShort { .. }));
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let err = load(&[("SAGA_WORKERS", "0")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "SAGA_WORKERS",
                ..
            }
        ));
    }
}
