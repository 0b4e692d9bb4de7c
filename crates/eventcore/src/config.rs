//! Typed configuration, loaded via the `config` crate with an
//! environment-variable source layered over `set_default` cascades (§9
//! ambient stack).

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub stream: StreamConfig,
    pub scheduler: SchedulerConfig,
    pub http_adapter: HttpAdapterConfig,
    pub dispatcher: DispatcherConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_env("EVENTD")
    }

    pub fn load_from_env(prefix: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(
                Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_default("store.url", "postgres://localhost/events")?
            .set_default("store.max_connections", 10)?
            .set_default("store.min_connections", 2)?
            .set_default("store.lease_seconds", 30)?
            .set_default("stream.url", "nats://localhost:4222")?
            .set_default("stream.stream_name", "events")?
            .set_default("stream.max_reconnects", i64::MAX)?
            .set_default("scheduler.redis_url", "redis://localhost")?
            .set_default("scheduler.sweep_interval_ms", 1000)?
            .set_default("http_adapter.pool_max_idle_per_host", 32)?
            .set_default("http_adapter.max_concurrent_requests", 256)?
            .set_default("http_adapter.dns_cache_ttl_seconds", 60)?
            .set_default("dispatcher.workers_per_schema", 4)?
            .set_default("dispatcher.read_batch_size", 64)?
            .set_default("dispatcher.per_endpoint_concurrency", 8)?
            .set_default("dispatcher.drain_timeout_seconds", 30)?
            .set_default("dispatcher.reconciliation_interval_seconds", 30)?
            .set_default("dispatcher.stale_pending_threshold_seconds", 60)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.workers", 4)?;

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("EVENTD").separator("__"));

        let config = builder.build()?;
        config.try_deserialize()
    }
}

/// Event Store (C1) connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Default lease duration granted by `claim_pending` (§4.1).
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
}

impl StoreConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_lease_seconds() -> u64 {
    30
}

/// Stream Log (C2) connection configuration, backing the abstraction with
/// NATS JetStream (§4.2).
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub url: String,
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    #[serde(default)]
    pub max_reconnects: i64,
}

fn default_stream_name() -> String {
    "events".to_string()
}

/// Retry Scheduler (C9) configuration, backing the due-time queue with a
/// Redis sorted set per schema (§4.9).
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub redis_url: String,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl SchedulerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

/// HTTP Delivery Adapter (C7) connection-pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpAdapterConfig {
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_dns_cache_ttl_seconds")]
    pub dns_cache_ttl_seconds: u64,
}

fn default_pool_max_idle_per_host() -> usize {
    32
}

fn default_max_concurrent_requests() -> usize {
    256
}

fn default_dns_cache_ttl_seconds() -> u64 {
    60
}

/// Dispatcher (C10) worker pool and backpressure configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_workers_per_schema")]
    pub workers_per_schema: usize,
    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,
    #[serde(default = "default_per_endpoint_concurrency")]
    pub per_endpoint_concurrency: usize,
    #[serde(default = "default_drain_timeout_seconds")]
    pub drain_timeout_seconds: u64,
    #[serde(default = "default_reconciliation_interval_seconds")]
    pub reconciliation_interval_seconds: u64,
    #[serde(default = "default_stale_pending_threshold_seconds")]
    pub stale_pending_threshold_seconds: u64,
}

impl DispatcherConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }

    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_secs(self.reconciliation_interval_seconds)
    }

    pub fn stale_pending_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_pending_threshold_seconds)
    }
}

fn default_workers_per_schema() -> usize {
    4
}

fn default_read_batch_size() -> usize {
    64
}

fn default_per_endpoint_concurrency() -> usize {
    8
}

fn default_drain_timeout_seconds() -> u64 {
    30
}

fn default_reconciliation_interval_seconds() -> u64 {
    30
}

fn default_stale_pending_threshold_seconds() -> u64 {
    60
}

/// HTTP surface (§6.2, §6.3) configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_workers() -> usize {
    num_cpus::get().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert!(config.workers > 0);
        assert_eq!(config.address(), "0.0.0.0:8080");
    }

    #[test]
    fn store_config_lease_duration() {
        let config = StoreConfig {
            url: "postgres://localhost/events".into(),
            max_connections: 10,
            min_connections: 2,
            lease_seconds: 45,
        };
        assert_eq!(config.lease_duration(), Duration::from_secs(45));
    }
}
