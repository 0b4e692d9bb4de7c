//! Prometheus metrics for observability
//!
//! Provides application metrics collection and exposition.

pub mod prometheus;
pub mod collector;

pub use prometheus::{PrometheusMetrics, MetricsConfig, MetricsHandle, WebhookMetrics};
pub use collector::{MetricsCollector, SystemMetrics};
