//! Prometheus metrics implementation
//!
//! Provides metric types and registration for Prometheus monitoring.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Configuration for metrics
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Application name prefix for metrics
    pub prefix: String,
    /// Whether to include default labels
    pub include_default_labels: bool,
    /// Default labels to add to all metrics
    pub default_labels: HashMap<String, String>,
    /// Whether to collect histogram metrics
    pub enable_histograms: bool,
    /// Histogram buckets for latency metrics (in seconds)
    pub latency_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prefix: "eventd".to_string(),
            include_default_labels: true,
            default_labels: HashMap::new(),
            enable_histograms: true,
            latency_buckets: vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        }
    }
}

impl MetricsConfig {
    /// Create a new config with a prefix
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            ..Default::default()
        }
    }

    /// Add a default label
    pub fn with_label(mut self, name: &str, value: &str) -> Self {
        self.default_labels.insert(name.to_string(), value.to_string());
        self
    }

    /// Set latency buckets
    pub fn with_latency_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.latency_buckets = buckets;
        self
    }
}

/// Counter metric
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a value
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset the counter
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

/// Gauge metric
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    /// Create a new gauge
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the gauge value
    pub fn set(&self, value: f64) {
        self.value.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Increment the gauge by 1
    pub fn inc(&self) {
        let current = f64::from_bits(self.value.load(Ordering::Relaxed));
        self.set(current + 1.0);
    }

    /// Decrement the gauge by 1
    pub fn dec(&self) {
        let current = f64::from_bits(self.value.load(Ordering::Relaxed));
        self.set(current - 1.0);
    }

    /// Get the current value
    pub fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }
}

/// Histogram metric
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    bucket_counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with the given buckets
    pub fn new(buckets: Vec<f64>) -> Self {
        let bucket_counts = (0..buckets.len() + 1)
            .map(|_| AtomicU64::new(0))
            .collect();

        Self {
            buckets,
            bucket_counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Observe a value
    pub fn observe(&self, value: f64) {
        // Find the bucket
        let mut idx = self.buckets.len();
        for (i, &bucket) in self.buckets.iter().enumerate() {
            if value <= bucket {
                idx = i;
                break;
            }
        }

        // Increment bucket count
        self.bucket_counts[idx].fetch_add(1, Ordering::Relaxed);

        // Update sum
        loop {
            let current = self.sum.load(Ordering::Relaxed);
            let current_f64 = f64::from_bits(current);
            let new_value = (current_f64 + value).to_bits();
            if self.sum.compare_exchange(current, new_value, Ordering::Relaxed, Ordering::Relaxed).is_ok() {
                break;
            }
        }

        // Increment count
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Start a timer that observes when dropped
    pub fn start_timer(&self) -> HistogramTimer<'_> {
        HistogramTimer {
            histogram: self,
            start: Instant::now(),
        }
    }

    /// Get the count
    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Get the sum
    pub fn get_sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    /// Get bucket counts
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        self.buckets
            .iter()
            .enumerate()
            .map(|(i, &b)| (b, self.bucket_counts[i].load(Ordering::Relaxed)))
            .collect()
    }
}

/// Timer for histogram observations
pub struct HistogramTimer<'a> {
    histogram: &'a Histogram,
    start: Instant,
}

impl<'a> Drop for HistogramTimer<'a> {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.observe(duration);
    }
}

/// Handle for recording metrics
pub struct MetricsHandle {
    webhook: WebhookMetrics,
}

impl MetricsHandle {
    /// Get webhook delivery metrics (C11, §4.11)
    pub fn webhook(&self) -> &WebhookMetrics {
        &self.webhook
    }
}

/// Webhook/event-core delivery metrics (C11, §4.11): counters for the
/// publish/dispatch pipeline, latency histograms per attempt and end to
/// end, and gauges for queue depth / in-flight attempts / endpoint health.
pub struct WebhookMetrics {
    pub events_published_total: Arc<Counter>,
    pub events_processed_total: Arc<Counter>,
    pub events_dead_total: Arc<Counter>,
    pub attempts_total: Arc<Counter>,
    pub success_total: Arc<Counter>,
    /// Failures keyed by classification (`timeout`, `non_retryable`,
    /// `retryable`, `cancelled`).
    pub failure_total: Arc<RwLock<HashMap<String, Counter>>>,
    pub attempt_latency: Arc<Histogram>,
    pub end_to_end_latency: Arc<Histogram>,
    pub queue_depth: Arc<Gauge>,
    pub in_flight_attempts: Arc<Gauge>,
    /// Per-endpoint health, 0 = healthy, 1 = degraded, 2 = disabled.
    pub endpoint_health: Arc<RwLock<HashMap<String, Gauge>>>,
}

impl WebhookMetrics {
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            events_published_total: Arc::new(Counter::new()),
            events_processed_total: Arc::new(Counter::new()),
            events_dead_total: Arc::new(Counter::new()),
            attempts_total: Arc::new(Counter::new()),
            success_total: Arc::new(Counter::new()),
            failure_total: Arc::new(RwLock::new(HashMap::new())),
            attempt_latency: Arc::new(Histogram::new(config.latency_buckets.clone())),
            end_to_end_latency: Arc::new(Histogram::new(config.latency_buckets.clone())),
            queue_depth: Arc::new(Gauge::new()),
            in_flight_attempts: Arc::new(Gauge::new()),
            endpoint_health: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn record_event_published(&self) {
        self.events_published_total.inc();
    }

    pub fn record_event_processed(&self) {
        self.events_processed_total.inc();
    }

    pub fn record_event_dead(&self) {
        self.events_dead_total.inc();
    }

    pub async fn record_attempt(&self, classification: &str, success: bool, latency: Duration) {
        self.attempts_total.inc();
        self.attempt_latency.observe(latency.as_secs_f64());
        if success {
            self.success_total.inc();
        } else {
            let mut failures = self.failure_total.write().await;
            failures
                .entry(classification.to_string())
                .or_insert_with(Counter::new)
                .inc();
        }
    }

    pub fn record_end_to_end(&self, latency: Duration) {
        self.end_to_end_latency.observe(latency.as_secs_f64());
    }

    pub async fn set_endpoint_health(&self, endpoint_id: &str, value: f64) {
        let mut health = self.endpoint_health.write().await;
        health
            .entry(endpoint_id.to_string())
            .or_insert_with(Gauge::new)
            .set(value);
    }
}

/// Main Prometheus metrics registry
pub struct PrometheusMetrics {
    config: MetricsConfig,
    handle: MetricsHandle,
}

impl std::ops::Deref for PrometheusMetrics {
    type Target = MetricsHandle;

    fn deref(&self) -> &MetricsHandle {
        &self.handle
    }
}

impl PrometheusMetrics {
    /// Create a new metrics registry
    pub fn new(config: MetricsConfig) -> Self {
        let handle = MetricsHandle {
            webhook: WebhookMetrics::new(&config),
        };

        Self { config, handle }
    }

    /// Create with default configuration
    pub fn default_config() -> Self {
        Self::new(MetricsConfig::default())
    }

    /// Get the metrics handle
    pub fn handle(&self) -> &MetricsHandle {
        &self.handle
    }

    /// Render metrics in Prometheus format
    pub async fn render(&self) -> String {
        let mut output = String::new();
        let prefix = &self.config.prefix;

        // Webhook delivery metrics (C11, §4.11)
        for (name, help, value) in [
            ("events_published_total", "Total events published", self.handle.webhook.events_published_total.get()),
            ("events_processed_total", "Total events reaching processing_state=processed", self.handle.webhook.events_processed_total.get()),
            ("events_dead_total", "Total events reaching processing_state=dead", self.handle.webhook.events_dead_total.get()),
            ("attempts_total", "Total delivery attempts", self.handle.webhook.attempts_total.get()),
            ("success_total", "Total successful delivery attempts", self.handle.webhook.success_total.get()),
        ] {
            output.push_str(&format!("# HELP {prefix}_{name} {help}\n"));
            output.push_str(&format!("# TYPE {prefix}_{name} counter\n"));
            output.push_str(&format!("{prefix}_{name} {value}\n"));
        }

        output.push_str(&format!(
            "# HELP {prefix}_failure_total Total failed delivery attempts by classification\n"
        ));
        output.push_str(&format!("# TYPE {prefix}_failure_total counter\n"));
        for (classification, counter) in self.handle.webhook.failure_total.read().await.iter() {
            output.push_str(&format!(
                "{prefix}_failure_total{{classification=\"{classification}\"}} {}\n",
                counter.get()
            ));
        }

        for (name, help) in [
            ("attempt_latency_seconds", "Single HTTP delivery attempt latency"),
            ("end_to_end_latency_seconds", "Publish-to-terminal-state latency"),
        ] {
            let histogram = if name.starts_with("attempt") {
                &self.handle.webhook.attempt_latency
            } else {
                &self.handle.webhook.end_to_end_latency
            };
            output.push_str(&format!("# HELP {prefix}_{name} {help}\n"));
            output.push_str(&format!("# TYPE {prefix}_{name} histogram\n"));
            output.push_str(&format!("{prefix}_{name}_count {}\n", histogram.get_count()));
            output.push_str(&format!("{prefix}_{name}_sum {}\n", histogram.get_sum()));
            let mut cumulative = 0u64;
            for (bucket, count) in histogram.get_buckets() {
                cumulative += count;
                output.push_str(&format!("{prefix}_{name}_bucket{{le=\"{bucket}\"}} {cumulative}\n"));
            }
            output.push_str(&format!("{prefix}_{name}_bucket{{le=\"+Inf\"}} {}\n", histogram.get_count()));
        }

        output.push_str(&format!("# HELP {prefix}_queue_depth Pending stream entries awaiting dispatch\n"));
        output.push_str(&format!("# TYPE {prefix}_queue_depth gauge\n"));
        output.push_str(&format!("{prefix}_queue_depth {}\n", self.handle.webhook.queue_depth.get()));

        output.push_str(&format!("# HELP {prefix}_in_flight_attempts HTTP delivery attempts currently executing\n"));
        output.push_str(&format!("# TYPE {prefix}_in_flight_attempts gauge\n"));
        output.push_str(&format!("{prefix}_in_flight_attempts {}\n", self.handle.webhook.in_flight_attempts.get()));

        output.push_str(&format!("# HELP {prefix}_endpoint_health Endpoint health (0=healthy, 1=degraded, 2=disabled)\n"));
        output.push_str(&format!("# TYPE {prefix}_endpoint_health gauge\n"));
        for (endpoint_id, gauge) in self.handle.webhook.endpoint_health.read().await.iter() {
            output.push_str(&format!(
                "{prefix}_endpoint_health{{endpoint_id=\"{endpoint_id}\"}} {}\n",
                gauge.get()
            ));
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);

        counter.inc();
        assert_eq!(counter.get(), 1);

        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new();
        assert_eq!(gauge.get(), 0.0);

        gauge.set(42.5);
        assert_eq!(gauge.get(), 42.5);

        gauge.inc();
        assert_eq!(gauge.get(), 43.5);

        gauge.dec();
        assert_eq!(gauge.get(), 42.5);
    }

    #[test]
    fn test_histogram() {
        let histogram = Histogram::new(vec![0.1, 0.5, 1.0]);

        histogram.observe(0.05);
        histogram.observe(0.3);
        histogram.observe(0.8);
        histogram.observe(2.0);

        assert_eq!(histogram.get_count(), 4);
        assert!((histogram.get_sum() - 3.15).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_render_metrics() {
        let metrics = PrometheusMetrics::default_config();

        metrics.handle.webhook.record_event_published();
        metrics.handle.webhook.set_endpoint_health("ep1", 1.0).await;

        let output = metrics.render().await;

        assert!(output.contains("eventd_events_published_total 1"));
        assert!(output.contains("eventd_endpoint_health{endpoint_id=\"ep1\"} 1"));
    }

    #[tokio::test]
    async fn test_webhook_metrics_record_attempt_failure_classification() {
        let config = MetricsConfig::default();
        let webhook = WebhookMetrics::new(&config);

        webhook.record_attempt("timeout", false, Duration::from_millis(5)).await;
        webhook.record_attempt("success", true, Duration::from_millis(5)).await;

        assert_eq!(webhook.attempts_total.get(), 2);
        assert_eq!(webhook.success_total.get(), 1);
        assert_eq!(webhook.failure_total.read().await.get("timeout").unwrap().get(), 1);
    }
}
