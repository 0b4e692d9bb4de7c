//! Shared application state injected into every handler (§6.2, §6.3).
//!
//! Holds references only to the trait objects a handler needs — the Event
//! Store, Endpoint Registry, Attempt Recorder, the synchronous Delivery
//! Planner/HTTP Delivery Adapter pair used by the `/test` endpoint, the
//! Publisher for the producer-facing surface, and the metrics/health
//! registries for §6.3's observability routes. The Dispatcher itself is
//! not reachable from here — it runs as its own background task per
//! schema, started by the daemon binary.

use std::sync::Arc;

use eventcore::traits::{AttemptRecorder, DeliveryPlanner, EndpointRegistry, EventStore, HttpDeliveryAdapter};
use eventinfra::health::CompositeHealthChecker;
use eventinfra::metrics::PrometheusMetrics;
use webhookcore::EventPublisher;

#[derive(Clone)]
pub struct AppState {
    pub event_store: Arc<dyn EventStore>,
    pub registry: Arc<dyn EndpointRegistry>,
    pub attempt_recorder: Arc<dyn AttemptRecorder>,
    pub planner: Arc<dyn DeliveryPlanner>,
    pub http_adapter: Arc<dyn HttpDeliveryAdapter>,
    pub publisher: Arc<EventPublisher>,
    pub metrics: Arc<PrometheusMetrics>,
    pub health: Arc<CompositeHealthChecker>,
    /// Whether the Endpoint Registry enforces the private/link-local host
    /// check on create/update (disabled only for local/test deployments).
    pub strict_host_check: bool,
}
