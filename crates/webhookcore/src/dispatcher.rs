//! Dispatcher (C10, §4.10): the orchestrator tying every other component
//! together. Runs two loops per schema:
//!
//! - **Loop A** pulls pointers off the schema-wide stream topic through one
//!   consumer group per schema, loads the event, matches it against active
//!   subscriptions, and fans out one delivery attempt per endpoint, bounded
//!   by a per-endpoint concurrency bulkhead.
//! - **Loop B** runs on an interval and reconciles state that Loop A can
//!   miss by design: leases that expired without the owning worker
//!   finishing (`reclaim_expired`), events still `pending` long after
//!   publish because the stream append failed (`scan_stale_pending`), and
//!   retries whose due time has arrived (`RetryScheduler::due`).
//!
//! A `CancellationToken` drives graceful shutdown: both loops stop pulling
//! new work immediately and the dispatcher waits up to `drain_timeout` for
//! in-flight attempts before returning.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use eventcore::config::DispatcherConfig;
use eventcore::error::CoreError;
use eventcore::events::topic_for;
use eventcore::traits::{
    AttemptRecorder, DeliveryPlan, DeliveryPlanner, EndpointRegistry, EventStore,
    HttpDeliveryAdapter, RetryScheduler, StreamEntryPointer, StreamLog, SubscriptionMatcher,
};
use eventcore::types::{DomainEvent, EndpointId, ErrorRecord, EventId, WebhookEndpoint};
use eventinfra::metrics::PrometheusMetrics;
use eventinfra::resilience::{Bulkhead, BulkheadConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A schema-wide topic — the Dispatcher drains every category a schema
/// publishes through one consumer group rather than one topic per category
/// (see the Stream Log's module docs for why this is safe).
fn schema_topic(schema: &str) -> String {
    format!("events.{schema}")
}

const CONSUMER_GROUP: &str = "dispatcher";

fn classification_label(status: eventcore::types::AttemptStatus) -> &'static str {
    use eventcore::types::AttemptStatus::*;
    match status {
        Pending => "pending",
        InFlight => "in_flight",
        Success => "success",
        Failed => "failed",
        Timeout => "timeout",
        Cancelled => "cancelled",
        Retrying => "retrying",
    }
}

pub struct Dispatcher {
    schema: String,
    config: DispatcherConfig,
    event_store: Arc<dyn EventStore>,
    stream_log: Arc<dyn StreamLog>,
    matcher: Arc<dyn SubscriptionMatcher>,
    registry: Arc<dyn EndpointRegistry>,
    planner: Arc<dyn DeliveryPlanner>,
    http_adapter: Arc<dyn HttpDeliveryAdapter>,
    attempt_recorder: Arc<dyn AttemptRecorder>,
    retry_scheduler: Arc<dyn RetryScheduler>,
    metrics: Arc<PrometheusMetrics>,
    endpoint_bulkheads: DashMap<EndpointId, Arc<Bulkhead>>,
    cancel: CancellationToken,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        schema: impl Into<String>,
        config: DispatcherConfig,
        event_store: Arc<dyn EventStore>,
        stream_log: Arc<dyn StreamLog>,
        matcher: Arc<dyn SubscriptionMatcher>,
        registry: Arc<dyn EndpointRegistry>,
        planner: Arc<dyn DeliveryPlanner>,
        http_adapter: Arc<dyn HttpDeliveryAdapter>,
        attempt_recorder: Arc<dyn AttemptRecorder>,
        retry_scheduler: Arc<dyn RetryScheduler>,
        metrics: Arc<PrometheusMetrics>,
    ) -> Self {
        Self {
            schema: schema.into(),
            config,
            event_store,
            stream_log,
            matcher,
            registry,
            planner,
            http_adapter,
            attempt_recorder,
            retry_scheduler,
            metrics,
            endpoint_bulkheads: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn bulkhead_for(&self, endpoint_id: EndpointId) -> Arc<Bulkhead> {
        self.endpoint_bulkheads
            .entry(endpoint_id)
            .or_insert_with(|| {
                Arc::new(Bulkhead::new(BulkheadConfig::new(
                    &format!("endpoint:{endpoint_id}"),
                    self.config.per_endpoint_concurrency,
                )))
            })
            .clone()
    }

    /// Spawns `workers_per_schema` copies of Loop A plus one Loop B
    /// reconciliation task, returning their join handles so the caller can
    /// await a clean shutdown.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.workers_per_schema + 1);

        for worker_index in 0..self.config.workers_per_schema {
            let dispatcher = Arc::clone(self);
            let worker_id = format!("{}-worker-{worker_index}", self.schema);
            handles.push(tokio::spawn(async move {
                dispatcher.run_stream_loop(worker_id).await;
            }));
        }

        let dispatcher = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            dispatcher.run_reconciliation_loop().await;
        }));

        handles
    }

    /// Loop A: consume the stream, resolve each pointer to its event, fan
    /// out attempts, ack. Cancellation is checked between reads so a worker
    /// parked on a blocking `read` still exits promptly once it returns.
    async fn run_stream_loop(self: Arc<Self>, worker_id: String) {
        let topic = schema_topic(&self.schema);
        if let Err(e) = self.stream_log.create_consumer_group(&topic, CONSUMER_GROUP).await {
            error!(schema = %self.schema, error = %e, "failed to create dispatcher consumer group");
            return;
        }

        info!(schema = %self.schema, worker_id, "dispatcher stream loop started");

        while !self.cancel.is_cancelled() {
            let entries = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.stream_log.read(
                    &topic,
                    CONSUMER_GROUP,
                    &worker_id,
                    self.config.read_batch_size,
                    Duration::from_secs(5),
                ) => result,
            };

            let entries = match entries {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(schema = %self.schema, worker_id, error = %e, "stream read failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };

            if entries.is_empty() {
                continue;
            }

            let mut acked = Vec::with_capacity(entries.len());
            for entry in entries {
                self.process_pointer(&entry.pointer).await;
                acked.push(entry.entry_id);
            }

            if let Err(e) = self.stream_log.ack(&topic, CONSUMER_GROUP, &acked).await {
                warn!(schema = %self.schema, worker_id, error = %e, "failed to ack stream entries");
            }
        }

        info!(schema = %self.schema, worker_id, "dispatcher stream loop stopped");
    }

    /// Loop B: lease reclamation, stale-pending republish, and due-retry
    /// republish, on `reconciliation_interval` (§4.10).
    async fn run_reconciliation_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.reconciliation_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let worker_id = format!("{}-reconciler", self.schema);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.reclaim_expired_leases(&worker_id).await;
            self.republish_stale_pending().await;
            self.republish_due_retries().await;
        }

        info!(schema = %self.schema, "dispatcher reconciliation loop stopped");
    }

    async fn reclaim_expired_leases(&self, worker_id: &str) {
        let lease_duration = self.config.drain_timeout();
        match self
            .event_store
            .reclaim_expired(&self.schema, self.config.read_batch_size, worker_id, lease_duration)
            .await
        {
            Ok(leased) if !leased.is_empty() => {
                info!(schema = %self.schema, count = leased.len(), "reclaimed expired leases");
                for leased in leased {
                    self.process_event(leased.event).await;
                }
            }
            Ok(_) => {}
            Err(e) => warn!(schema = %self.schema, error = %e, "failed to reclaim expired leases"),
        }
    }

    async fn republish_stale_pending(&self) {
        let threshold = self.config.stale_pending_threshold();
        match self
            .event_store
            .scan_stale_pending(&self.schema, threshold, self.config.read_batch_size)
            .await
        {
            Ok(events) if !events.is_empty() => {
                info!(schema = %self.schema, count = events.len(), "republishing stale pending events");
                for event in events {
                    let topic = topic_for(&event, &self.schema);
                    let pointer = StreamEntryPointer { event_id: event.event_id, schema: self.schema.clone() };
                    if let Err(e) = self.stream_log.publish(&topic, &event.partition_key, pointer).await {
                        warn!(schema = %self.schema, event_id = %event.event_id, error = %e, "stale-pending republish failed");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!(schema = %self.schema, error = %e, "failed to scan stale pending events"),
        }
    }

    async fn republish_due_retries(&self) {
        let now = Utc::now();
        match self.retry_scheduler.due(&self.schema, now, self.config.read_batch_size).await {
            Ok(due) if !due.is_empty() => {
                info!(schema = %self.schema, count = due.len(), "processing due retries");
                for entry in due {
                    self.retry_one(entry.event_id, entry.endpoint_id).await;
                }
            }
            Ok(_) => {}
            Err(e) => warn!(schema = %self.schema, error = %e, "failed to pop due retries"),
        }
    }

    /// Executes one due retry and re-finalizes the event's cross-endpoint
    /// `processing_state` so a resolution (success or exhaustion) that
    /// happens on a *retried* attempt is not stranded at `dispatched`
    /// forever (`finalize_event_state` is the only path that ever calls
    /// `mark_processed`/`mark_dead`). The other endpoints matched against
    /// this event are folded in from their recorded history rather than
    /// re-delivered, since only one (event, endpoint) pair is due right now.
    async fn retry_one(&self, event_id: EventId, endpoint_id: EndpointId) {
        let event = match self.event_store.load(event_id, &self.schema).await {
            Ok(event) => event,
            Err(e) => {
                warn!(schema = %self.schema, %event_id, error = %e, "cannot load event for due retry");
                return;
            }
        };
        let endpoint = match self.registry.get(endpoint_id, &self.schema).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(schema = %self.schema, %endpoint_id, error = %e, "cannot load endpoint for due retry");
                return;
            }
        };
        if !endpoint.is_deliverable() {
            debug!(schema = %self.schema, %endpoint_id, "skipping due retry for non-deliverable endpoint");
            return;
        }

        let endpoints = match self.matcher.matches(&event, &self.schema).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!(event_id = %event.event_id, schema = %self.schema, error = %e, "subscription matching failed for due retry");
                return;
            }
        };

        let mut outcomes = HashMap::with_capacity(endpoints.len());
        for candidate in &endpoints {
            if !candidate.is_deliverable() {
                continue;
            }
            let outcome = if candidate.endpoint_id == endpoint.endpoint_id {
                self.attempt_delivery(&event, &endpoint).await
            } else {
                self.outcome_from_history(&event, candidate).await
            };
            outcomes.insert(candidate.endpoint_id, outcome);
        }

        self.finalize_event_state(&event, &outcomes).await;
    }

    /// Derives an endpoint's current outcome from its recorded attempt
    /// history without delivering anything, for endpoints matched against
    /// an event but not the one whose retry is due this round.
    async fn outcome_from_history(&self, event: &DomainEvent, endpoint: &WebhookEndpoint) -> AttemptOutcome {
        let history = match self
            .attempt_recorder
            .history_for(event.event_id, endpoint.endpoint_id, &self.schema)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(event_id = %event.event_id, endpoint_id = %endpoint.endpoint_id, error = %e, "failed to load attempt history for due retry");
                return AttemptOutcome::Deferred;
            }
        };
        if history.has_success() {
            return AttemptOutcome::Success;
        }
        match self.planner.plan(event, endpoint, &history) {
            DeliveryPlan::Exhausted => AttemptOutcome::Exhausted,
            DeliveryPlan::Attempt { .. } => AttemptOutcome::Retrying,
        }
    }

    /// Resolves a stream pointer to its event and endpoints, and dispatches
    /// one attempt per matched endpoint.
    async fn process_pointer(&self, pointer: &StreamEntryPointer) {
        let event = match self.event_store.load(pointer.event_id, &pointer.schema).await {
            Ok(event) => event,
            Err(CoreError::NotFound(_)) => {
                // The append that should have preceded this pointer never
                // landed, or the event was already fully processed and
                // pruned. Either way there is nothing left to dispatch.
                return;
            }
            Err(e) => {
                warn!(event_id = %pointer.event_id, schema = %pointer.schema, error = %e, "failed to load event for dispatch");
                return;
            }
        };
        self.process_event(event).await;
    }

    async fn process_event(&self, event: DomainEvent) {
        let endpoints = match self.matcher.matches(&event, &self.schema).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!(event_id = %event.event_id, schema = %self.schema, error = %e, "subscription matching failed");
                return;
            }
        };

        if endpoints.is_empty() {
            if let Err(e) = self.event_store.mark_processed(event.event_id, &self.schema).await {
                warn!(event_id = %event.event_id, error = %e, "failed to mark unmatched event processed");
            }
            self.metrics.webhook().record_event_processed();
            return;
        }

        let mut outcomes = HashMap::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            if !endpoint.is_deliverable() {
                continue;
            }
            let attempted = self.attempt_delivery(&event, endpoint).await;
            outcomes.insert(endpoint.endpoint_id, attempted);
        }

        self.finalize_event_state(&event, &outcomes).await;
    }

    /// Plans, delivers, records, and (if retryable) schedules a retry for
    /// one (event, endpoint) pair. Returns whether the pair reached a
    /// terminal success.
    async fn attempt_delivery(&self, event: &DomainEvent, endpoint: &WebhookEndpoint) -> AttemptOutcome {
        let bulkhead = self.bulkhead_for(endpoint.endpoint_id);
        let _permit = bulkhead.acquire().await;

        let history = match self
            .attempt_recorder
            .history_for(event.event_id, endpoint.endpoint_id, &self.schema)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(event_id = %event.event_id, endpoint_id = %endpoint.endpoint_id, error = %e, "failed to load attempt history");
                return AttemptOutcome::Deferred;
            }
        };

        if history.has_success() {
            return AttemptOutcome::Success;
        }

        let plan = self.planner.plan(event, endpoint, &history);
        let (attempt_number, max_attempts, delay, deadline, idempotency_key) = match plan {
            DeliveryPlan::Attempt { attempt_number, max_attempts, delay_before_this_attempt, deadline, idempotency_key } => {
                (attempt_number, max_attempts, delay_before_this_attempt, deadline, idempotency_key)
            }
            DeliveryPlan::Exhausted => return AttemptOutcome::Exhausted,
        };

        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        let timer_start = std::time::Instant::now();
        let result = self
            .http_adapter
            .deliver(attempt_number, max_attempts, deadline, &idempotency_key, event, endpoint)
            .await;
        let classification = classification_label(result.attempt.status);
        self.metrics
            .webhook()
            .record_attempt(classification, result.attempt.status == eventcore::types::AttemptStatus::Success, timer_start.elapsed())
            .await;

        let succeeded = result.attempt.status == eventcore::types::AttemptStatus::Success;
        let retryable = result.retryable;
        let retry_after = result.retry_after;

        if let Err(e) = self.attempt_recorder.record(result.attempt, &self.schema).await {
            error!(event_id = %event.event_id, endpoint_id = %endpoint.endpoint_id, error = %e, "failed to record delivery attempt");
        }
        if let Err(e) = self.event_store.increment_attempts(event.event_id, &self.schema).await {
            warn!(event_id = %event.event_id, error = %e, "failed to increment attempt counter");
        }

        if succeeded {
            return AttemptOutcome::Success;
        }

        if !retryable {
            return AttemptOutcome::Exhausted;
        }

        // Re-plan against the now-updated history to get the policy's own
        // next delay, then take the larger of that and any `Retry-After`
        // the subscriber sent (§4.9: "429 with Retry-After: 30s -> next_retry_at
        // = now + max(30s, policy.next_delay)").
        let updated_history = match self
            .attempt_recorder
            .history_for(event.event_id, endpoint.endpoint_id, &self.schema)
            .await
        {
            Ok(history) => history,
            Err(_) => history,
        };
        let next_plan = self.planner.plan(event, endpoint, &updated_history);
        let policy_delay = match next_plan {
            DeliveryPlan::Attempt { delay_before_this_attempt, .. } => delay_before_this_attempt,
            DeliveryPlan::Exhausted => return AttemptOutcome::Exhausted,
        };
        let delay = retry_after.map(|ra| ra.max(policy_delay)).unwrap_or(policy_delay);
        let next_retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

        if let Err(e) = self
            .retry_scheduler
            .schedule(&self.schema, event.event_id, endpoint.endpoint_id, attempt_number + 1, next_retry_at)
            .await
        {
            error!(event_id = %event.event_id, endpoint_id = %endpoint.endpoint_id, error = %e, "failed to schedule retry");
        }

        AttemptOutcome::Retrying
    }

    /// Rolls per-endpoint outcomes up into the event's cross-endpoint
    /// `processing_state` (§4.8): `processed` once every endpoint reached a
    /// terminal state and at least one succeeded (or there was nothing to
    /// deliver to), `dead` once every endpoint is exhausted with no
    /// success. Anything still retrying leaves the event `dispatched`.
    async fn finalize_event_state(&self, event: &DomainEvent, outcomes: &HashMap<EndpointId, AttemptOutcome>) {
        if outcomes.values().any(|o| matches!(o, AttemptOutcome::Retrying | AttemptOutcome::Deferred)) {
            return;
        }

        let any_success = outcomes.values().any(|o| matches!(o, AttemptOutcome::Success));
        if any_success {
            if let Err(e) = self.event_store.mark_processed(event.event_id, &self.schema).await {
                warn!(event_id = %event.event_id, error = %e, "failed to mark event processed");
            }
            self.metrics.webhook().record_event_processed();
        } else {
            let error = ErrorRecord {
                code: "all_endpoints_exhausted".to_string(),
                message: "every matched endpoint exhausted its retry budget without success".to_string(),
            };
            if let Err(e) = self.event_store.mark_dead(event.event_id, &self.schema, error).await {
                warn!(event_id = %event.event_id, error = %e, "failed to mark event dead");
            }
            self.metrics.webhook().record_event_dead();
        }
    }

    /// Waits for in-flight work to settle, or `drain_timeout`, whichever
    /// comes first, after cancellation has been requested.
    pub async fn shutdown(self: &Arc<Self>, handles: Vec<JoinHandle<()>>) {
        self.cancel.cancel();
        let drain = self.config.drain_timeout();
        let joined = tokio::time::timeout(drain, futures::future::join_all(handles)).await;
        if joined.is_err() {
            warn!(schema = %self.schema, timeout_secs = drain.as_secs(), "dispatcher did not drain within the timeout");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    Success,
    Exhausted,
    Retrying,
    /// The dispatcher could not even determine history/plan this round;
    /// treated like an in-progress retry so the event is left alone rather
    /// than marked dead on what may be a transient infra hiccup.
    Deferred,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use eventcore::error::CoreError;
    use eventcore::traits::{AttemptHistory, DueRetry, LeasedEvent, StreamEntry};
    use eventcore::types::{
        AttemptId, AttemptRequest, AttemptResponse, AttemptStatus, DeliveryAttempt, EndpointHealth,
        EventMetadata, HttpMethod, RetryPolicy, SchemaName, Subscription,
    };
    use eventcore::CoreResult;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[test]
    fn schema_topic_is_schema_scoped() {
        assert_eq!(schema_topic("acme"), "events.acme");
    }

    #[derive(Default)]
    struct FakeEventStore {
        events: Mutex<HashMap<EventId, DomainEvent>>,
    }

    impl FakeEventStore {
        fn with(event: DomainEvent) -> Self {
            let mut events = HashMap::new();
            events.insert(event.event_id, event);
            Self { events: Mutex::new(events) }
        }

        fn state_of(&self, event_id: EventId) -> eventcore::types::ProcessingState {
            self.events.lock().get(&event_id).unwrap().processing_state
        }
    }

    #[async_trait]
    impl EventStore for FakeEventStore {
        async fn append(&self, event: DomainEvent, _schema: &str) -> CoreResult<EventId> {
            let id = event.event_id;
            self.events.lock().insert(id, event);
            Ok(id)
        }

        async fn load(&self, event_id: EventId, _schema: &str) -> CoreResult<DomainEvent> {
            self.events
                .lock()
                .get(&event_id)
                .cloned()
                .ok_or_else(|| CoreError::NotFound("no such event".into()))
        }

        async fn claim_pending(
            &self,
            _schema: &str,
            _limit: usize,
            _worker_id: &str,
            _lease_duration: Duration,
        ) -> CoreResult<Vec<LeasedEvent>> {
            Ok(Vec::new())
        }

        async fn reclaim_expired(
            &self,
            _schema: &str,
            _limit: usize,
            _worker_id: &str,
            _lease_duration: Duration,
        ) -> CoreResult<Vec<LeasedEvent>> {
            Ok(Vec::new())
        }

        async fn scan_stale_pending(
            &self,
            _schema: &str,
            _older_than: Duration,
            _limit: usize,
        ) -> CoreResult<Vec<DomainEvent>> {
            Ok(Vec::new())
        }

        async fn mark_processed(&self, event_id: EventId, _schema: &str) -> CoreResult<()> {
            if let Some(event) = self.events.lock().get_mut(&event_id) {
                event.processing_state = eventcore::types::ProcessingState::Processed;
            }
            Ok(())
        }

        async fn mark_dead(&self, event_id: EventId, _schema: &str, error: ErrorRecord) -> CoreResult<()> {
            if let Some(event) = self.events.lock().get_mut(&event_id) {
                event.processing_state = eventcore::types::ProcessingState::Dead;
                event.last_error = Some(error);
            }
            Ok(())
        }

        async fn increment_attempts(&self, event_id: EventId, _schema: &str) -> CoreResult<()> {
            if let Some(event) = self.events.lock().get_mut(&event_id) {
                event.attempts_count += 1;
            }
            Ok(())
        }

        async fn count_by_state(&self, _schema: &str, _state: eventcore::types::ProcessingState) -> CoreResult<u64> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct NoopStreamLog;

    #[async_trait]
    impl StreamLog for NoopStreamLog {
        async fn publish(&self, _topic: &str, _partition_key: &str, _entry: StreamEntryPointer) -> CoreResult<String> {
            Ok("1".to_string())
        }

        async fn create_consumer_group(&self, _topic: &str, _group: &str) -> CoreResult<()> {
            Ok(())
        }

        async fn read(
            &self,
            _topic: &str,
            _group: &str,
            _consumer_id: &str,
            _max_entries: usize,
            _block: Duration,
        ) -> CoreResult<Vec<StreamEntry>> {
            Ok(Vec::new())
        }

        async fn ack(&self, _topic: &str, _group: &str, _entry_ids: &[String]) -> CoreResult<()> {
            Ok(())
        }

        async fn nack(&self, _topic: &str, _group: &str, _entry_ids: &[String], _requeue: bool) -> CoreResult<()> {
            Ok(())
        }

        async fn pending(&self, _topic: &str, _group: &str) -> CoreResult<Vec<StreamEntry>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct FakeSubscriptionMatcher {
        endpoints: Mutex<Vec<WebhookEndpoint>>,
    }

    #[async_trait]
    impl SubscriptionMatcher for FakeSubscriptionMatcher {
        async fn matches(&self, _event: &DomainEvent, _schema: &str) -> CoreResult<Vec<WebhookEndpoint>> {
            Ok(self.endpoints.lock().clone())
        }
    }

    struct FakeEndpointRegistry {
        endpoints: Mutex<HashMap<EndpointId, WebhookEndpoint>>,
    }

    impl FakeEndpointRegistry {
        fn new(endpoints: Vec<WebhookEndpoint>) -> Self {
            Self {
                endpoints: Mutex::new(endpoints.into_iter().map(|e| (e.endpoint_id, e)).collect()),
            }
        }
    }

    #[async_trait]
    impl EndpointRegistry for FakeEndpointRegistry {
        async fn create(&self, endpoint: WebhookEndpoint) -> CoreResult<WebhookEndpoint> {
            Ok(endpoint)
        }

        async fn get(&self, endpoint_id: EndpointId, _schema: &str) -> CoreResult<WebhookEndpoint> {
            self.endpoints
                .lock()
                .get(&endpoint_id)
                .cloned()
                .ok_or_else(|| CoreError::NotFound("endpoint".into()))
        }

        async fn list(
            &self,
            _schema: &str,
            _cursor: Option<String>,
            _limit: usize,
        ) -> CoreResult<(Vec<WebhookEndpoint>, Option<String>)> {
            Ok((self.endpoints.lock().values().cloned().collect(), None))
        }

        async fn update(&self, endpoint: WebhookEndpoint) -> CoreResult<WebhookEndpoint> {
            Ok(endpoint)
        }

        async fn soft_delete(&self, _endpoint_id: EndpointId, _schema: &str) -> CoreResult<()> {
            Ok(())
        }

        async fn record_outcome(&self, _endpoint_id: EndpointId, _schema: &str, _success: bool) -> CoreResult<EndpointHealth> {
            Ok(EndpointHealth::Healthy)
        }

        async fn set_health(&self, _endpoint_id: EndpointId, _schema: &str, _health: EndpointHealth) -> CoreResult<()> {
            Ok(())
        }

        async fn subscriptions_for_schema(&self, _schema: &str) -> CoreResult<Vec<Subscription>> {
            Ok(Vec::new())
        }
    }

    /// Each queued `(AttemptStatus, retryable)` pair mirrors what
    /// `classify()` would hand back in the real adapter; `deliver` combines
    /// it with `max_attempts_reached` exactly as `ReqwestHttpDeliveryAdapter`
    /// does, so planner-driven exhaustion is exercised faithfully.
    #[derive(Default)]
    struct FakeHttpDeliveryAdapter {
        responses: Mutex<HashMap<EndpointId, VecDeque<(AttemptStatus, bool)>>>,
        calls: Mutex<HashMap<EndpointId, u32>>,
    }

    impl FakeHttpDeliveryAdapter {
        fn new(responses: HashMap<EndpointId, Vec<(AttemptStatus, bool)>>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(|(k, v)| (k, v.into())).collect()),
                calls: Mutex::new(HashMap::new()),
            }
        }

        fn call_count(&self, endpoint_id: EndpointId) -> u32 {
            *self.calls.lock().get(&endpoint_id).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl HttpDeliveryAdapter for FakeHttpDeliveryAdapter {
        async fn deliver(
            &self,
            plan_attempt_number: u16,
            max_attempts: u8,
            _deadline: chrono::DateTime<Utc>,
            idempotency_key: &str,
            event: &DomainEvent,
            endpoint: &WebhookEndpoint,
        ) -> eventcore::traits::AttemptResult {
            *self.calls.lock().entry(endpoint.endpoint_id).or_insert(0) += 1;

            let (status, retryable) = self
                .responses
                .lock()
                .get_mut(&endpoint.endpoint_id)
                .and_then(|q| q.pop_front())
                .unwrap_or((AttemptStatus::Failed, true));

            let error = if status == AttemptStatus::Success {
                None
            } else {
                Some(ErrorRecord { code: "fake_failure".to_string(), message: "fake delivery failure".to_string() })
            };

            let max_attempts_reached = plan_attempt_number >= max_attempts as u16;
            let attempt = DeliveryAttempt {
                attempt_id: AttemptId::new(),
                endpoint_id: endpoint.endpoint_id,
                event_id: event.event_id,
                attempt_number: plan_attempt_number,
                status,
                request: AttemptRequest {
                    url: endpoint.url.clone(),
                    method: endpoint.method,
                    headers: HashMap::new(),
                    body_bytes: Vec::new(),
                    signature: idempotency_key.to_string(),
                },
                response: Some(AttemptResponse {
                    status_code: if status == AttemptStatus::Success { 200 } else { 500 },
                    headers: HashMap::new(),
                    body_bytes: Vec::new(),
                    truncated: false,
                    latency_ms: 1,
                }),
                error,
                scheduled_at: Utc::now(),
                started_at: Some(Utc::now()),
                completed_at: Some(Utc::now()),
                next_retry_at: None,
                max_attempts_reached,
            };

            eventcore::traits::AttemptResult {
                attempt,
                retryable: retryable && !max_attempts_reached,
                retry_after: None,
            }
        }
    }

    #[derive(Default)]
    struct FakeAttemptRecorder {
        attempts: Mutex<Vec<DeliveryAttempt>>,
    }

    #[async_trait]
    impl AttemptRecorder for FakeAttemptRecorder {
        async fn record(&self, attempt: DeliveryAttempt, _schema: &str) -> CoreResult<()> {
            let mut attempts = self.attempts.lock();
            attempts.retain(|a| {
                !(a.event_id == attempt.event_id
                    && a.endpoint_id == attempt.endpoint_id
                    && a.attempt_number == attempt.attempt_number)
            });
            attempts.push(attempt);
            Ok(())
        }

        async fn history_for(&self, event_id: EventId, endpoint_id: EndpointId, _schema: &str) -> CoreResult<AttemptHistory> {
            let attempts: Vec<DeliveryAttempt> = self
                .attempts
                .lock()
                .iter()
                .filter(|a| a.event_id == event_id && a.endpoint_id == endpoint_id)
                .cloned()
                .collect();
            let max_attempt_number = attempts.iter().map(|a| a.attempt_number).max().unwrap_or(0);
            Ok(AttemptHistory { max_attempt_number, attempts })
        }

        async fn attempts_for_endpoint(
            &self,
            _endpoint_id: EndpointId,
            _schema: &str,
            _status: Option<AttemptStatus>,
            _since: Option<chrono::DateTime<Utc>>,
        ) -> CoreResult<Vec<DeliveryAttempt>> {
            Ok(Vec::new())
        }

        async fn attempts_for_event(&self, _event_id: EventId, _schema: &str) -> CoreResult<Vec<DeliveryAttempt>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct FakeRetryScheduler {
        scheduled: Mutex<Vec<(EventId, EndpointId, u16)>>,
    }

    #[async_trait]
    impl RetryScheduler for FakeRetryScheduler {
        async fn schedule(
            &self,
            _schema: &str,
            event_id: EventId,
            endpoint_id: EndpointId,
            attempt_number: u16,
            _next_retry_at: chrono::DateTime<Utc>,
        ) -> CoreResult<()> {
            self.scheduled.lock().push((event_id, endpoint_id, attempt_number));
            Ok(())
        }

        async fn due(&self, _schema: &str, _now: chrono::DateTime<Utc>, _limit: usize) -> CoreResult<Vec<DueRetry>> {
            Ok(Vec::new())
        }
    }

    fn make_endpoint(id_seed: u128, max_attempts: u8) -> WebhookEndpoint {
        let now = Utc::now();
        WebhookEndpoint {
            endpoint_id: EndpointId::from_uuid(uuid::Uuid::from_u128(id_seed)),
            owner_scope: SchemaName::new_unchecked("acme"),
            name: format!("ep{id_seed}"),
            url: "https://example.test/hook".to_string(),
            method: HttpMethod::Post,
            secret: b"0123456789abcdef0123456789abcdef".to_vec(),
            signature_header_name: WebhookEndpoint::default_signature_header(),
            custom_headers: HashMap::new(),
            timeout: WebhookEndpoint::default_timeout(),
            retry_policy: RetryPolicy {
                max_attempts,
                base_backoff: Duration::from_millis(1),
                multiplier: 1.0,
                jitter: 0.0,
                max_backoff: Duration::from_millis(1),
            },
            event_filters: Vec::new(),
            filter_expression: None,
            health: EndpointHealth::Healthy,
            consecutive_failures: 0,
            is_active: true,
            created_by: "tester".to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn make_event() -> DomainEvent {
        DomainEvent::new("users.created", "user", "u1", serde_json::json!({}), EventMetadata::default())
    }

    #[allow(clippy::too_many_arguments)]
    fn make_dispatcher(
        event_store: Arc<FakeEventStore>,
        matcher: Arc<FakeSubscriptionMatcher>,
        registry: Arc<FakeEndpointRegistry>,
        http_adapter: Arc<FakeHttpDeliveryAdapter>,
        attempt_recorder: Arc<FakeAttemptRecorder>,
        retry_scheduler: Arc<FakeRetryScheduler>,
    ) -> Dispatcher {
        Dispatcher::new(
            "acme",
            DispatcherConfig {
                workers_per_schema: 1,
                read_batch_size: 10,
                per_endpoint_concurrency: 4,
                drain_timeout_seconds: 5,
                reconciliation_interval_seconds: 5,
                stale_pending_threshold_seconds: 5,
            },
            event_store,
            Arc::new(NoopStreamLog::default()),
            matcher,
            registry,
            Arc::new(crate::planner::BackoffDeliveryPlanner::new()),
            http_adapter,
            attempt_recorder,
            retry_scheduler,
            Arc::new(PrometheusMetrics::default_config()),
        )
    }

    #[tokio::test]
    async fn success_path_marks_event_processed() {
        let event = make_event();
        let endpoint = make_endpoint(1, 5);
        let event_store = Arc::new(FakeEventStore::with(event.clone()));
        let matcher = Arc::new(FakeSubscriptionMatcher { endpoints: Mutex::new(vec![endpoint.clone()]) });
        let registry = Arc::new(FakeEndpointRegistry::new(vec![endpoint.clone()]));
        let mut responses = HashMap::new();
        responses.insert(endpoint.endpoint_id, vec![(AttemptStatus::Success, false)]);
        let http_adapter = Arc::new(FakeHttpDeliveryAdapter::new(responses));
        let attempt_recorder = Arc::new(FakeAttemptRecorder::default());
        let retry_scheduler = Arc::new(FakeRetryScheduler::default());

        let dispatcher = make_dispatcher(
            event_store.clone(),
            matcher,
            registry,
            http_adapter.clone(),
            attempt_recorder,
            retry_scheduler,
        );
        dispatcher.process_event(event.clone()).await;

        assert_eq!(event_store.state_of(event.event_id), eventcore::types::ProcessingState::Processed);
        assert_eq!(http_adapter.call_count(endpoint.endpoint_id), 1);
    }

    #[tokio::test]
    async fn retry_then_success_resolves_via_retry_one() {
        let event = make_event();
        let endpoint = make_endpoint(2, 5);
        let event_store = Arc::new(FakeEventStore::with(event.clone()));
        let matcher = Arc::new(FakeSubscriptionMatcher { endpoints: Mutex::new(vec![endpoint.clone()]) });
        let registry = Arc::new(FakeEndpointRegistry::new(vec![endpoint.clone()]));
        let mut responses = HashMap::new();
        responses.insert(endpoint.endpoint_id, vec![(AttemptStatus::Failed, true)]);
        let http_adapter = Arc::new(FakeHttpDeliveryAdapter::new(responses));
        let attempt_recorder = Arc::new(FakeAttemptRecorder::default());
        let retry_scheduler = Arc::new(FakeRetryScheduler::default());

        let dispatcher = make_dispatcher(
            event_store.clone(),
            matcher,
            registry,
            http_adapter.clone(),
            attempt_recorder.clone(),
            retry_scheduler.clone(),
        );

        // First attempt fails retryably: the event stays non-terminal and a
        // retry gets scheduled, but no mark_processed/mark_dead fires yet.
        dispatcher.process_event(event.clone()).await;
        assert!(!event_store.state_of(event.event_id).is_terminal());
        assert_eq!(retry_scheduler.scheduled.lock().len(), 1);

        // The due retry succeeds; retry_one must itself finalize the event
        // rather than leaving it stranded at `dispatched` (the bug this
        // test guards against).
        http_adapter
            .responses
            .lock()
            .get_mut(&endpoint.endpoint_id)
            .unwrap()
            .push_back((AttemptStatus::Success, false));
        dispatcher.retry_one(event.event_id, endpoint.endpoint_id).await;

        assert_eq!(event_store.state_of(event.event_id), eventcore::types::ProcessingState::Processed);
        assert_eq!(http_adapter.call_count(endpoint.endpoint_id), 2);
    }

    #[tokio::test]
    async fn exhaustion_marks_event_dead() {
        let event = make_event();
        let endpoint = make_endpoint(3, 1);
        let event_store = Arc::new(FakeEventStore::with(event.clone()));
        let matcher = Arc::new(FakeSubscriptionMatcher { endpoints: Mutex::new(vec![endpoint.clone()]) });
        let registry = Arc::new(FakeEndpointRegistry::new(vec![endpoint.clone()]));
        let mut responses = HashMap::new();
        // Retryable in principle, but max_attempts=1 means this single
        // attempt already exhausts the policy's budget.
        responses.insert(endpoint.endpoint_id, vec![(AttemptStatus::Failed, true)]);
        let http_adapter = Arc::new(FakeHttpDeliveryAdapter::new(responses));
        let attempt_recorder = Arc::new(FakeAttemptRecorder::default());
        let retry_scheduler = Arc::new(FakeRetryScheduler::default());

        let dispatcher = make_dispatcher(
            event_store.clone(),
            matcher,
            registry,
            http_adapter,
            attempt_recorder,
            retry_scheduler.clone(),
        );
        dispatcher.process_event(event.clone()).await;

        assert_eq!(event_store.state_of(event.event_id), eventcore::types::ProcessingState::Dead);
        assert!(retry_scheduler.scheduled.lock().is_empty());
    }

    #[tokio::test]
    async fn multi_endpoint_partial_retry_finalizes_once_the_last_endpoint_resolves() {
        let event = make_event();
        let ep_a = make_endpoint(4, 5);
        let ep_b = make_endpoint(5, 5);
        let event_store = Arc::new(FakeEventStore::with(event.clone()));
        let matcher = Arc::new(FakeSubscriptionMatcher {
            endpoints: Mutex::new(vec![ep_a.clone(), ep_b.clone()]),
        });
        let registry = Arc::new(FakeEndpointRegistry::new(vec![ep_a.clone(), ep_b.clone()]));
        let mut responses = HashMap::new();
        responses.insert(ep_a.endpoint_id, vec![(AttemptStatus::Success, false)]);
        responses.insert(ep_b.endpoint_id, vec![(AttemptStatus::Failed, true)]);
        let http_adapter = Arc::new(FakeHttpDeliveryAdapter::new(responses));
        let attempt_recorder = Arc::new(FakeAttemptRecorder::default());
        let retry_scheduler = Arc::new(FakeRetryScheduler::default());

        let dispatcher = make_dispatcher(
            event_store.clone(),
            matcher,
            registry,
            http_adapter.clone(),
            attempt_recorder,
            retry_scheduler,
        );

        // ep_a resolves immediately; ep_b is still retrying, so the event
        // as a whole must not be finalized yet.
        dispatcher.process_event(event.clone()).await;
        assert!(!event_store.state_of(event.event_id).is_terminal());
        assert_eq!(http_adapter.call_count(ep_a.endpoint_id), 1);

        // Only ep_b's retry comes due; ep_a's prior success must be folded
        // in from history rather than redelivered.
        http_adapter
            .responses
            .lock()
            .get_mut(&ep_b.endpoint_id)
            .unwrap()
            .push_back((AttemptStatus::Success, false));
        dispatcher.retry_one(event.event_id, ep_b.endpoint_id).await;

        assert_eq!(event_store.state_of(event.event_id), eventcore::types::ProcessingState::Processed);
        assert_eq!(http_adapter.call_count(ep_a.endpoint_id), 1);
        assert_eq!(http_adapter.call_count(ep_b.endpoint_id), 2);
    }
}
