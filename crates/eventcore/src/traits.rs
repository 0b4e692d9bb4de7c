//! Component contracts (C1–C9 of the design). Concrete implementations live
//! in `eventinfra` (storage/stream/scheduler-backed) and `webhookcore`
//! (matching/planning/delivery/recording), selected at daemon startup; tests
//! use in-memory doubles behind the same traits (§9).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::CoreResult;
use crate::types::{
    AttemptId, AttemptStatus, DeliveryAttempt, DomainEvent, EndpointHealth, EndpointId, EventId,
    ProcessingState, Subscription, WebhookEndpoint,
};

/// A worker's claim on a batch of pending events (`§4.1 claim_pending`).
#[derive(Debug, Clone)]
pub struct LeasedEvent {
    pub event: DomainEvent,
    pub worker_id: String,
    pub lease_deadline: DateTime<Utc>,
}

/// C1 — Durable, schema-scoped persistence of domain events (§4.1).
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: DomainEvent, schema: &str) -> CoreResult<EventId>;

    async fn load(&self, event_id: EventId, schema: &str) -> CoreResult<DomainEvent>;

    /// Returns up to `limit` pending events, atomically marking them
    /// `dispatched` with a lease. Must never hand the same event to two
    /// concurrent callers (row-level `FOR UPDATE SKIP LOCKED`).
    async fn claim_pending(
        &self,
        schema: &str,
        limit: usize,
        worker_id: &str,
        lease_duration: Duration,
    ) -> CoreResult<Vec<LeasedEvent>>;

    /// Reclaims events whose lease has expired, atomically re-leasing them
    /// to `worker_id` (Dispatcher Loop B, §4.10).
    async fn reclaim_expired(
        &self,
        schema: &str,
        limit: usize,
        worker_id: &str,
        lease_duration: Duration,
    ) -> CoreResult<Vec<LeasedEvent>>;

    /// `pending` events older than `older_than`, for the publish-step-3
    /// reconciliation sweep (§4.3).
    async fn scan_stale_pending(
        &self,
        schema: &str,
        older_than: Duration,
        limit: usize,
    ) -> CoreResult<Vec<DomainEvent>>;

    /// No-op if already terminal.
    async fn mark_processed(&self, event_id: EventId, schema: &str) -> CoreResult<()>;

    /// No-op if already terminal.
    async fn mark_dead(
        &self,
        event_id: EventId,
        schema: &str,
        error: crate::types::ErrorRecord,
    ) -> CoreResult<()>;

    async fn increment_attempts(&self, event_id: EventId, schema: &str) -> CoreResult<()>;

    async fn count_by_state(&self, schema: &str, state: ProcessingState) -> CoreResult<u64>;
}

/// An entry read back from the Stream Log, carrying only a pointer to the
/// authoritative row in the Event Store (§4.2: "the stream carries only
/// pointers, never authoritative payloads").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StreamEntryPointer {
    pub event_id: EventId,
    pub schema: String,
}

#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub entry_id: String,
    pub pointer: StreamEntryPointer,
    pub delivery_count: u32,
}

/// C2 — Partitioned, append-only log with consumer groups (§4.2).
#[async_trait]
pub trait StreamLog: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        entry: StreamEntryPointer,
    ) -> CoreResult<String>;

    async fn create_consumer_group(&self, topic: &str, group: &str) -> CoreResult<()>;

    async fn read(
        &self,
        topic: &str,
        group: &str,
        consumer_id: &str,
        max_entries: usize,
        block: Duration,
    ) -> CoreResult<Vec<StreamEntry>>;

    async fn ack(&self, topic: &str, group: &str, entry_ids: &[String]) -> CoreResult<()>;

    async fn nack(
        &self,
        topic: &str,
        group: &str,
        entry_ids: &[String],
        requeue: bool,
    ) -> CoreResult<()>;

    async fn pending(&self, topic: &str, group: &str) -> CoreResult<Vec<StreamEntry>>;
}

/// C4 — CRUD over `WebhookEndpoint` (§4.4).
#[async_trait]
pub trait EndpointRegistry: Send + Sync {
    async fn create(&self, endpoint: WebhookEndpoint) -> CoreResult<WebhookEndpoint>;

    async fn get(&self, endpoint_id: EndpointId, schema: &str) -> CoreResult<WebhookEndpoint>;

    async fn list(
        &self,
        schema: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> CoreResult<(Vec<WebhookEndpoint>, Option<String>)>;

    async fn update(&self, endpoint: WebhookEndpoint) -> CoreResult<WebhookEndpoint>;

    /// Soft delete: sets `deleted_at`. In-flight attempts are allowed to
    /// finish; no new attempts are planned for this endpoint afterward.
    async fn soft_delete(&self, endpoint_id: EndpointId, schema: &str) -> CoreResult<()>;

    /// Applies a health transition originating from the Attempt Recorder
    /// (§4.4): `healthy -> degraded` after N consecutive failures,
    /// `degraded -> disabled` after M further failures.
    async fn record_outcome(
        &self,
        endpoint_id: EndpointId,
        schema: &str,
        success: bool,
    ) -> CoreResult<EndpointHealth>;

    async fn set_health(
        &self,
        endpoint_id: EndpointId,
        schema: &str,
        health: EndpointHealth,
    ) -> CoreResult<()>;

    async fn subscriptions_for_schema(&self, schema: &str) -> CoreResult<Vec<Subscription>>;
}

/// C5 — Maps an event to the ordered set of endpoints that must receive it
/// (§4.5).
#[async_trait]
pub trait SubscriptionMatcher: Send + Sync {
    async fn matches(&self, event: &DomainEvent, schema: &str) -> CoreResult<Vec<WebhookEndpoint>>;
}

/// Prior attempt history for one (event, endpoint) pair, as seen by the
/// Delivery Planner (§4.6).
#[derive(Debug, Clone, Default)]
pub struct AttemptHistory {
    pub max_attempt_number: u16,
    pub attempts: Vec<DeliveryAttempt>,
}

impl AttemptHistory {
    pub fn has_terminal_attempt(&self) -> bool {
        self.attempts.iter().any(|a| a.status.is_terminal())
    }

    pub fn has_success(&self) -> bool {
        self.attempts.iter().any(|a| a.status == AttemptStatus::Success)
    }
}

/// C6 — Result of planning the next delivery attempt (§4.6).
#[derive(Debug, Clone)]
pub enum DeliveryPlan {
    Attempt {
        attempt_number: u16,
        max_attempts: u8,
        delay_before_this_attempt: Duration,
        deadline: DateTime<Utc>,
        idempotency_key: String,
    },
    /// `attempt_number > max_attempts`; the planner never invokes delivery
    /// itself on this path.
    Exhausted,
}

pub trait DeliveryPlanner: Send + Sync {
    fn plan(
        &self,
        event: &DomainEvent,
        endpoint: &WebhookEndpoint,
        history: &AttemptHistory,
    ) -> DeliveryPlan;
}

/// C7 — Outcome of one HTTP delivery attempt (§4.7).
#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub attempt: DeliveryAttempt,
    /// Whether a retry should be scheduled for this (event, endpoint) pair,
    /// given the attempt's classification and remaining attempt budget.
    pub retryable: bool,
    /// Present only for HTTP 429/425 responses that carried `Retry-After`.
    pub retry_after: Option<Duration>,
}

#[async_trait]
pub trait HttpDeliveryAdapter: Send + Sync {
    async fn deliver(
        &self,
        plan_attempt_number: u16,
        max_attempts: u8,
        deadline: DateTime<Utc>,
        idempotency_key: &str,
        event: &DomainEvent,
        endpoint: &WebhookEndpoint,
    ) -> AttemptResult;
}

/// C8 — Persists each attempt and computes aggregate state (§4.8).
#[async_trait]
pub trait AttemptRecorder: Send + Sync {
    /// Upserts keyed by `(event_id, endpoint_id, attempt_number)` so a
    /// retried recording after a successful-but-unpersisted HTTP call is a
    /// no-op (§4.8 failure semantics, §8 idempotency property).
    async fn record(&self, attempt: DeliveryAttempt, schema: &str) -> CoreResult<()>;

    async fn history_for(
        &self,
        event_id: EventId,
        endpoint_id: EndpointId,
        schema: &str,
    ) -> CoreResult<AttemptHistory>;

    async fn attempts_for_endpoint(
        &self,
        endpoint_id: EndpointId,
        schema: &str,
        status: Option<AttemptStatus>,
        since: Option<DateTime<Utc>>,
    ) -> CoreResult<Vec<DeliveryAttempt>>;

    async fn attempts_for_event(
        &self,
        event_id: EventId,
        schema: &str,
    ) -> CoreResult<Vec<DeliveryAttempt>>;
}

/// C9 — Enqueues a due-time reference for a retry (§4.9).
#[async_trait]
pub trait RetryScheduler: Send + Sync {
    /// Idempotent: a duplicate schedule for the same
    /// `(event_id, endpoint_id, attempt_number)` is a no-op.
    async fn schedule(
        &self,
        schema: &str,
        event_id: EventId,
        endpoint_id: EndpointId,
        attempt_number: u16,
        next_retry_at: DateTime<Utc>,
    ) -> CoreResult<()>;

    /// Pops entries whose due time has passed, for the sweeper worker to
    /// re-publish to the Stream Log.
    async fn due(&self, schema: &str, now: DateTime<Utc>, limit: usize) -> CoreResult<Vec<DueRetry>>;
}

#[derive(Debug, Clone)]
pub struct DueRetry {
    pub event_id: EventId,
    pub endpoint_id: EndpointId,
    pub attempt_number: u16,
}

/// Composite health of one dependency, as surfaced by C11's `GET
/// /v1/health` (§4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Up,
    Degraded,
    Down,
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Short name of the component (`"event_store"`, `"stream_log"`, ...).
    fn name(&self) -> &'static str;

    async fn check(&self) -> ComponentStatus;
}
