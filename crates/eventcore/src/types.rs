//! Core data model for the event and webhook delivery core (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// A time-ordered 128-bit identifier (UUIDv7). Used for both `EventId` and
/// `AttemptId` so that storage indexes keyed on insertion order get it for
/// free from the id itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeOrderedId(Uuid);

impl TimeOrderedId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TimeOrderedId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TimeOrderedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TimeOrderedId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

pub type EventId = TimeOrderedId;
pub type AttemptId = TimeOrderedId;

/// A 128-bit identifier without the ordering requirement, used for entities
/// whose creation order does not matter for query performance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpaqueId(Uuid);

impl OpaqueId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OpaqueId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OpaqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for OpaqueId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

pub type EndpointId = OpaqueId;
pub type SubscriptionId = OpaqueId;

/// Logical namespace isolating one tenant's data (`§3`, `§4.1`). Validated
/// against a conservative identifier regex by `eventtenant::isolation`
/// before ever being interpolated into a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaName(String);

impl SchemaName {
    /// Build from an already-validated string. Callers outside
    /// `eventtenant::isolation` should go through `SchemaValidator` instead.
    pub fn new_unchecked(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SchemaName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `enum: low|normal|high|critical`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// `enum: pending|dispatched|processed|failed|dead`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Pending,
    Dispatched,
    Processed,
    Failed,
    Dead,
}

impl ProcessingState {
    /// `processed` and `dead` are terminal; once reached, further
    /// transitions are rejected (§3 invariant).
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingState::Processed | ProcessingState::Dead)
    }
}

/// An error recorded on a `DomainEvent` or `DeliveryAttempt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: String,
    pub message: String,
}

/// Producer-declared envelope metadata (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMetadata {
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub request_id: Option<String>,
    pub actor: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    /// Scopes persistence; duplicated into the envelope so downstream
    /// consumers of the wire format can see it without a side channel, even
    /// though the authoritative value lives on `DomainEvent::schema`.
    pub schema_name: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A domain fact published by a producer (§3 `DomainEvent`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub metadata: EventMetadata,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub priority: Priority,
    pub partition_key: String,
    pub processing_state: ProcessingState,
    pub attempts_count: u32,
    pub last_error: Option<ErrorRecord>,
}

impl DomainEvent {
    /// Construct a new pending event. `recorded_at` is filled by the caller
    /// at persistence time (kept distinct from `occurred_at` for events
    /// replayed from an upstream source).
    pub fn new(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: serde_json::Value,
        metadata: EventMetadata,
    ) -> Self {
        let aggregate_id = aggregate_id.into();
        let now = Utc::now();
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            aggregate_type: aggregate_type.into(),
            partition_key: aggregate_id.clone(),
            aggregate_id,
            payload,
            metadata,
            occurred_at: now,
            recorded_at: now,
            priority: Priority::default(),
            processing_state: ProcessingState::Pending,
            attempts_count: 0,
            last_error: None,
        }
    }

    /// The first dotted segment of `event_type`, used for stream topic
    /// naming (§6.5).
    pub fn category(&self) -> &str {
        self.event_type.split('.').next().unwrap_or(&self.event_type)
    }

    /// Canonical outbound wire body (§6.4): `{id, type, occurred_at, data,
    /// metadata}`. `serde_json` preserves struct field order for a `Map`
    /// built this way, and all keys here are already lowercase/sorted by
    /// construction.
    pub fn to_wire_body(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.event_id.to_string(),
            "type": self.event_type,
            "occurred_at": self.occurred_at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
            "data": self.payload,
            "metadata": self.metadata,
        })
    }
}

/// `enum: POST|PUT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        }
    }
}

/// Backoff and attempt-count parameters for an endpoint (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub base_backoff: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.2,
            max_backoff: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Validates the bounds from §3: `max_attempts` in `1..=10`,
    /// `base_backoff` in `1s..=60s`, `multiplier` in `1.0..=5.0`, `jitter`
    /// in `0.0..=0.5`, `max_backoff <= 1h`.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=10).contains(&self.max_attempts) {
            return Err("max_attempts must be between 1 and 10".into());
        }
        if self.base_backoff < Duration::from_secs(1) || self.base_backoff > Duration::from_secs(60) {
            return Err("base_backoff must be between 1s and 60s".into());
        }
        if !(1.0..=5.0).contains(&self.multiplier) {
            return Err("multiplier must be between 1.0 and 5.0".into());
        }
        if !(0.0..=0.5).contains(&self.jitter) {
            return Err("jitter must be between 0.0 and 0.5".into());
        }
        if self.max_backoff > Duration::from_secs(3600) {
            return Err("max_backoff must be at most 1h".into());
        }
        Ok(())
    }
}

/// `enum: healthy|degraded|disabled`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointHealth {
    Healthy,
    Degraded,
    Disabled,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        EndpointHealth::Healthy
    }
}

/// A glob pattern over `event_type`, e.g. `users.*` or `users.**` (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventPattern(pub String);

/// A predicate tree over `event.payload` / `event.metadata` (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FilterExpr {
    Eq { field: String, value: serde_json::Value },
    Ne { field: String, value: serde_json::Value },
    In { field: String, values: Vec<serde_json::Value> },
    NotIn { field: String, values: Vec<serde_json::Value> },
    Exists { field: String },
    Gt { field: String, value: serde_json::Value },
    Ge { field: String, value: serde_json::Value },
    Lt { field: String, value: serde_json::Value },
    Le { field: String, value: serde_json::Value },
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
}

/// A subscriber destination (§3 `WebhookEndpoint`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub endpoint_id: EndpointId,
    pub owner_scope: SchemaName,
    pub name: String,
    pub url: String,
    pub method: HttpMethod,
    /// Opaque HMAC secret. Never serialized back out to API responses; see
    /// `eventapi`'s endpoint DTO which omits this field entirely.
    #[serde(skip_serializing)]
    pub secret: Vec<u8>,
    pub signature_header_name: String,
    pub custom_headers: HashMap<String, String>,
    pub timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub event_filters: Vec<EventPattern>,
    pub filter_expression: Option<FilterExpr>,
    pub health: EndpointHealth,
    pub consecutive_failures: u32,
    pub is_active: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl WebhookEndpoint {
    /// Default signature header, per §3.
    pub fn default_signature_header() -> String {
        "X-Webhook-Signature".to_string()
    }

    /// Default per-request timeout, per §3.
    pub fn default_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// An endpoint is eligible to receive deliveries only while active,
    /// not soft-deleted, and not administratively disabled (§4.4).
    pub fn is_deliverable(&self) -> bool {
        self.is_active && !self.is_deleted() && self.health != EndpointHealth::Disabled
    }
}

/// A denormalized matcher rule (§3 `Subscription`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: SubscriptionId,
    pub endpoint_id: EndpointId,
    pub event_pattern: EventPattern,
    pub filter_expression: Option<FilterExpr>,
    pub priority: i32,
    pub is_active: bool,
}

/// `enum: pending|in_flight|success|failed|timeout|cancelled|retrying`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    InFlight,
    Success,
    Failed,
    Timeout,
    Cancelled,
    Retrying,
}

impl AttemptStatus {
    /// Terminal for the (event, endpoint) pair: no further attempts may be
    /// made once in one of these states (other than `Retrying`, which
    /// implies a next attempt is scheduled).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptStatus::Success | AttemptStatus::Failed | AttemptStatus::Cancelled
        )
    }
}

/// The outbound HTTP request actually sent for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: HashMap<String, String>,
    pub body_bytes: Vec<u8>,
    pub signature: String,
}

/// The response received (if any) for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    /// Truncated to 10 KiB (§4.7).
    pub body_bytes: Vec<u8>,
    pub truncated: bool,
    pub latency_ms: u64,
}

pub const RESPONSE_BODY_TRUNCATE_BYTES: usize = 10 * 1024;

/// A single HTTP delivery try for one (event, endpoint) (§3
/// `DeliveryAttempt`). Append-only; once completed, immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub attempt_id: AttemptId,
    pub endpoint_id: EndpointId,
    pub event_id: EventId,
    pub attempt_number: u16,
    pub status: AttemptStatus,
    pub request: AttemptRequest,
    pub response: Option<AttemptResponse>,
    pub error: Option<ErrorRecord>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub max_attempts_reached: bool,
}

/// Computed rolling health for one endpoint (§3 `EndpointHealthWindow`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointHealthWindow {
    pub endpoint_id: EndpointId,
    pub window_size: usize,
    pub success_count: u32,
    pub failure_count: u32,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub computed_at: DateTime<Utc>,
}

impl EndpointHealthWindow {
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }
}
