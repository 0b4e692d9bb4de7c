//! Request/response bodies for the endpoint management and observability
//! routes (§6.2, §6.3). Kept separate from `eventcore::types` so the wire
//! shape can diverge from the storage shape (e.g. accepting a plaintext
//! secret on create, never echoing it back).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use eventcore::types::{
    EndpointHealth, EndpointId, EventId, EventPattern, FilterExpr, HttpMethod, RetryPolicy,
    SchemaName, WebhookEndpoint,
};
use serde::{Deserialize, Serialize};

fn default_timeout_seconds() -> u64 {
    WebhookEndpoint::default_timeout().as_secs()
}

fn default_signature_header() -> String {
    WebhookEndpoint::default_signature_header()
}

#[derive(Debug, Deserialize)]
pub struct RetryPolicyRequest {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,
    #[serde(default = "default_base_backoff_seconds")]
    pub base_backoff_seconds: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_seconds: u64,
}

fn default_max_attempts() -> u8 {
    RetryPolicy::default().max_attempts
}
fn default_base_backoff_seconds() -> u64 {
    RetryPolicy::default().base_backoff.as_secs()
}
fn default_multiplier() -> f64 {
    RetryPolicy::default().multiplier
}
fn default_jitter() -> f64 {
    RetryPolicy::default().jitter
}
fn default_max_backoff_seconds() -> u64 {
    RetryPolicy::default().max_backoff.as_secs()
}

impl From<RetryPolicyRequest> for RetryPolicy {
    fn from(r: RetryPolicyRequest) -> Self {
        RetryPolicy {
            max_attempts: r.max_attempts,
            base_backoff: Duration::from_secs(r.base_backoff_seconds),
            multiplier: r.multiplier,
            jitter: r.jitter,
            max_backoff: Duration::from_secs(r.max_backoff_seconds),
        }
    }
}

/// `POST /v1/webhook-endpoints` body.
#[derive(Debug, Deserialize)]
pub struct CreateEndpointRequest {
    pub schema: String,
    pub name: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: HttpMethod,
    pub secret: String,
    #[serde(default = "default_signature_header")]
    pub signature_header_name: String,
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicyRequest>,
    #[serde(default)]
    pub event_filters: Vec<String>,
    #[serde(default)]
    pub filter_expression: Option<FilterExpr>,
    pub created_by: String,
}

fn default_method() -> HttpMethod {
    HttpMethod::Post
}

impl CreateEndpointRequest {
    pub fn into_endpoint(self) -> WebhookEndpoint {
        let now = Utc::now();
        WebhookEndpoint {
            endpoint_id: EndpointId::new(),
            owner_scope: SchemaName::new_unchecked(self.schema),
            name: self.name,
            url: self.url,
            method: self.method,
            secret: self.secret.into_bytes(),
            signature_header_name: self.signature_header_name,
            custom_headers: self.custom_headers,
            timeout: Duration::from_secs(self.timeout_seconds),
            retry_policy: self.retry_policy.map(Into::into).unwrap_or_default(),
            event_filters: self.event_filters.into_iter().map(EventPattern).collect(),
            filter_expression: self.filter_expression,
            health: EndpointHealth::Healthy,
            consecutive_failures: 0,
            is_active: true,
            created_by: self.created_by,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// `PATCH /v1/webhook-endpoints/{id}` body: every field optional, applied
/// over the existing row.
#[derive(Debug, Deserialize, Default)]
pub struct UpdateEndpointRequest {
    pub name: Option<String>,
    pub url: Option<String>,
    pub method: Option<HttpMethod>,
    pub secret: Option<String>,
    pub signature_header_name: Option<String>,
    pub custom_headers: Option<HashMap<String, String>>,
    pub timeout_seconds: Option<u64>,
    pub retry_policy: Option<RetryPolicyRequest>,
    pub event_filters: Option<Vec<String>>,
    pub filter_expression: Option<Option<FilterExpr>>,
    pub is_active: Option<bool>,
    /// Explicit operator health override (§4.4: "on M further failures or
    /// explicit operator action, degraded→disabled"). Applied by the
    /// handler via `EndpointRegistry::set_health` rather than by `apply`,
    /// since it bypasses the automatic failure-count transition and is not
    /// a plain column copy.
    pub health: Option<EndpointHealth>,
}

impl UpdateEndpointRequest {
    pub fn apply(self, mut endpoint: WebhookEndpoint) -> WebhookEndpoint {
        if let Some(name) = self.name {
            endpoint.name = name;
        }
        if let Some(url) = self.url {
            endpoint.url = url;
        }
        if let Some(method) = self.method {
            endpoint.method = method;
        }
        if let Some(secret) = self.secret {
            endpoint.secret = secret.into_bytes();
        }
        if let Some(header) = self.signature_header_name {
            endpoint.signature_header_name = header;
        }
        if let Some(headers) = self.custom_headers {
            endpoint.custom_headers = headers;
        }
        if let Some(timeout_seconds) = self.timeout_seconds {
            endpoint.timeout = Duration::from_secs(timeout_seconds);
        }
        if let Some(policy) = self.retry_policy {
            endpoint.retry_policy = policy.into();
        }
        if let Some(patterns) = self.event_filters {
            endpoint.event_filters = patterns.into_iter().map(EventPattern).collect();
        }
        if let Some(filter) = self.filter_expression {
            endpoint.filter_expression = filter;
        }
        if let Some(is_active) = self.is_active {
            endpoint.is_active = is_active;
        }
        endpoint
    }
}

/// `GET`/`POST` response shape for a `WebhookEndpoint`. A thin projection
/// rather than `#[derive(Serialize)]` on `WebhookEndpoint` directly so the
/// wire format (seconds, not a serialized `Duration` struct) stays stable
/// independent of the storage type.
#[derive(Debug, Serialize)]
pub struct EndpointResponse {
    pub endpoint_id: EndpointId,
    pub schema: String,
    pub name: String,
    pub url: String,
    pub method: HttpMethod,
    pub signature_header_name: String,
    pub custom_headers: HashMap<String, String>,
    pub timeout_seconds: u64,
    pub retry_policy: RetryPolicyResponse,
    pub event_filters: Vec<String>,
    pub filter_expression: Option<FilterExpr>,
    pub health: EndpointHealth,
    pub consecutive_failures: u32,
    pub is_active: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct RetryPolicyResponse {
    pub max_attempts: u8,
    pub base_backoff_seconds: u64,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_backoff_seconds: u64,
}

impl From<WebhookEndpoint> for EndpointResponse {
    fn from(e: WebhookEndpoint) -> Self {
        Self {
            endpoint_id: e.endpoint_id,
            schema: e.owner_scope.as_str().to_string(),
            name: e.name,
            url: e.url,
            method: e.method,
            signature_header_name: e.signature_header_name,
            custom_headers: e.custom_headers,
            timeout_seconds: e.timeout.as_secs(),
            retry_policy: RetryPolicyResponse {
                max_attempts: e.retry_policy.max_attempts,
                base_backoff_seconds: e.retry_policy.base_backoff.as_secs(),
                multiplier: e.retry_policy.multiplier,
                jitter: e.retry_policy.jitter,
                max_backoff_seconds: e.retry_policy.max_backoff.as_secs(),
            },
            event_filters: e.event_filters.into_iter().map(|p| p.0).collect(),
            filter_expression: e.filter_expression,
            health: e.health,
            consecutive_failures: e.consecutive_failures,
            is_active: e.is_active,
            created_by: e.created_by,
            created_at: e.created_at,
            updated_at: e.updated_at,
            deleted_at: e.deleted_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EndpointListResponse {
    pub endpoints: Vec<EndpointResponse>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListEndpointsQuery {
    pub schema: String,
    pub cursor: Option<String>,
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

fn default_list_limit() -> usize {
    50
}

/// `POST /v1/webhook-endpoints/{id}/test` body: the synthetic event to
/// deliver.
#[derive(Debug, Deserialize)]
pub struct TestDeliveryRequest {
    pub schema: String,
    #[serde(default = "default_test_event_type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_test_event_type() -> String {
    "webhook.test".to_string()
}

#[derive(Debug, Serialize)]
pub struct TestDeliveryResponse {
    pub status: &'static str,
    pub http_status: Option<u16>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AttemptsQuery {
    pub status: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct EventDetailResponse {
    pub event_id: EventId,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub processing_state: eventcore::types::ProcessingState,
    pub attempts_count: u32,
    pub attempts: Vec<eventcore::types::DeliveryAttempt>,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `filter_expression` is absent/null/set tri-state (§6.2 PATCH
    /// semantics): a missing key leaves the endpoint's filter untouched, an
    /// explicit `null` clears it, and a value replaces it.
    #[test]
    fn update_request_filter_expression_is_tristate() {
        let absent: UpdateEndpointRequest = serde_json::from_str("{}").unwrap();
        assert!(absent.filter_expression.is_none());

        let cleared: UpdateEndpointRequest =
            serde_json::from_str(r#"{"filter_expression": null}"#).unwrap();
        assert!(matches!(cleared.filter_expression, Some(None)));

        let set: UpdateEndpointRequest = serde_json::from_str(
            r#"{"filter_expression": {"op": "exists", "field": "payload.id"}}"#,
        )
        .unwrap();
        assert!(matches!(set.filter_expression, Some(Some(_))));
    }

    #[test]
    fn update_request_apply_only_touches_present_fields() {
        let original = CreateEndpointRequest {
            schema: "acme".to_string(),
            name: "ep1".to_string(),
            url: "https://example.test/hook".to_string(),
            method: HttpMethod::Post,
            secret: "0123456789abcdef0123456789abcdef".to_string(),
            signature_header_name: default_signature_header(),
            custom_headers: HashMap::new(),
            timeout_seconds: default_timeout_seconds(),
            retry_policy: None,
            event_filters: vec!["users.*".to_string()],
            filter_expression: None,
            created_by: "tester".to_string(),
        }
        .into_endpoint();

        let patch: UpdateEndpointRequest = serde_json::from_str(r#"{"name": "renamed"}"#).unwrap();
        let updated = patch.apply(original.clone());

        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.url, original.url);
        assert_eq!(
            updated.event_filters.iter().map(|p| &p.0).collect::<Vec<_>>(),
            original.event_filters.iter().map(|p| &p.0).collect::<Vec<_>>()
        );
    }

    #[test]
    fn update_request_health_override_is_absent_by_default() {
        let absent: UpdateEndpointRequest = serde_json::from_str("{}").unwrap();
        assert!(absent.health.is_none());

        let disabled: UpdateEndpointRequest =
            serde_json::from_str(r#"{"health": "disabled"}"#).unwrap();
        assert_eq!(disabled.health, Some(EndpointHealth::Disabled));
    }

    #[test]
    fn create_request_defaults_match_spec_defaults() {
        let request: CreateEndpointRequest = serde_json::from_str(
            r#"{"schema": "acme", "name": "ep1", "url": "https://example.test/hook",
                "secret": "0123456789abcdef0123456789abcdef", "created_by": "tester"}"#,
        )
        .unwrap();

        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.signature_header_name, "X-Webhook-Signature");
        assert_eq!(request.timeout_seconds, 30);
    }
}
