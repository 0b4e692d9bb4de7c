//! HTTP Delivery Adapter (C7, §4.7): serializes an event to its canonical
//! wire body, signs it, sends it to the endpoint's URL, and classifies the
//! outcome into a retryable/non-retryable `AttemptResult`.

use chrono::{DateTime, Utc};
use eventcore::traits::{AttemptResult, HttpDeliveryAdapter};
use eventcore::types::{
    AttemptId, AttemptRequest, AttemptResponse, AttemptStatus, DeliveryAttempt, DomainEvent,
    ErrorRecord, RESPONSE_BODY_TRUNCATE_BYTES,
};
use eventcore::types::WebhookEndpoint;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use async_trait::async_trait;

use crate::signature;

#[derive(Debug, Clone)]
pub struct HttpAdapterConfig {
    pub max_concurrent_requests: usize,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
}

impl Default for HttpAdapterConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 256,
            pool_max_idle_per_host: 32,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Reserved header names the signing/envelope logic owns; `custom_headers`
/// may never override these (§4.7).
const RESERVED_HEADERS: &[&str] = &[
    "x-webhook-timestamp",
    "x-webhook-id",
    "x-webhook-attempt",
    "x-idempotency-key",
    "content-type",
];

pub struct ReqwestHttpDeliveryAdapter {
    client: Client,
    semaphore: Arc<Semaphore>,
}

impl ReqwestHttpDeliveryAdapter {
    pub fn new(config: &HttpAdapterConfig) -> Self {
        let client = Client::builder()
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client configuration is valid");

        Self {
            client,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_requests)),
        }
    }
}

/// `2xx` succeeds; `408`/`425`/`429` are retryable 4xx; the rest of `4xx` is
/// terminal; `5xx` is retryable; everything else (3xx, since redirects are
/// not followed) is terminal (§4.7).
fn classify(status: u16) -> (AttemptStatus, bool) {
    match status {
        200..=299 => (AttemptStatus::Success, false),
        408 | 425 | 429 => (AttemptStatus::Failed, true),
        400..=499 => (AttemptStatus::Failed, false),
        500..=599 => (AttemptStatus::Failed, true),
        _ => (AttemptStatus::Failed, false),
    }
}

/// Applies `custom_headers` to an outgoing request, dropping any entry that
/// collides (case-insensitively) with a headers the signing/envelope logic
/// owns, including the endpoint's *own configured* `signature_header_name`
/// rather than just the default (§4.7, §6.4).
fn insert_custom_headers(
    headers: &mut reqwest::header::HeaderMap,
    custom_headers: &HashMap<String, String>,
    signature_header_name: &str,
) {
    let reserved_signature_header = signature_header_name.to_ascii_lowercase();
    for (name, value) in custom_headers {
        let lname = name.to_ascii_lowercase();
        if lname == reserved_signature_header || RESERVED_HEADERS.contains(&lname.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_bytes()),
            reqwest::header::HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&Utc) - Utc::now();
    delta.to_std().ok()
}

#[async_trait]
impl HttpDeliveryAdapter for ReqwestHttpDeliveryAdapter {
    async fn deliver(
        &self,
        plan_attempt_number: u16,
        max_attempts: u8,
        deadline: DateTime<Utc>,
        idempotency_key: &str,
        event: &DomainEvent,
        endpoint: &WebhookEndpoint,
    ) -> AttemptResult {
        let scheduled_at = Utc::now();
        let body = serde_json::to_vec(&event.to_wire_body()).unwrap_or_default();
        let timestamp = scheduled_at.timestamp();
        let sig = signature::sign(&endpoint.secret, timestamp, &body);

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            endpoint.signature_header_name.parse::<reqwest::header::HeaderName>().unwrap_or(
                reqwest::header::HeaderName::from_static("x-webhook-signature"),
            ),
            sig.parse().unwrap_or_else(|_| reqwest::header::HeaderValue::from_static("")),
        );
        headers.insert(
            "x-webhook-timestamp",
            timestamp.to_string().parse().unwrap_or_else(|_| reqwest::header::HeaderValue::from_static("")),
        );
        headers.insert(
            "x-webhook-id",
            event.event_id.to_string().parse().unwrap_or_else(|_| reqwest::header::HeaderValue::from_static("")),
        );
        headers.insert(
            "x-webhook-attempt",
            plan_attempt_number
                .to_string()
                .parse()
                .unwrap_or_else(|_| reqwest::header::HeaderValue::from_static("")),
        );
        headers.insert(
            "x-idempotency-key",
            idempotency_key.parse().unwrap_or_else(|_| reqwest::header::HeaderValue::from_static("")),
        );
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );

        insert_custom_headers(&mut headers, &endpoint.custom_headers, &endpoint.signature_header_name);

        let request_record = AttemptRequest {
            url: endpoint.url.clone(),
            method: endpoint.method,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
                .collect(),
            body_bytes: body.clone(),
            signature: sig,
        };

        let connect_timeout = Duration::from_secs(10).min(endpoint.timeout / 3);

        let _permit = self.semaphore.acquire().await;
        let started_at = Utc::now();
        let started_instant = Instant::now();

        let method = match endpoint.method {
            eventcore::types::HttpMethod::Post => reqwest::Method::POST,
            eventcore::types::HttpMethod::Put => reqwest::Method::PUT,
        };

        let outcome = self
            .client
            .request(method, &endpoint.url)
            .headers(headers)
            .timeout(endpoint.timeout)
            .body(body)
            .send()
            .await;

        let completed_at = Utc::now();
        let latency_ms = started_instant.elapsed().as_millis() as u64;
        let attempt_id = AttemptId::new();
        let max_attempts_reached = plan_attempt_number >= max_attempts as u16;

        let (status, response, error, retryable, retry_after) = match outcome {
            Ok(response) => {
                let status_code = response.status().as_u16();
                let retry_after = parse_retry_after(response.headers());
                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let response_headers: HashMap<String, String> = response
                    .headers()
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
                    .collect();

                let full_body = response.bytes().await.unwrap_or_default();
                let truncated = full_body.len() > RESPONSE_BODY_TRUNCATE_BYTES;
                let body_bytes = if truncated {
                    full_body[..RESPONSE_BODY_TRUNCATE_BYTES].to_vec()
                } else {
                    full_body.to_vec()
                };
                let _ = content_type;

                let (attempt_status, retryable) = classify(status_code);
                let error = if attempt_status == AttemptStatus::Success {
                    None
                } else {
                    Some(ErrorRecord {
                        code: format!("http_{status_code}"),
                        message: format!("subscriber responded with HTTP {status_code}"),
                    })
                };

                (
                    attempt_status,
                    Some(AttemptResponse {
                        status_code,
                        headers: response_headers,
                        body_bytes,
                        truncated,
                        latency_ms,
                    }),
                    error,
                    retryable,
                    retry_after,
                )
            }
            Err(e) => {
                let status = if e.is_timeout() { AttemptStatus::Timeout } else { AttemptStatus::Failed };
                let code = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connect_error"
                } else {
                    "request_error"
                };
                (
                    status,
                    None,
                    Some(ErrorRecord {
                        code: code.to_string(),
                        message: e.to_string(),
                    }),
                    true,
                    None,
                )
            }
        };

        let _ = connect_timeout;
        let _ = deadline;

        let attempt = DeliveryAttempt {
            attempt_id,
            endpoint_id: endpoint.endpoint_id,
            event_id: event.event_id,
            attempt_number: plan_attempt_number,
            status,
            request: request_record,
            response,
            error,
            scheduled_at,
            started_at: Some(started_at),
            completed_at: Some(completed_at),
            next_retry_at: None,
            max_attempts_reached,
        };

        AttemptResult {
            attempt,
            retryable: retryable && !max_attempts_reached,
            retry_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_statuses_are_not_retryable() {
        for status in [200, 201, 204, 299] {
            let (s, retryable) = classify(status);
            assert_eq!(s, AttemptStatus::Success);
            assert!(!retryable);
        }
    }

    #[test]
    fn retryable_4xx_statuses_are_408_425_429() {
        for status in [408, 425, 429] {
            let (s, retryable) = classify(status);
            assert_eq!(s, AttemptStatus::Failed);
            assert!(retryable, "{status} should be retryable");
        }
    }

    #[test]
    fn other_4xx_statuses_are_terminal() {
        for status in [400, 401, 403, 404, 409, 422] {
            let (s, retryable) = classify(status);
            assert_eq!(s, AttemptStatus::Failed);
            assert!(!retryable, "{status} should not be retryable");
        }
    }

    #[test]
    fn all_5xx_statuses_are_retryable() {
        for status in [500, 502, 503, 599] {
            let (s, retryable) = classify(status);
            assert_eq!(s, AttemptStatus::Failed);
            assert!(retryable);
        }
    }

    #[test]
    fn redirects_are_terminal_since_they_are_never_followed() {
        let (s, retryable) = classify(302);
        assert_eq!(s, AttemptStatus::Failed);
        assert!(!retryable);
    }

    #[test]
    fn custom_header_matching_default_signature_header_is_dropped() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("x-webhook-signature", "real-signature".parse().unwrap());
        let mut custom = HashMap::new();
        custom.insert("X-Webhook-Signature".to_string(), "attacker-value".to_string());
        insert_custom_headers(&mut headers, &custom, "X-Webhook-Signature");
        assert_eq!(headers.get("x-webhook-signature").unwrap(), "real-signature");
    }

    #[test]
    fn custom_header_matching_configured_signature_header_is_dropped() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("x-my-sig", "real-signature".parse().unwrap());
        let mut custom = HashMap::new();
        custom.insert("X-My-Sig".to_string(), "attacker-value".to_string());
        insert_custom_headers(&mut headers, &custom, "X-My-Sig");
        assert_eq!(headers.get("x-my-sig").unwrap(), "real-signature");
    }

    #[test]
    fn custom_header_matching_other_reserved_headers_is_dropped() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("x-idempotency-key", "real-key".parse().unwrap());
        let mut custom = HashMap::new();
        custom.insert("X-Idempotency-Key".to_string(), "attacker-key".to_string());
        insert_custom_headers(&mut headers, &custom, "X-Webhook-Signature");
        assert_eq!(headers.get("x-idempotency-key").unwrap(), "real-key");
    }

    #[test]
    fn non_reserved_custom_header_is_applied() {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut custom = HashMap::new();
        custom.insert("X-Custom-Header".to_string(), "value".to_string());
        insert_custom_headers(&mut headers, &custom, "X-Webhook-Signature");
        assert_eq!(headers.get("x-custom-header").unwrap(), "value");
    }

    #[test]
    fn retry_after_parses_seconds_form() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "30".parse().unwrap());
        let parsed = parse_retry_after(&headers);
        assert_eq!(parsed, Some(Duration::from_secs(30)));
    }

    #[test]
    fn retry_after_is_none_when_absent() {
        let headers = reqwest::header::HeaderMap::new();
        assert!(parse_retry_after(&headers).is_none());
    }
}
