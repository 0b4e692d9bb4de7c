//! Delivery Planner (C6, §4.6): pure, synchronous decision of whether and
//! when the next delivery attempt for an (event, endpoint) pair should
//! happen. Never touches the network or storage itself.

use eventcore::traits::{AttemptHistory, DeliveryPlan, DeliveryPlanner};
use eventcore::types::{DomainEvent, WebhookEndpoint};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::time::Duration;

pub struct BackoffDeliveryPlanner;

impl BackoffDeliveryPlanner {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BackoffDeliveryPlanner {
    fn default() -> Self {
        Self::new()
    }
}

/// `min(max_backoff, base_backoff * multiplier^(n-2))` plus additive jitter
/// uniformly sampled from `[0, delay * jitter]` (§4.6). Attempt 1 always has
/// zero delay.
fn backoff_delay(attempt_number: u16, policy: &eventcore::types::RetryPolicy) -> Duration {
    if attempt_number <= 1 {
        return Duration::ZERO;
    }

    let exponent = (attempt_number - 2) as f64;
    let scaled = policy.base_backoff.as_secs_f64() * policy.multiplier.powf(exponent);
    let capped = scaled.min(policy.max_backoff.as_secs_f64());

    let jitter_span = capped * policy.jitter;
    let jitter = if jitter_span > 0.0 {
        rand::thread_rng().gen_range(0.0..=jitter_span)
    } else {
        0.0
    };

    Duration::from_secs_f64(capped + jitter)
}

fn idempotency_key(event: &DomainEvent, endpoint: &WebhookEndpoint, attempt_number: u16) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.event_id.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(endpoint.endpoint_id.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(attempt_number.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

impl DeliveryPlanner for BackoffDeliveryPlanner {
    fn plan(
        &self,
        event: &DomainEvent,
        endpoint: &WebhookEndpoint,
        history: &AttemptHistory,
    ) -> DeliveryPlan {
        let attempt_number = history.max_attempt_number + 1;
        let max_attempts = endpoint.retry_policy.max_attempts;

        if attempt_number > max_attempts as u16 {
            return DeliveryPlan::Exhausted;
        }

        DeliveryPlan::Attempt {
            attempt_number,
            max_attempts,
            delay_before_this_attempt: backoff_delay(attempt_number, &endpoint.retry_policy),
            deadline: chrono::Utc::now()
                + chrono::Duration::from_std(endpoint.timeout).unwrap_or_default(),
            idempotency_key: idempotency_key(event, endpoint, attempt_number),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventcore::types::{EventMetadata, RetryPolicy};

    fn endpoint(retry_policy: RetryPolicy) -> WebhookEndpoint {
        WebhookEndpoint {
            endpoint_id: eventcore::types::EndpointId::new(),
            owner_scope: eventcore::types::SchemaName::new_unchecked("acme"),
            name: "test".to_string(),
            url: "https://example.com/hook".to_string(),
            method: eventcore::types::HttpMethod::Post,
            secret: b"0123456789abcdef".to_vec(),
            signature_header_name: WebhookEndpoint::default_signature_header(),
            custom_headers: Default::default(),
            timeout: WebhookEndpoint::default_timeout(),
            retry_policy,
            event_filters: Vec::new(),
            filter_expression: None,
            health: eventcore::types::EndpointHealth::Healthy,
            consecutive_failures: 0,
            is_active: true,
            created_by: "test".to_string(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            deleted_at: None,
        }
    }

    fn event() -> DomainEvent {
        DomainEvent::new("users.created", "user", "u1", serde_json::json!({}), EventMetadata::default())
    }

    #[test]
    fn first_attempt_has_zero_delay() {
        let planner = BackoffDeliveryPlanner::new();
        let plan = planner.plan(&event(), &endpoint(RetryPolicy::default()), &AttemptHistory::default());
        match plan {
            DeliveryPlan::Attempt { attempt_number, delay_before_this_attempt, .. } => {
                assert_eq!(attempt_number, 1);
                assert_eq!(delay_before_this_attempt, Duration::ZERO);
            }
            DeliveryPlan::Exhausted => panic!("expected an attempt"),
        }
    }

    #[test]
    fn exhausted_once_attempt_number_exceeds_max() {
        let planner = BackoffDeliveryPlanner::new();
        let mut policy = RetryPolicy::default();
        policy.max_attempts = 2;
        let history = AttemptHistory {
            max_attempt_number: 2,
            attempts: Vec::new(),
        };
        let plan = planner.plan(&event(), &endpoint(policy), &history);
        assert!(matches!(plan, DeliveryPlan::Exhausted));
    }

    #[test]
    fn delay_is_bounded_by_max_backoff() {
        let planner = BackoffDeliveryPlanner::new();
        let mut policy = RetryPolicy::default();
        policy.max_backoff = Duration::from_secs(10);
        policy.base_backoff = Duration::from_secs(5);
        policy.multiplier = 5.0;
        let history = AttemptHistory {
            max_attempt_number: 9,
            attempts: Vec::new(),
        };
        let plan = planner.plan(&event(), &endpoint(policy.clone()), &history);
        match plan {
            DeliveryPlan::Attempt { delay_before_this_attempt, .. } => {
                let max_allowed = policy.max_backoff.as_secs_f64() * (1.0 + policy.jitter);
                assert!(delay_before_this_attempt.as_secs_f64() <= max_allowed + 0.001);
            }
            DeliveryPlan::Exhausted => panic!("expected an attempt"),
        }
    }
}
