//! Subscription Matcher (C5, §4.5): maps an event to the ordered list of
//! endpoints that should receive it.
//!
//! Matching is O(P) in the number of patterns with early rejection on
//! category mismatch: subscriptions are indexed by the first dotted segment
//! of their pattern (falling back to a wildcard bucket for patterns that
//! start with `*`/`**`), so an event only scans the subscriptions that
//! could plausibly match its category.

use eventcore::traits::{EndpointRegistry, SubscriptionMatcher};
use eventcore::types::{DomainEvent, Subscription, WebhookEndpoint};
use eventcore::CoreResult;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::filter;

#[derive(Clone)]
struct Entry {
    subscription: Subscription,
    endpoint: WebhookEndpoint,
}

struct CachedIndex {
    built_at: Instant,
    by_category: HashMap<String, Vec<Entry>>,
    wildcard: Vec<Entry>,
}

/// Rebuild interval for the per-schema category index. New endpoints or
/// subscriptions become matchable within this window; existing matches are
/// unaffected by staleness since health/active checks are re-read from the
/// cached endpoint snapshot at match time, not refreshed per call.
const INDEX_TTL: Duration = Duration::from_secs(30);

pub struct CachingSubscriptionMatcher {
    registry: Arc<dyn EndpointRegistry>,
    indexes: RwLock<HashMap<String, Arc<CachedIndex>>>,
}

impl CachingSubscriptionMatcher {
    pub fn new(registry: Arc<dyn EndpointRegistry>) -> Self {
        Self {
            registry,
            indexes: RwLock::new(HashMap::new()),
        }
    }

    async fn index_for(&self, schema: &str) -> CoreResult<Arc<CachedIndex>> {
        if let Some(index) = self.indexes.read().get(schema) {
            if index.built_at.elapsed() < INDEX_TTL {
                return Ok(index.clone());
            }
        }

        let subscriptions = self.registry.subscriptions_for_schema(schema).await?;
        let mut by_category: HashMap<String, Vec<Entry>> = HashMap::new();
        let mut wildcard = Vec::new();

        for subscription in subscriptions {
            if !subscription.is_active {
                continue;
            }
            let endpoint = match self.registry.get(subscription.endpoint_id, schema).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            if !endpoint.is_deliverable() {
                continue;
            }

            let entry = Entry { subscription: subscription.clone(), endpoint };
            let first_segment = subscription.event_pattern.0.split('.').next().unwrap_or("");

            if first_segment == "*" || first_segment == "**" {
                wildcard.push(entry);
            } else {
                by_category.entry(first_segment.to_string()).or_default().push(entry);
            }
        }

        let index = Arc::new(CachedIndex {
            built_at: Instant::now(),
            by_category,
            wildcard,
        });
        self.indexes.write().insert(schema.to_string(), index.clone());
        Ok(index)
    }
}

#[async_trait]
impl SubscriptionMatcher for CachingSubscriptionMatcher {
    async fn matches(&self, event: &DomainEvent, schema: &str) -> CoreResult<Vec<WebhookEndpoint>> {
        let index = self.index_for(schema).await?;
        let category = event.category();

        let candidates = index
            .by_category
            .get(category)
            .into_iter()
            .flatten()
            .chain(index.wildcard.iter());

        // A duplicate endpoint across multiple matching subscriptions is
        // deduplicated to the highest-priority subscription (§4.5).
        let mut best_by_endpoint: HashMap<_, &Entry> = HashMap::new();

        for entry in candidates {
            if !filter::pattern_matches(&entry.subscription.event_pattern, &event.event_type) {
                continue;
            }
            if let Some(expr) = &entry.subscription.filter_expression {
                if !filter::evaluate(expr, event) {
                    continue;
                }
            }

            best_by_endpoint
                .entry(entry.endpoint.endpoint_id)
                .and_modify(|current| {
                    if entry.subscription.priority > current.subscription.priority {
                        *current = entry;
                    }
                })
                .or_insert(entry);
        }

        let mut endpoints: Vec<&Entry> = best_by_endpoint.into_values().collect();
        endpoints.sort_by(|a, b| {
            b.subscription
                .priority
                .cmp(&a.subscription.priority)
                .then_with(|| a.endpoint.endpoint_id.cmp(&b.endpoint.endpoint_id))
        });

        Ok(endpoints.into_iter().map(|e| e.endpoint.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventcore::types::{
        EndpointHealth, EndpointId, EventMetadata, EventPattern, HttpMethod, RetryPolicy,
        SchemaName, SubscriptionId,
    };
    use std::time::Duration;

    struct FakeRegistry {
        endpoints: Vec<WebhookEndpoint>,
        subscriptions: Vec<Subscription>,
    }

    #[async_trait]
    impl EndpointRegistry for FakeRegistry {
        async fn create(&self, endpoint: WebhookEndpoint) -> CoreResult<WebhookEndpoint> {
            Ok(endpoint)
        }

        async fn get(&self, endpoint_id: EndpointId, _schema: &str) -> CoreResult<WebhookEndpoint> {
            self.endpoints
                .iter()
                .find(|e| e.endpoint_id == endpoint_id)
                .cloned()
                .ok_or_else(|| eventcore::CoreError::NotFound("endpoint".to_string()))
        }

        async fn list(
            &self,
            _schema: &str,
            _cursor: Option<String>,
            _limit: usize,
        ) -> CoreResult<(Vec<WebhookEndpoint>, Option<String>)> {
            Ok((self.endpoints.clone(), None))
        }

        async fn update(&self, endpoint: WebhookEndpoint) -> CoreResult<WebhookEndpoint> {
            Ok(endpoint)
        }

        async fn soft_delete(&self, _endpoint_id: EndpointId, _schema: &str) -> CoreResult<()> {
            Ok(())
        }

        async fn record_outcome(
            &self,
            _endpoint_id: EndpointId,
            _schema: &str,
            _success: bool,
        ) -> CoreResult<EndpointHealth> {
            Ok(EndpointHealth::Healthy)
        }

        async fn set_health(
            &self,
            _endpoint_id: EndpointId,
            _schema: &str,
            _health: EndpointHealth,
        ) -> CoreResult<()> {
            Ok(())
        }

        async fn subscriptions_for_schema(&self, _schema: &str) -> CoreResult<Vec<Subscription>> {
            Ok(self.subscriptions.clone())
        }
    }

    fn endpoint(priority_hint: u8) -> WebhookEndpoint {
        let now = chrono::Utc::now();
        WebhookEndpoint {
            endpoint_id: EndpointId::from_uuid(uuid::Uuid::from_u128(priority_hint as u128)),
            owner_scope: SchemaName::new_unchecked("acme"),
            name: format!("ep{priority_hint}"),
            url: "https://example.test/hook".to_string(),
            method: HttpMethod::Post,
            secret: b"0123456789abcdef0123456789abcdef".to_vec(),
            signature_header_name: WebhookEndpoint::default_signature_header(),
            custom_headers: Default::default(),
            timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            event_filters: vec![],
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

    fn subscription(endpoint_id: EndpointId, pattern: &str, priority: i32) -> Subscription {
        Subscription {
            subscription_id: SubscriptionId::new(),
            endpoint_id,
            event_pattern: EventPattern(pattern.to_string()),
            filter_expression: None,
            priority,
            is_active: true,
        }
    }

    fn event(event_type: &str) -> DomainEvent {
        DomainEvent::new(event_type, "order", "o1", serde_json::json!({}), EventMetadata::default())
    }

    #[tokio::test]
    async fn category_mismatch_is_rejected_before_pattern_check() {
        let ep = endpoint(1);
        let registry = FakeRegistry {
            subscriptions: vec![subscription(ep.endpoint_id, "users.*", 0)],
            endpoints: vec![ep],
        };
        let matcher = CachingSubscriptionMatcher::new(Arc::new(registry));
        let matched = matcher.matches(&event("orders.created"), "acme").await.unwrap();
        assert!(matched.is_empty());
    }

    #[tokio::test]
    async fn duplicate_endpoint_is_deduplicated_to_highest_priority() {
        let ep = endpoint(1);
        let registry = FakeRegistry {
            subscriptions: vec![
                subscription(ep.endpoint_id, "users.*", 0),
                subscription(ep.endpoint_id, "users.**", 10),
            ],
            endpoints: vec![ep],
        };
        let matcher = CachingSubscriptionMatcher::new(Arc::new(registry));
        let matched = matcher.matches(&event("users.created"), "acme").await.unwrap();
        assert_eq!(matched.len(), 1);
    }

    #[tokio::test]
    async fn results_are_sorted_by_priority_desc_then_endpoint_id_asc() {
        let low = endpoint(1);
        let high = endpoint(2);
        let registry = FakeRegistry {
            subscriptions: vec![
                subscription(low.endpoint_id, "users.*", 0),
                subscription(high.endpoint_id, "users.*", 5),
            ],
            endpoints: vec![low.clone(), high.clone()],
        };
        let matcher = CachingSubscriptionMatcher::new(Arc::new(registry));
        let matched = matcher.matches(&event("users.created"), "acme").await.unwrap();
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].endpoint_id, high.endpoint_id);
        assert_eq!(matched[1].endpoint_id, low.endpoint_id);
    }

    #[tokio::test]
    async fn disabled_endpoint_is_excluded_even_if_subscribed() {
        let mut ep = endpoint(1);
        ep.health = EndpointHealth::Disabled;
        let registry = FakeRegistry {
            subscriptions: vec![subscription(ep.endpoint_id, "users.*", 0)],
            endpoints: vec![ep],
        };
        let matcher = CachingSubscriptionMatcher::new(Arc::new(registry));
        let matched = matcher.matches(&event("users.created"), "acme").await.unwrap();
        assert!(matched.is_empty());
    }
}
