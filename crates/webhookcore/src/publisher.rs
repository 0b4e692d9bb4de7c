//! Publisher (C3, §4.3): the producer-facing entry point. Writes an event to
//! the Event Store and appends a pointer to the Stream Log.
//!
//! Step 2 (the store write) is durable; step 3 (the stream append) is
//! best-effort — if it fails, the event is left `pending` and picked up
//! later by the Dispatcher's reconciliation sweep (`scan_stale_pending`),
//! which re-publishes it. The stream never carries the authoritative
//! payload, only a pointer, so a missed publish never risks divergence
//! between the two (§4.3).

use std::sync::Arc;

use eventcore::error::CoreError;
use eventcore::traits::{EventStore, StreamEntryPointer, StreamLog};
use eventcore::types::{DomainEvent, EventId};
use eventcore::{topic_for, validate_event, CoreResult};
use tracing::warn;

pub struct EventPublisher {
    event_store: Arc<dyn EventStore>,
    stream_log: Arc<dyn StreamLog>,
}

impl EventPublisher {
    pub fn new(event_store: Arc<dyn EventStore>, stream_log: Arc<dyn StreamLog>) -> Self {
        Self { event_store, stream_log }
    }

    /// §6.1 `publish(event, schema) -> event_id`. Idempotent on `event_id`:
    /// a `Conflict` from the store (the event was already appended by an
    /// earlier, since-retried call) is treated as success rather than
    /// surfaced to the caller.
    pub async fn publish(&self, event: DomainEvent, schema: &str) -> CoreResult<EventId> {
        validate_event(&event, schema)?;
        let event_id = event.event_id;
        let topic = topic_for(&event, schema);
        let partition_key = event.partition_key.clone();

        match self.event_store.append(event, schema).await {
            Ok(id) => id,
            Err(CoreError::Conflict(_)) => event_id,
            Err(e) => return Err(e),
        };

        let pointer = StreamEntryPointer { event_id, schema: schema.to_string() };
        if let Err(e) = self.stream_log.publish(&topic, &partition_key, pointer).await {
            warn!(
                event_id = %event_id,
                schema,
                error = %e,
                "stream append failed after a durable store write; event remains pending \
                 and will be picked up by the reconciliation sweep"
            );
        }

        Ok(event_id)
    }

    /// §6.1 `publish_batch(events, schema) -> [event_id]`. Best-effort: one
    /// event's failure never aborts the rest of the batch.
    pub async fn publish_batch(
        &self,
        events: Vec<DomainEvent>,
        schema: &str,
    ) -> Vec<PublishOutcome> {
        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            let event_id = event.event_id;
            let outcome = match self.publish(event, schema).await {
                Ok(id) => PublishOutcome::Published(id),
                Err(e) => PublishOutcome::Failed(event_id, e),
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}

/// Per-item result of `publish_batch`, keeping the client's originally
/// supplied `event_id` even on failure so callers can correlate without
/// re-parsing the error message.
#[derive(Debug)]
pub enum PublishOutcome {
    Published(EventId),
    Failed(EventId, CoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use eventcore::traits::{LeasedEvent, StreamEntry};
    use eventcore::types::{EventMetadata, ProcessingState};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeEventStore {
        events: Mutex<HashMap<EventId, DomainEvent>>,
    }

    #[async_trait]
    impl EventStore for FakeEventStore {
        async fn append(&self, event: DomainEvent, _schema: &str) -> CoreResult<EventId> {
            let mut events = self.events.lock();
            if events.contains_key(&event.event_id) {
                return Err(CoreError::Conflict("event_id exists".into()));
            }
            let id = event.event_id;
            events.insert(id, event);
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

        async fn mark_processed(&self, _event_id: EventId, _schema: &str) -> CoreResult<()> {
            Ok(())
        }

        async fn mark_dead(
            &self,
            _event_id: EventId,
            _schema: &str,
            _error: eventcore::types::ErrorRecord,
        ) -> CoreResult<()> {
            Ok(())
        }

        async fn increment_attempts(&self, _event_id: EventId, _schema: &str) -> CoreResult<()> {
            Ok(())
        }

        async fn count_by_state(&self, _schema: &str, _state: ProcessingState) -> CoreResult<u64> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct FakeStreamLog {
        published: Mutex<Vec<(String, String, StreamEntryPointer)>>,
        fail_publish: bool,
    }

    #[async_trait]
    impl StreamLog for FakeStreamLog {
        async fn publish(
            &self,
            topic: &str,
            partition_key: &str,
            entry: StreamEntryPointer,
        ) -> CoreResult<String> {
            if self.fail_publish {
                return Err(CoreError::StreamUnavailable("nats down".into()));
            }
            self.published.lock().push((topic.to_string(), partition_key.to_string(), entry));
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

        async fn nack(
            &self,
            _topic: &str,
            _group: &str,
            _entry_ids: &[String],
            _requeue: bool,
        ) -> CoreResult<()> {
            Ok(())
        }

        async fn pending(&self, _topic: &str, _group: &str) -> CoreResult<Vec<StreamEntry>> {
            Ok(Vec::new())
        }
    }

    fn event() -> DomainEvent {
        DomainEvent::new("users.created", "user", "u1", serde_json::json!({}), EventMetadata::default())
    }

    #[tokio::test]
    async fn publish_persists_then_appends_to_the_stream() {
        let store = Arc::new(FakeEventStore::default());
        let stream = Arc::new(FakeStreamLog::default());
        let publisher = EventPublisher::new(store.clone(), stream.clone());

        let event = event();
        let event_id = event.event_id;
        let result = publisher.publish(event, "acme").await.unwrap();

        assert_eq!(result, event_id);
        assert!(store.events.lock().contains_key(&event_id));
        assert_eq!(stream.published.lock().len(), 1);
        assert_eq!(stream.published.lock()[0].0, "events.acme.users");
    }

    #[tokio::test]
    async fn publish_is_idempotent_on_conflict() {
        let store = Arc::new(FakeEventStore::default());
        let stream = Arc::new(FakeStreamLog::default());
        let publisher = EventPublisher::new(store.clone(), stream.clone());

        let event = event();
        store.events.lock().insert(event.event_id, event.clone());

        let result = publisher.publish(event.clone(), "acme").await;
        assert_eq!(result.unwrap(), event.event_id);
    }

    #[tokio::test]
    async fn publish_survives_a_stream_append_failure() {
        let store = Arc::new(FakeEventStore::default());
        let stream = Arc::new(FakeStreamLog { fail_publish: true, ..Default::default() });
        let publisher = EventPublisher::new(store.clone(), stream);

        let event = event();
        let event_id = event.event_id;
        let result = publisher.publish(event, "acme").await.unwrap();

        assert_eq!(result, event_id);
        assert!(store.events.lock().contains_key(&event_id));
    }

    #[tokio::test]
    async fn publish_rejects_malformed_event_type_before_touching_storage() {
        let store = Arc::new(FakeEventStore::default());
        let stream = Arc::new(FakeStreamLog::default());
        let publisher = EventPublisher::new(store.clone(), stream);

        let mut event = event();
        event.event_type = "NotValid".to_string();
        let result = publisher.publish(event, "acme").await;

        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
        assert!(store.events.lock().is_empty());
    }

    #[tokio::test]
    async fn publish_batch_is_best_effort() {
        let store = Arc::new(FakeEventStore::default());
        let stream = Arc::new(FakeStreamLog::default());
        let publisher = EventPublisher::new(store.clone(), stream);

        let mut bad = event();
        bad.event_type = "Invalid".to_string();
        let events = vec![event(), bad, event()];

        let outcomes = publisher.publish_batch(events, "acme").await;
        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[0], PublishOutcome::Published(_)));
        assert!(matches!(outcomes[1], PublishOutcome::Failed(_, _)));
        assert!(matches!(outcomes[2], PublishOutcome::Published(_)));
    }
}
