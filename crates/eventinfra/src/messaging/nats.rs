//! JetStream-backed Stream Log (C2, §4.2).
//!
//! Plain NATS core pub/sub has no durable consumer groups and no
//! redelivery story, so the Stream Log is built on JetStream instead: one
//! stream per *schema*, one durable pull consumer per consumer group.
//! Entries carry only a `StreamEntryPointer` (event id + schema) — the
//! authoritative payload always lives in the Event Store, never in the
//! stream itself (§4.2).
//!
//! Topic naming is two-tiered: the Publisher appends to the
//! category-qualified topic from §6.5 (`events.{schema}.{category}`), while
//! the Dispatcher reads the schema-wide topic (`events.{schema}`) so one
//! consumer group drains every category for a tenant without discovering
//! categories up front (§9 leaves per-category consumer-group partitioning
//! unspecified). Both forms share a schema segment and are backed by the
//! same JetStream stream, declared with a wildcard subject
//! (`events.{schema}.>`), so this is transparent to callers.
//!
//! `ack`/`nack` need the original JetStream message (NATS acks by replying
//! on the message's private inbox subject, not by id), so in-flight
//! messages handed out by `read` are cached here until acked, nacked, or
//! their ack deadline lapses and JetStream redelivers them on its own.

use async_nats::jetstream::{self, consumer::pull::Config as PullConfig, stream::Config as StreamConfig};
use async_nats::jetstream::AckKind;
use async_trait::async_trait;
use dashmap::DashMap;
use eventcore::traits::{StreamEntry, StreamEntryPointer, StreamLog};
use eventcore::CoreError;
use eventcore::CoreResult;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub url: String,
    pub name: Option<String>,
    pub max_reconnects: Option<usize>,
    pub reconnect_delay: Duration,
    pub subject_prefix: String,
    pub ack_wait: Duration,
    pub max_deliver: i64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: String::from("nats://127.0.0.1:4222"),
            name: Some(String::from("eventd")),
            max_reconnects: None,
            reconnect_delay: Duration::from_secs(2),
            subject_prefix: String::from("eventd."),
            ack_wait: Duration::from_secs(30),
            max_deliver: 10,
        }
    }
}

impl NatsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

fn inflight_key(topic: &str, group: &str, entry_id: &str) -> String {
    format!("{topic}:{group}:{entry_id}")
}

/// Topics passed in here are either category-qualified (`events.{schema}.{category}`,
/// used by the Publisher per §6.5) or schema-wide (`events.{schema}`, used by the
/// Dispatcher, which consumes every category for a schema rather than one at a time —
/// see `NatsStreamLog`'s module docs). Both forms share the same schema segment, so
/// both resolve to the same underlying JetStream stream.
fn schema_of_topic(topic: &str) -> &str {
    topic
        .strip_prefix("events.")
        .and_then(|rest| rest.split('.').next())
        .unwrap_or(topic)
}

fn stream_name(topic: &str) -> String {
    format!("EVENTD_{}", schema_of_topic(topic).to_uppercase())
}

pub struct NatsStreamLog {
    jetstream: jetstream::Context,
    config: NatsConfig,
    inflight: DashMap<String, jetstream::Message>,
}

impl NatsStreamLog {
    pub async fn connect(config: NatsConfig) -> CoreResult<Self> {
        info!(url = %config.url, "Connecting to NATS JetStream");

        let mut options = async_nats::ConnectOptions::new().retry_on_initial_connect();
        if let Some(name) = &config.name {
            options = options.name(name);
        }
        if let Some(max) = config.max_reconnects {
            options = options.max_reconnects(max);
        }

        let client = options
            .connect(&config.url)
            .await
            .map_err(|e| CoreError::StreamUnavailable(e.to_string()))?;

        let jetstream = jetstream::new(client);

        Ok(Self {
            jetstream,
            config,
            inflight: DashMap::new(),
        })
    }

    /// Every category topic for a schema (`events.{schema}.{category}`) and the
    /// Dispatcher's schema-wide read topic (`events.{schema}`) resolve to one
    /// JetStream stream per schema, declared with a wildcard subject so a
    /// Dispatcher worker consuming `events.{schema}` sees entries published
    /// under any category without per-category consumer discovery.
    async fn ensure_stream(&self, topic: &str) -> CoreResult<jetstream::stream::Stream> {
        let schema = schema_of_topic(topic);
        let wildcard_subject = format!("{}events.{schema}.>", self.config.subject_prefix);
        self.jetstream
            .get_or_create_stream(StreamConfig {
                name: stream_name(topic),
                subjects: vec![wildcard_subject],
                retention: jetstream::stream::RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await
            .map_err(|e| CoreError::StreamUnavailable(e.to_string()))
    }

    async fn ensure_consumer(
        &self,
        stream: &jetstream::stream::Stream,
        group: &str,
    ) -> CoreResult<jetstream::consumer::Consumer<PullConfig>> {
        stream
            .get_or_create_consumer(
                group,
                PullConfig {
                    durable_name: Some(group.to_string()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: self.config.ack_wait,
                    max_deliver: self.config.max_deliver,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| CoreError::StreamUnavailable(e.to_string()))
    }
}

#[async_trait]
impl StreamLog for NatsStreamLog {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        entry: StreamEntryPointer,
    ) -> CoreResult<String> {
        let subject = format!("{}{}", self.config.subject_prefix, topic);
        self.ensure_stream(topic).await?;

        let payload =
            serde_json::to_vec(&entry).map_err(|e| CoreError::InvalidInput(e.to_string()))?;

        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", entry.event_id.to_string().as_str());
        // Deduplication key: JetStream drops republishes of the same
        // Nats-Msg-Id within its dedup window, which is the partition
        // key's practical job here (§4.2 "publish is idempotent per
        // event_id within the dedup window").
        let _ = partition_key;

        let ack = self
            .jetstream
            .publish_with_headers(subject, headers, payload.into())
            .await
            .map_err(|e| CoreError::StreamUnavailable(e.to_string()))?
            .await
            .map_err(|e| CoreError::StreamUnavailable(e.to_string()))?;

        Ok(ack.sequence.to_string())
    }

    async fn create_consumer_group(&self, topic: &str, group: &str) -> CoreResult<()> {
        let stream = self.ensure_stream(topic).await?;
        self.ensure_consumer(&stream, group).await?;
        Ok(())
    }

    async fn read(
        &self,
        topic: &str,
        group: &str,
        consumer_id: &str,
        max_entries: usize,
        block: Duration,
    ) -> CoreResult<Vec<StreamEntry>> {
        let stream = self.ensure_stream(topic).await?;
        let consumer = self.ensure_consumer(&stream, group).await?;

        let mut batch = consumer
            .fetch()
            .max_messages(max_entries)
            .expires(block)
            .messages()
            .await
            .map_err(|e| CoreError::StreamUnavailable(e.to_string()))?;

        let mut entries = Vec::with_capacity(max_entries);
        while let Some(message) = batch.next().await {
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, consumer_id, "error pulling from JetStream consumer");
                    continue;
                }
            };

            let pointer: StreamEntryPointer = match serde_json::from_slice(&message.payload) {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "dropping stream entry with unparseable pointer");
                    let _ = message.ack_with(AckKind::Term).await;
                    continue;
                }
            };

            let info = message.info().map_err(|e| CoreError::StreamUnavailable(e.to_string()))?;
            let entry_id = info.stream_sequence.to_string();
            let delivery_count = info.delivered as u32;

            self.inflight
                .insert(inflight_key(topic, group, &entry_id), message);

            entries.push(StreamEntry {
                entry_id,
                pointer,
                delivery_count,
            });
        }

        debug!(topic, group, consumer_id, count = entries.len(), "read stream entries");
        Ok(entries)
    }

    async fn ack(&self, topic: &str, group: &str, entry_ids: &[String]) -> CoreResult<()> {
        for entry_id in entry_ids {
            if let Some((_, message)) = self.inflight.remove(&inflight_key(topic, group, entry_id)) {
                message
                    .ack()
                    .await
                    .map_err(|e| CoreError::StreamUnavailable(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn nack(
        &self,
        topic: &str,
        group: &str,
        entry_ids: &[String],
        requeue: bool,
    ) -> CoreResult<()> {
        for entry_id in entry_ids {
            if let Some((_, message)) = self.inflight.remove(&inflight_key(topic, group, entry_id)) {
                let kind = if requeue { AckKind::Nak(None) } else { AckKind::Term };
                message
                    .ack_with(kind)
                    .await
                    .map_err(|e| CoreError::StreamUnavailable(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn pending(&self, topic: &str, group: &str) -> CoreResult<Vec<StreamEntry>> {
        let prefix = format!("{topic}:{group}:");
        let mut entries = Vec::new();

        for item in self.inflight.iter() {
            if !item.key().starts_with(&prefix) {
                continue;
            }
            let message = item.value();
            let pointer: StreamEntryPointer = match serde_json::from_slice(&message.payload) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let info = message.info().map_err(|e| CoreError::StreamUnavailable(e.to_string()))?;
            entries.push(StreamEntry {
                entry_id: info.stream_sequence.to_string(),
                pointer,
                delivery_count: info.delivered as u32,
            });
        }

        Ok(entries)
    }
}
