//! Redis-backed Retry Scheduler (C9, §4.9).
//!
//! One sorted set per tenant schema, keyed `eventd:retry:{schema}`, scored
//! by due-time (unix milliseconds). `schedule` uses `ZADD NX` so a repeated
//! schedule call for the same `(event_id, endpoint_id, attempt_number)`
//! member leaves the original due time in place instead of bumping it.
//! `due` pops entries whose score has passed with a `ZRANGEBYSCORE` +
//! `ZREM` Lua script, so two sweepers racing on the same schema never
//! return the same retry twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventcore::traits::{DueRetry, RetryScheduler};
use eventcore::types::{EndpointId, EventId};
use eventcore::CoreError;
use eventcore::CoreResult;

#[derive(Debug, Clone)]
pub struct RedisSchedulerConfig {
    pub url: String,
    pub key_prefix: String,
}

impl Default for RedisSchedulerConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "eventd:retry:".to_string(),
        }
    }
}

pub struct RedisRetryScheduler {
    client: redis::Client,
    key_prefix: String,
}

impl RedisRetryScheduler {
    pub fn new(config: &RedisSchedulerConfig) -> CoreResult<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn key(&self, schema: &str) -> String {
        format!("{}{}", self.key_prefix, schema)
    }

    async fn connection(&self) -> CoreResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))
    }
}

fn member_of(event_id: EventId, endpoint_id: EndpointId, attempt_number: u16) -> String {
    format!("{event_id}|{endpoint_id}|{attempt_number}")
}

fn parse_member(member: &str) -> Option<DueRetry> {
    let mut parts = member.split('|');
    let event_id = parts.next()?.parse().ok()?;
    let endpoint_id = parts.next()?.parse().ok()?;
    let attempt_number = parts.next()?.parse().ok()?;
    Some(DueRetry {
        event_id,
        endpoint_id,
        attempt_number,
    })
}

#[async_trait]
impl RetryScheduler for RedisRetryScheduler {
    async fn schedule(
        &self,
        schema: &str,
        event_id: EventId,
        endpoint_id: EndpointId,
        attempt_number: u16,
        next_retry_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        let mut conn = self.connection().await?;
        let key = self.key(schema);
        let member = member_of(event_id, endpoint_id, attempt_number);
        let score = next_retry_at.timestamp_millis();

        let _: () = redis::cmd("ZADD")
            .arg(&key)
            .arg("NX")
            .arg(score)
            .arg(&member)
            .query_async(&mut conn)
            .await
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;

        Ok(())
    }

    async fn due(&self, schema: &str, now: DateTime<Utc>, limit: usize) -> CoreResult<Vec<DueRetry>> {
        let mut conn = self.connection().await?;
        let key = self.key(schema);
        let max_score = now.timestamp_millis();

        // Pop-and-remove atomically via a Lua script: two sweepers racing on
        // the same schema must never both receive the same due member.
        let members: Vec<String> = POP_DUE_SCRIPT
            .key(&key)
            .arg(max_score)
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;

        Ok(members.iter().filter_map(|m| parse_member(m)).collect())
    }
}

static POP_DUE_SCRIPT_SRC: &str = r#"
local members = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
if #members > 0 then
    redis.call('ZREM', KEYS[1], unpack(members))
end
return members
"#;

static POP_DUE_SCRIPT: once_cell::sync::Lazy<redis::Script> =
    once_cell::sync::Lazy::new(|| redis::Script::new(POP_DUE_SCRIPT_SRC));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_encoding_round_trips() {
        let event_id = EventId::new();
        let endpoint_id = EndpointId::new();
        let member = member_of(event_id, endpoint_id, 3);
        let parsed = parse_member(&member).expect("member parses");
        assert_eq!(parsed.event_id, event_id);
        assert_eq!(parsed.endpoint_id, endpoint_id);
        assert_eq!(parsed.attempt_number, 3);
    }
}
