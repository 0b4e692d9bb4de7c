//! Postgres-backed Event Store (C1, §4.1).
//!
//! One physical database, one Postgres *schema* per tenant. `claim_pending`
//! uses `SELECT ... FOR UPDATE SKIP LOCKED` inside a transaction that also
//! writes the lease columns, so parallel Dispatcher workers never race for
//! the same event. Schema names reach SQL as raw identifiers (Postgres has
//! no parameter-binding story for identifiers) so every method validates
//! the schema through `eventtenant::SchemaValidator` before building a
//! query string.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventcore::traits::{EventStore, LeasedEvent};
use eventcore::types::{
    DomainEvent, ErrorRecord, EventId, EventMetadata, Priority, ProcessingState,
};
use eventcore::CoreError;
use eventcore::CoreResult;
use eventtenant::SchemaValidator;
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

pub struct PgEventStore {
    pool: PgPool,
    validator: SchemaValidator,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            validator: SchemaValidator::new(),
        }
    }

    /// Schema-qualified, validated table name. Never built from anything
    /// other than the already-validated `schema` argument.
    fn events_table(&self, schema: &str) -> CoreResult<String> {
        let validated = self
            .validator
            .validate(schema)
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        Ok(format!("{validated}.events"))
    }

    fn storage_err(e: sqlx::Error) -> CoreError {
        if let sqlx::Error::Database(db_err) = &e {
            if db_err.is_unique_violation() {
                return CoreError::Conflict(db_err.message().to_string());
            }
        }
        CoreError::StorageUnavailable(e.to_string())
    }
}

fn priority_str(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "low",
        Priority::Normal => "normal",
        Priority::High => "high",
        Priority::Critical => "critical",
    }
}

fn priority_from_str(s: &str) -> Priority {
    match s {
        "low" => Priority::Low,
        "high" => Priority::High,
        "critical" => Priority::Critical,
        _ => Priority::Normal,
    }
}

fn state_str(state: ProcessingState) -> &'static str {
    match state {
        ProcessingState::Pending => "pending",
        ProcessingState::Dispatched => "dispatched",
        ProcessingState::Processed => "processed",
        ProcessingState::Failed => "failed",
        ProcessingState::Dead => "dead",
    }
}

fn state_from_str(s: &str) -> ProcessingState {
    match s {
        "dispatched" => ProcessingState::Dispatched,
        "processed" => ProcessingState::Processed,
        "failed" => ProcessingState::Failed,
        "dead" => ProcessingState::Dead,
        _ => ProcessingState::Pending,
    }
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<DomainEvent, sqlx::Error> {
    let metadata: serde_json::Value = row.try_get("metadata")?;
    let metadata: EventMetadata = serde_json::from_value(metadata).unwrap_or_default();
    let last_error: Option<serde_json::Value> = row.try_get("last_error")?;
    let last_error = last_error.and_then(|v| serde_json::from_value::<ErrorRecord>(v).ok());

    Ok(DomainEvent {
        event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
        event_type: row.try_get("event_type")?,
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        payload: row.try_get("payload")?,
        metadata,
        occurred_at: row.try_get("occurred_at")?,
        recorded_at: row.try_get("recorded_at")?,
        priority: priority_from_str(row.try_get::<String, _>("priority")?.as_str()),
        partition_key: row.try_get("partition_key")?,
        processing_state: state_from_str(row.try_get::<String, _>("processing_state")?.as_str()),
        attempts_count: row.try_get::<i32, _>("attempts_count")? as u32,
        last_error,
    })
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append(&self, event: DomainEvent, schema: &str) -> CoreResult<EventId> {
        let table = self.events_table(schema)?;
        let metadata = serde_json::to_value(&event.metadata)
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;

        let query = format!(
            "INSERT INTO {table} (event_id, event_type, aggregate_type, aggregate_id, payload, \
             metadata, occurred_at, recorded_at, priority, partition_key, processing_state, \
             attempts_count, last_error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NULL)"
        );

        sqlx::query(&query)
            .bind(event.event_id.as_uuid())
            .bind(&event.event_type)
            .bind(&event.aggregate_type)
            .bind(&event.aggregate_id)
            .bind(&event.payload)
            .bind(&metadata)
            .bind(event.occurred_at)
            .bind(event.recorded_at)
            .bind(priority_str(event.priority))
            .bind(&event.partition_key)
            .bind(state_str(event.processing_state))
            .bind(event.attempts_count as i32)
            .execute(&self.pool)
            .await
            .map_err(Self::storage_err)?;

        Ok(event.event_id)
    }

    async fn load(&self, event_id: EventId, schema: &str) -> CoreResult<DomainEvent> {
        let table = self.events_table(schema)?;
        let query = format!("SELECT * FROM {table} WHERE event_id = $1");

        let row = sqlx::query(&query)
            .bind(event_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::storage_err)?
            .ok_or_else(|| CoreError::NotFound(format!("event {event_id} not found")))?;

        row_to_event(&row).map_err(Self::storage_err)
    }

    async fn claim_pending(
        &self,
        schema: &str,
        limit: usize,
        worker_id: &str,
        lease_duration: Duration,
    ) -> CoreResult<Vec<LeasedEvent>> {
        let table = self.events_table(schema)?;
        let mut tx = self.pool.begin().await.map_err(Self::storage_err)?;

        let select = format!(
            "SELECT event_id FROM {table} WHERE processing_state = 'pending' \
             ORDER BY occurred_at ASC LIMIT $1 FOR UPDATE SKIP LOCKED"
        );
        let ids: Vec<Uuid> = sqlx::query(&select)
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(Self::storage_err)?
            .iter()
            .map(|r| r.get::<Uuid, _>("event_id"))
            .collect();

        if ids.is_empty() {
            tx.commit().await.map_err(Self::storage_err)?;
            return Ok(Vec::new());
        }

        let lease_deadline = Utc::now() + chrono::Duration::from_std(lease_duration).unwrap_or_default();
        let update = format!(
            "UPDATE {table} SET processing_state = 'dispatched', worker_id = $1, \
             lease_deadline = $2 WHERE event_id = ANY($3) RETURNING *"
        );
        let rows = sqlx::query(&update)
            .bind(worker_id)
            .bind(lease_deadline)
            .bind(&ids)
            .fetch_all(&mut *tx)
            .await
            .map_err(Self::storage_err)?;

        tx.commit().await.map_err(Self::storage_err)?;

        rows.iter()
            .map(|row| {
                Ok(LeasedEvent {
                    event: row_to_event(row).map_err(Self::storage_err)?,
                    worker_id: worker_id.to_string(),
                    lease_deadline,
                })
            })
            .collect()
    }

    async fn reclaim_expired(
        &self,
        schema: &str,
        limit: usize,
        worker_id: &str,
        lease_duration: Duration,
    ) -> CoreResult<Vec<LeasedEvent>> {
        let table = self.events_table(schema)?;
        let mut tx = self.pool.begin().await.map_err(Self::storage_err)?;

        let select = format!(
            "SELECT event_id FROM {table} WHERE processing_state = 'dispatched' \
             AND lease_deadline < now() ORDER BY lease_deadline ASC LIMIT $1 FOR UPDATE SKIP LOCKED"
        );
        let ids: Vec<Uuid> = sqlx::query(&select)
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(Self::storage_err)?
            .iter()
            .map(|r| r.get::<Uuid, _>("event_id"))
            .collect();

        if ids.is_empty() {
            tx.commit().await.map_err(Self::storage_err)?;
            return Ok(Vec::new());
        }

        let lease_deadline = Utc::now() + chrono::Duration::from_std(lease_duration).unwrap_or_default();
        let update = format!(
            "UPDATE {table} SET worker_id = $1, lease_deadline = $2 WHERE event_id = ANY($3) RETURNING *"
        );
        let rows = sqlx::query(&update)
            .bind(worker_id)
            .bind(lease_deadline)
            .bind(&ids)
            .fetch_all(&mut *tx)
            .await
            .map_err(Self::storage_err)?;

        tx.commit().await.map_err(Self::storage_err)?;

        rows.iter()
            .map(|row| {
                Ok(LeasedEvent {
                    event: row_to_event(row).map_err(Self::storage_err)?,
                    worker_id: worker_id.to_string(),
                    lease_deadline,
                })
            })
            .collect()
    }

    async fn scan_stale_pending(
        &self,
        schema: &str,
        older_than: Duration,
        limit: usize,
    ) -> CoreResult<Vec<DomainEvent>> {
        let table = self.events_table(schema)?;
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let query = format!(
            "SELECT * FROM {table} WHERE processing_state = 'pending' AND recorded_at < $1 \
             ORDER BY recorded_at ASC LIMIT $2"
        );

        let rows = sqlx::query(&query)
            .bind(cutoff)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Self::storage_err)?;

        rows.iter().map(|r| row_to_event(r).map_err(Self::storage_err)).collect()
    }

    async fn mark_processed(&self, event_id: EventId, schema: &str) -> CoreResult<()> {
        let table = self.events_table(schema)?;
        let query = format!(
            "UPDATE {table} SET processing_state = 'processed' \
             WHERE event_id = $1 AND processing_state NOT IN ('processed', 'dead')"
        );
        sqlx::query(&query)
            .bind(event_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(Self::storage_err)?;
        Ok(())
    }

    async fn mark_dead(&self, event_id: EventId, schema: &str, error: ErrorRecord) -> CoreResult<()> {
        let table = self.events_table(schema)?;
        let error_value = serde_json::to_value(&error).map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        let query = format!(
            "UPDATE {table} SET processing_state = 'dead', last_error = $2 \
             WHERE event_id = $1 AND processing_state NOT IN ('processed', 'dead')"
        );
        sqlx::query(&query)
            .bind(event_id.as_uuid())
            .bind(error_value)
            .execute(&self.pool)
            .await
            .map_err(Self::storage_err)?;
        Ok(())
    }

    async fn increment_attempts(&self, event_id: EventId, schema: &str) -> CoreResult<()> {
        let table = self.events_table(schema)?;
        let query = format!("UPDATE {table} SET attempts_count = attempts_count + 1 WHERE event_id = $1");
        sqlx::query(&query)
            .bind(event_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(Self::storage_err)?;
        Ok(())
    }

    async fn count_by_state(&self, schema: &str, state: ProcessingState) -> CoreResult<u64> {
        let table = self.events_table(schema)?;
        let query = format!("SELECT count(*) AS n FROM {table} WHERE processing_state = $1");
        let row = sqlx::query(&query)
            .bind(state_str(state))
            .fetch_one(&self.pool)
            .await
            .map_err(Self::storage_err)?;
        let n: i64 = row.try_get("n").map_err(Self::storage_err)?;
        Ok(n as u64)
    }
}
