//! Postgres-backed Attempt Recorder (C8, §4.8).
//!
//! `record` upserts keyed on `(event_id, endpoint_id, attempt_number)` and,
//! in the same transaction, advances the event's and endpoint's aggregate
//! state. That keeps "attempt persisted" and "health/aggregate updated"
//! atomic, so a crash between the two never leaves the endpoint's
//! consecutive-failure counter out of sync with the attempts table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventcore::traits::AttemptHistory;
use eventcore::traits::AttemptRecorder;
use eventcore::types::{
    AttemptId, AttemptRequest, AttemptResponse, AttemptStatus, DeliveryAttempt, EndpointId,
    ErrorRecord, EventId,
};
use eventcore::CoreError;
use eventcore::CoreResult;
use eventtenant::SchemaValidator;
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct PgAttemptRecorder {
    pool: PgPool,
    validator: SchemaValidator,
}

impl PgAttemptRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            validator: SchemaValidator::new(),
        }
    }

    fn attempts_table(&self, schema: &str) -> CoreResult<String> {
        let validated = self
            .validator
            .validate(schema)
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        Ok(format!("{validated}.delivery_attempts"))
    }

    fn events_table(&self, schema: &str) -> CoreResult<String> {
        let validated = self
            .validator
            .validate(schema)
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        Ok(format!("{validated}.events"))
    }

    fn endpoints_table(&self, schema: &str) -> CoreResult<String> {
        let validated = self
            .validator
            .validate(schema)
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        Ok(format!("{validated}.webhook_endpoints"))
    }

    fn storage_err(e: sqlx::Error) -> CoreError {
        CoreError::StorageUnavailable(e.to_string())
    }
}

fn status_str(status: AttemptStatus) -> &'static str {
    match status {
        AttemptStatus::Pending => "pending",
        AttemptStatus::InFlight => "in_flight",
        AttemptStatus::Success => "success",
        AttemptStatus::Failed => "failed",
        AttemptStatus::Timeout => "timeout",
        AttemptStatus::Cancelled => "cancelled",
        AttemptStatus::Retrying => "retrying",
    }
}

fn status_from_str(s: &str) -> AttemptStatus {
    match s {
        "in_flight" => AttemptStatus::InFlight,
        "success" => AttemptStatus::Success,
        "failed" => AttemptStatus::Failed,
        "timeout" => AttemptStatus::Timeout,
        "cancelled" => AttemptStatus::Cancelled,
        "retrying" => AttemptStatus::Retrying,
        _ => AttemptStatus::Pending,
    }
}

fn row_to_attempt(row: &sqlx::postgres::PgRow) -> Result<DeliveryAttempt, sqlx::Error> {
    let request: serde_json::Value = row.try_get("request")?;
    let request: AttemptRequest = serde_json::from_value(request).unwrap_or_else(|_| AttemptRequest {
        url: String::new(),
        method: eventcore::types::HttpMethod::Post,
        headers: Default::default(),
        body_bytes: Vec::new(),
        signature: String::new(),
    });
    let response: Option<serde_json::Value> = row.try_get("response")?;
    let response = response.and_then(|v| serde_json::from_value::<AttemptResponse>(v).ok());
    let error: Option<serde_json::Value> = row.try_get("error")?;
    let error = error.and_then(|v| serde_json::from_value::<ErrorRecord>(v).ok());

    Ok(DeliveryAttempt {
        attempt_id: AttemptId::from_uuid(row.try_get::<Uuid, _>("attempt_id")?),
        endpoint_id: EndpointId::from_uuid(row.try_get::<Uuid, _>("endpoint_id")?),
        event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
        attempt_number: row.try_get::<i32, _>("attempt_number")? as u16,
        status: status_from_str(row.try_get::<String, _>("status")?.as_str()),
        request,
        response,
        error,
        scheduled_at: row.try_get("scheduled_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        next_retry_at: row.try_get("next_retry_at")?,
        max_attempts_reached: row.try_get("max_attempts_reached")?,
    })
}

#[async_trait]
impl AttemptRecorder for PgAttemptRecorder {
    async fn record(&self, attempt: DeliveryAttempt, schema: &str) -> CoreResult<()> {
        let attempts_table = self.attempts_table(schema)?;
        let events_table = self.events_table(schema)?;
        let endpoints_table = self.endpoints_table(schema)?;

        let request =
            serde_json::to_value(&attempt.request).map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        let response = attempt
            .response
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        let error = attempt
            .error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(Self::storage_err)?;

        let upsert = format!(
            "INSERT INTO {attempts_table} (attempt_id, endpoint_id, event_id, attempt_number, \
             status, request, response, error, scheduled_at, started_at, completed_at, \
             next_retry_at, max_attempts_reached) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (event_id, endpoint_id, attempt_number) DO UPDATE SET \
             status = EXCLUDED.status, response = EXCLUDED.response, error = EXCLUDED.error, \
             started_at = EXCLUDED.started_at, completed_at = EXCLUDED.completed_at, \
             next_retry_at = EXCLUDED.next_retry_at, \
             max_attempts_reached = EXCLUDED.max_attempts_reached"
        );

        sqlx::query(&upsert)
            .bind(attempt.attempt_id.as_uuid())
            .bind(attempt.endpoint_id.as_uuid())
            .bind(attempt.event_id.as_uuid())
            .bind(attempt.attempt_number as i32)
            .bind(status_str(attempt.status))
            .bind(&request)
            .bind(&response)
            .bind(&error)
            .bind(attempt.scheduled_at)
            .bind(attempt.started_at)
            .bind(attempt.completed_at)
            .bind(attempt.next_retry_at)
            .bind(attempt.max_attempts_reached)
            .execute(&mut *tx)
            .await
            .map_err(Self::storage_err)?;

        if attempt.status.is_terminal() || attempt.status == AttemptStatus::Retrying {
            let increment = format!(
                "UPDATE {events_table} SET attempts_count = attempts_count + 1 WHERE event_id = $1"
            );
            sqlx::query(&increment)
                .bind(attempt.event_id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(Self::storage_err)?;
        }

        match attempt.status {
            AttemptStatus::Success => {
                let update_endpoint = format!(
                    "UPDATE {endpoints_table} SET consecutive_failures = 0, health = 'healthy' \
                     WHERE endpoint_id = $1"
                );
                sqlx::query(&update_endpoint)
                    .bind(attempt.endpoint_id.as_uuid())
                    .execute(&mut *tx)
                    .await
                    .map_err(Self::storage_err)?;
            }
            AttemptStatus::Failed | AttemptStatus::Timeout => {
                let update_endpoint = format!(
                    "UPDATE {endpoints_table} SET consecutive_failures = consecutive_failures + 1, \
                     health = CASE \
                       WHEN consecutive_failures + 1 >= 20 THEN 'disabled' \
                       WHEN consecutive_failures + 1 >= 5 THEN 'degraded' \
                       ELSE health \
                     END \
                     WHERE endpoint_id = $1"
                );
                sqlx::query(&update_endpoint)
                    .bind(attempt.endpoint_id.as_uuid())
                    .execute(&mut *tx)
                    .await
                    .map_err(Self::storage_err)?;
            }
            _ => {}
        }

        tx.commit().await.map_err(Self::storage_err)?;
        Ok(())
    }

    async fn history_for(
        &self,
        event_id: EventId,
        endpoint_id: EndpointId,
        schema: &str,
    ) -> CoreResult<AttemptHistory> {
        let table = self.attempts_table(schema)?;
        let query = format!(
            "SELECT * FROM {table} WHERE event_id = $1 AND endpoint_id = $2 ORDER BY attempt_number ASC"
        );
        let rows = sqlx::query(&query)
            .bind(event_id.as_uuid())
            .bind(endpoint_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(Self::storage_err)?;

        let attempts: Vec<DeliveryAttempt> = rows
            .iter()
            .map(|r| row_to_attempt(r).map_err(Self::storage_err))
            .collect::<CoreResult<_>>()?;

        let max_attempt_number = attempts.iter().map(|a| a.attempt_number).max().unwrap_or(0);
        Ok(AttemptHistory {
            max_attempt_number,
            attempts,
        })
    }

    async fn attempts_for_endpoint(
        &self,
        endpoint_id: EndpointId,
        schema: &str,
        status: Option<AttemptStatus>,
        since: Option<DateTime<Utc>>,
    ) -> CoreResult<Vec<DeliveryAttempt>> {
        let table = self.attempts_table(schema)?;
        let query = format!(
            "SELECT * FROM {table} WHERE endpoint_id = $1 \
             AND ($2::text IS NULL OR status = $2) \
             AND ($3::timestamptz IS NULL OR scheduled_at >= $3) \
             ORDER BY scheduled_at DESC LIMIT 500"
        );

        let rows = sqlx::query(&query)
            .bind(endpoint_id.as_uuid())
            .bind(status.map(status_str))
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(Self::storage_err)?;

        rows.iter().map(|r| row_to_attempt(r).map_err(Self::storage_err)).collect()
    }

    async fn attempts_for_event(&self, event_id: EventId, schema: &str) -> CoreResult<Vec<DeliveryAttempt>> {
        let table = self.attempts_table(schema)?;
        let query = format!("SELECT * FROM {table} WHERE event_id = $1 ORDER BY scheduled_at ASC");

        let rows = sqlx::query(&query)
            .bind(event_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(Self::storage_err)?;

        rows.iter().map(|r| row_to_attempt(r).map_err(Self::storage_err)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_status_round_trips_through_its_string_form() {
        for status in [
            AttemptStatus::Pending,
            AttemptStatus::InFlight,
            AttemptStatus::Success,
            AttemptStatus::Failed,
            AttemptStatus::Timeout,
            AttemptStatus::Cancelled,
            AttemptStatus::Retrying,
        ] {
            assert_eq!(status_from_str(status_str(status)), status);
        }
    }
}
