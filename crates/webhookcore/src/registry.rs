//! Postgres-backed Endpoint Registry (C4, §4.4).
//!
//! CRUD over `WebhookEndpoint`/`Subscription`, validated with
//! `eventcore::validate_endpoint` before every create/update. Soft-delete
//! sets `deleted_at` rather than removing the row: in-flight attempts
//! against a soft-deleted endpoint are allowed to finish.

use async_trait::async_trait;
use chrono::Utc;
use eventcore::traits::EndpointRegistry;
use eventcore::types::{
    EndpointHealth, EndpointId, EventPattern, HttpMethod, RetryPolicy, SchemaName, Subscription,
    SubscriptionId, WebhookEndpoint,
};
use eventcore::{validate_endpoint, CoreError, CoreResult};
use eventtenant::SchemaValidator;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use uuid::Uuid;

pub struct PgEndpointRegistry {
    pool: PgPool,
    validator: SchemaValidator,
    /// Whether `validate_endpoint`'s private/link-local host check is
    /// enforced. Disabled only for local/test deployments that target
    /// loopback fixtures.
    strict_host_check: bool,
}

impl PgEndpointRegistry {
    pub fn new(pool: PgPool, strict_host_check: bool) -> Self {
        Self {
            pool,
            validator: SchemaValidator::new(),
            strict_host_check,
        }
    }

    fn endpoints_table(&self, schema: &str) -> CoreResult<String> {
        let validated = self
            .validator
            .validate(schema)
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        Ok(format!("{validated}.webhook_endpoints"))
    }

    fn subscriptions_table(&self, schema: &str) -> CoreResult<String> {
        let validated = self
            .validator
            .validate(schema)
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        Ok(format!("{validated}.subscriptions"))
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

fn method_str(method: HttpMethod) -> &'static str {
    method.as_str()
}

fn method_from_str(s: &str) -> HttpMethod {
    match s {
        "PUT" => HttpMethod::Put,
        _ => HttpMethod::Post,
    }
}

fn health_str(health: EndpointHealth) -> &'static str {
    match health {
        EndpointHealth::Healthy => "healthy",
        EndpointHealth::Degraded => "degraded",
        EndpointHealth::Disabled => "disabled",
    }
}

fn health_from_str(s: &str) -> EndpointHealth {
    match s {
        "degraded" => EndpointHealth::Degraded,
        "disabled" => EndpointHealth::Disabled,
        _ => EndpointHealth::Healthy,
    }
}

fn row_to_endpoint(row: &sqlx::postgres::PgRow, schema: &str) -> Result<WebhookEndpoint, sqlx::Error> {
    let custom_headers: serde_json::Value = row.try_get("custom_headers")?;
    let custom_headers: HashMap<String, String> = serde_json::from_value(custom_headers).unwrap_or_default();
    let event_filters: serde_json::Value = row.try_get("event_filters")?;
    let event_filters: Vec<String> = serde_json::from_value(event_filters).unwrap_or_default();
    let filter_expression: Option<serde_json::Value> = row.try_get("filter_expression")?;
    let filter_expression = filter_expression.and_then(|v| serde_json::from_value(v).ok());
    let timeout_ms: i64 = row.try_get("timeout_ms")?;
    let retry_policy: serde_json::Value = row.try_get("retry_policy")?;
    let retry_policy: RetryPolicy = serde_json::from_value(retry_policy).unwrap_or_default();
    let secret: Vec<u8> = row.try_get("secret")?;

    Ok(WebhookEndpoint {
        endpoint_id: EndpointId::from_uuid(row.try_get::<Uuid, _>("endpoint_id")?),
        owner_scope: SchemaName::new_unchecked(schema),
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        method: method_from_str(row.try_get::<String, _>("method")?.as_str()),
        secret,
        signature_header_name: row.try_get("signature_header_name")?,
        custom_headers,
        timeout: std::time::Duration::from_millis(timeout_ms.max(0) as u64),
        retry_policy,
        event_filters: event_filters.into_iter().map(EventPattern).collect(),
        filter_expression,
        health: health_from_str(row.try_get::<String, _>("health")?.as_str()),
        consecutive_failures: row.try_get::<i32, _>("consecutive_failures")? as u32,
        is_active: row.try_get("is_active")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn row_to_subscription(row: &sqlx::postgres::PgRow) -> Result<Subscription, sqlx::Error> {
    Ok(Subscription {
        subscription_id: SubscriptionId::from_uuid(row.try_get::<Uuid, _>("subscription_id")?),
        endpoint_id: EndpointId::from_uuid(row.try_get::<Uuid, _>("endpoint_id")?),
        event_pattern: EventPattern(row.try_get("event_pattern")?),
        filter_expression: {
            let value: Option<serde_json::Value> = row.try_get("filter_expression")?;
            value.and_then(|v| serde_json::from_value(v).ok())
        },
        priority: row.try_get("priority")?,
        is_active: row.try_get("is_active")?,
    })
}

#[async_trait]
impl EndpointRegistry for PgEndpointRegistry {
    async fn create(&self, mut endpoint: WebhookEndpoint) -> CoreResult<WebhookEndpoint> {
        validate_endpoint(&endpoint, self.strict_host_check).map_err(|e| e)?;

        let schema = endpoint.owner_scope.as_str().to_string();
        let table = self.endpoints_table(&schema)?;
        let now = Utc::now();
        endpoint.created_at = now;
        endpoint.updated_at = now;

        let custom_headers = serde_json::to_value(&endpoint.custom_headers)
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        let event_filters: Vec<String> = endpoint.event_filters.iter().map(|p| p.0.clone()).collect();
        let event_filters =
            serde_json::to_value(&event_filters).map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        let filter_expression = endpoint
            .filter_expression
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        let retry_policy =
            serde_json::to_value(&endpoint.retry_policy).map_err(|e| CoreError::InvalidInput(e.to_string()))?;

        let query = format!(
            "INSERT INTO {table} (endpoint_id, name, url, method, secret, signature_header_name, \
             custom_headers, timeout_ms, retry_policy, event_filters, filter_expression, health, \
             consecutive_failures, is_active, created_by, created_at, updated_at, deleted_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, NULL)"
        );

        sqlx::query(&query)
            .bind(endpoint.endpoint_id.as_uuid())
            .bind(&endpoint.name)
            .bind(&endpoint.url)
            .bind(method_str(endpoint.method))
            .bind(&endpoint.secret)
            .bind(&endpoint.signature_header_name)
            .bind(&custom_headers)
            .bind(endpoint.timeout.as_millis() as i64)
            .bind(&retry_policy)
            .bind(&event_filters)
            .bind(&filter_expression)
            .bind(health_str(endpoint.health))
            .bind(endpoint.consecutive_failures as i32)
            .bind(endpoint.is_active)
            .bind(&endpoint.created_by)
            .bind(endpoint.created_at)
            .bind(endpoint.updated_at)
            .execute(&self.pool)
            .await
            .map_err(Self::storage_err)?;

        Ok(endpoint)
    }

    async fn get(&self, endpoint_id: EndpointId, schema: &str) -> CoreResult<WebhookEndpoint> {
        let table = self.endpoints_table(schema)?;
        let query = format!("SELECT * FROM {table} WHERE endpoint_id = $1");

        let row = sqlx::query(&query)
            .bind(endpoint_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::storage_err)?
            .ok_or_else(|| CoreError::NotFound(format!("endpoint {endpoint_id} not found")))?;

        row_to_endpoint(&row, schema).map_err(Self::storage_err)
    }

    async fn list(
        &self,
        schema: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> CoreResult<(Vec<WebhookEndpoint>, Option<String>)> {
        let table = self.endpoints_table(schema)?;
        let after = cursor
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|e| CoreError::InvalidInput(format!("invalid cursor: {e}")))?;

        let query = format!(
            "SELECT * FROM {table} WHERE ($1::uuid IS NULL OR endpoint_id > $1) \
             ORDER BY endpoint_id ASC LIMIT $2"
        );

        let rows = sqlx::query(&query)
            .bind(after)
            .bind(limit as i64 + 1)
            .fetch_all(&self.pool)
            .await
            .map_err(Self::storage_err)?;

        let mut endpoints: Vec<WebhookEndpoint> = rows
            .iter()
            .map(|r| row_to_endpoint(r, schema))
            .collect::<Result<_, _>>()
            .map_err(Self::storage_err)?;

        let next_cursor = if endpoints.len() > limit {
            endpoints.truncate(limit);
            endpoints.last().map(|e| e.endpoint_id.to_string())
        } else {
            None
        };

        Ok((endpoints, next_cursor))
    }

    async fn update(&self, mut endpoint: WebhookEndpoint) -> CoreResult<WebhookEndpoint> {
        validate_endpoint(&endpoint, self.strict_host_check)?;

        let schema = endpoint.owner_scope.as_str().to_string();
        let table = self.endpoints_table(&schema)?;
        endpoint.updated_at = Utc::now();

        let custom_headers = serde_json::to_value(&endpoint.custom_headers)
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        let event_filters: Vec<String> = endpoint.event_filters.iter().map(|p| p.0.clone()).collect();
        let event_filters =
            serde_json::to_value(&event_filters).map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        let filter_expression = endpoint
            .filter_expression
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        let retry_policy =
            serde_json::to_value(&endpoint.retry_policy).map_err(|e| CoreError::InvalidInput(e.to_string()))?;

        let query = format!(
            "UPDATE {table} SET name = $2, url = $3, method = $4, secret = $5, \
             signature_header_name = $6, custom_headers = $7, timeout_ms = $8, retry_policy = $9, \
             event_filters = $10, filter_expression = $11, is_active = $12, updated_at = $13 \
             WHERE endpoint_id = $1"
        );

        sqlx::query(&query)
            .bind(endpoint.endpoint_id.as_uuid())
            .bind(&endpoint.name)
            .bind(&endpoint.url)
            .bind(method_str(endpoint.method))
            .bind(&endpoint.secret)
            .bind(&endpoint.signature_header_name)
            .bind(&custom_headers)
            .bind(endpoint.timeout.as_millis() as i64)
            .bind(&retry_policy)
            .bind(&event_filters)
            .bind(&filter_expression)
            .bind(endpoint.is_active)
            .bind(endpoint.updated_at)
            .execute(&self.pool)
            .await
            .map_err(Self::storage_err)?;

        Ok(endpoint)
    }

    async fn soft_delete(&self, endpoint_id: EndpointId, schema: &str) -> CoreResult<()> {
        let table = self.endpoints_table(schema)?;
        let query = format!(
            "UPDATE {table} SET deleted_at = $2, is_active = false WHERE endpoint_id = $1 \
             AND deleted_at IS NULL"
        );
        sqlx::query(&query)
            .bind(endpoint_id.as_uuid())
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(Self::storage_err)?;
        Ok(())
    }

    async fn record_outcome(
        &self,
        endpoint_id: EndpointId,
        schema: &str,
        success: bool,
    ) -> CoreResult<EndpointHealth> {
        let table = self.endpoints_table(schema)?;

        let query = if success {
            format!("UPDATE {table} SET consecutive_failures = 0, health = 'healthy' WHERE endpoint_id = $1 RETURNING health")
        } else {
            format!(
                "UPDATE {table} SET consecutive_failures = consecutive_failures + 1, health = CASE \
                   WHEN consecutive_failures + 1 >= 20 THEN 'disabled' \
                   WHEN consecutive_failures + 1 >= 5 THEN 'degraded' \
                   ELSE health \
                 END WHERE endpoint_id = $1 RETURNING health"
            )
        };

        let row = sqlx::query(&query)
            .bind(endpoint_id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(Self::storage_err)?;

        Ok(health_from_str(row.try_get::<String, _>("health").map_err(Self::storage_err)?.as_str()))
    }

    async fn set_health(&self, endpoint_id: EndpointId, schema: &str, health: EndpointHealth) -> CoreResult<()> {
        let table = self.endpoints_table(schema)?;
        let query = format!("UPDATE {table} SET health = $2 WHERE endpoint_id = $1");
        sqlx::query(&query)
            .bind(endpoint_id.as_uuid())
            .bind(health_str(health))
            .execute(&self.pool)
            .await
            .map_err(Self::storage_err)?;
        Ok(())
    }

    async fn subscriptions_for_schema(&self, schema: &str) -> CoreResult<Vec<Subscription>> {
        let table = self.subscriptions_table(schema)?;
        let query = format!("SELECT * FROM {table} WHERE is_active = true");

        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(Self::storage_err)?;

        rows.iter().map(|r| row_to_subscription(r).map_err(Self::storage_err)).collect()
    }
}
