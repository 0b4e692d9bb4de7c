//! Route handlers for the endpoint management (§6.2) and observability
//! (§6.3) surfaces. Each handler does request parsing and response shaping
//! only; every decision of substance happens behind the `eventcore` traits
//! reached through `AppState`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use eventcore::types::{AttemptStatus, EndpointId, EventId, EventMetadata};
use eventcore::validation::validate_endpoint;

use crate::error::ApiError;
use crate::rest::dto::{
    AttemptsQuery, CreateEndpointRequest, EndpointListResponse, EndpointResponse,
    EventDetailResponse, ListEndpointsQuery, TestDeliveryRequest, TestDeliveryResponse,
    UpdateEndpointRequest,
};
use crate::state::AppState;

/// `POST /v1/webhook-endpoints`
pub async fn create_endpoint(
    State(state): State<AppState>,
    Json(body): Json<CreateEndpointRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let endpoint = body.into_endpoint();
    validate_endpoint(&endpoint, state.strict_host_check).map_err(ApiError::from)?;
    let created = state.registry.create(endpoint).await?;
    Ok((StatusCode::CREATED, Json(EndpointResponse::from(created))))
}

/// `GET /v1/webhook-endpoints?schema=...&cursor=...&limit=...`
pub async fn list_endpoints(
    State(state): State<AppState>,
    Query(query): Query<ListEndpointsQuery>,
) -> Result<Json<EndpointListResponse>, ApiError> {
    let (endpoints, next_cursor) = state
        .registry
        .list(&query.schema, query.cursor, query.limit)
        .await?;
    Ok(Json(EndpointListResponse {
        endpoints: endpoints.into_iter().map(EndpointResponse::from).collect(),
        next_cursor,
    }))
}

#[derive(Debug, serde::Deserialize)]
pub struct SchemaQuery {
    pub schema: String,
}

/// `GET /v1/webhook-endpoints/{id}?schema=...`
pub async fn get_endpoint(
    State(state): State<AppState>,
    Path(endpoint_id): Path<EndpointId>,
    Query(query): Query<SchemaQuery>,
) -> Result<Json<EndpointResponse>, ApiError> {
    let endpoint = state.registry.get(endpoint_id, &query.schema).await?;
    Ok(Json(EndpointResponse::from(endpoint)))
}

/// `PATCH /v1/webhook-endpoints/{id}?schema=...`
///
/// `health` is applied separately from the rest of the patch (§4.4's
/// explicit operator action): it goes through `EndpointRegistry::set_health`
/// rather than the generic column update, since it bypasses the automatic
/// failure-count-driven transition that `record_outcome` owns.
pub async fn update_endpoint(
    State(state): State<AppState>,
    Path(endpoint_id): Path<EndpointId>,
    Query(query): Query<SchemaQuery>,
    Json(body): Json<UpdateEndpointRequest>,
) -> Result<Json<EndpointResponse>, ApiError> {
    let existing = state.registry.get(endpoint_id, &query.schema).await?;
    let health_override = body.health;
    let mut updated = body.apply(existing);
    updated.updated_at = Utc::now();
    validate_endpoint(&updated, state.strict_host_check).map_err(ApiError::from)?;
    let mut saved = state.registry.update(updated).await?;
    if let Some(health) = health_override {
        state.registry.set_health(endpoint_id, &query.schema, health).await?;
        saved.health = health;
    }
    Ok(Json(EndpointResponse::from(saved)))
}

/// `DELETE /v1/webhook-endpoints/{id}?schema=...`
pub async fn delete_endpoint(
    State(state): State<AppState>,
    Path(endpoint_id): Path<EndpointId>,
    Query(query): Query<SchemaQuery>,
) -> Result<StatusCode, ApiError> {
    state.registry.soft_delete(endpoint_id, &query.schema).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /v1/webhook-endpoints/{id}/test`
///
/// Fires a synthetic event straight through the planner/adapter pair,
/// bypassing the Stream Log and Dispatcher entirely. The result is handed
/// back to the caller directly and is not recorded through the Attempt
/// Recorder — this is a dry run, not a billed delivery.
pub async fn test_endpoint(
    State(state): State<AppState>,
    Path(endpoint_id): Path<EndpointId>,
    Json(body): Json<TestDeliveryRequest>,
) -> Result<Json<TestDeliveryResponse>, ApiError> {
    let endpoint = state.registry.get(endpoint_id, &body.schema).await?;

    let mut metadata = EventMetadata::default();
    metadata.schema_name = Some(body.schema.clone());
    let event = eventcore::types::DomainEvent::new(
        body.event_type,
        "webhook_endpoint",
        endpoint_id.to_string(),
        body.payload,
        metadata,
    );

    let history = eventcore::traits::AttemptHistory::default();
    let plan = state.planner.plan(&event, &endpoint, &history);

    let (attempt_number, max_attempts, deadline, idempotency_key) = match plan {
        eventcore::traits::DeliveryPlan::Attempt {
            attempt_number,
            max_attempts,
            deadline,
            idempotency_key,
            ..
        } => (attempt_number, max_attempts, deadline, idempotency_key),
        eventcore::traits::DeliveryPlan::Exhausted => {
            return Ok(Json(TestDeliveryResponse {
                status: "exhausted",
                http_status: None,
                latency_ms: None,
                error: Some("retry policy does not allow any attempts".to_string()),
            }))
        }
    };

    let result = state
        .http_adapter
        .deliver(attempt_number, max_attempts, deadline, &idempotency_key, &event, &endpoint)
        .await;

    Ok(Json(TestDeliveryResponse {
        status: if result.attempt.status == AttemptStatus::Success { "success" } else { "failed" },
        http_status: result.attempt.response.as_ref().map(|r| r.status_code),
        latency_ms: result.attempt.response.as_ref().map(|r| r.latency_ms),
        error: result.attempt.error.map(|e| e.message),
    }))
}

/// `GET /v1/events/{id}?schema=...`
pub async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<EventId>,
    Query(query): Query<SchemaQuery>,
) -> Result<Json<EventDetailResponse>, ApiError> {
    let event = state.event_store.load(event_id, &query.schema).await?;
    let attempts = state
        .attempt_recorder
        .attempts_for_event(event_id, &query.schema)
        .await?;

    Ok(Json(EventDetailResponse {
        event_id: event.event_id,
        event_type: event.event_type,
        aggregate_type: event.aggregate_type,
        aggregate_id: event.aggregate_id,
        payload: event.payload,
        occurred_at: event.occurred_at,
        processing_state: event.processing_state,
        attempts_count: event.attempts_count,
        attempts,
    }))
}

/// `GET /v1/webhook-endpoints/{id}/attempts?schema=...&status=...&since=...`
pub async fn list_attempts(
    State(state): State<AppState>,
    Path(endpoint_id): Path<EndpointId>,
    Query(schema_query): Query<SchemaQuery>,
    Query(filter): Query<AttemptsQuery>,
) -> Result<Json<Vec<eventcore::types::DeliveryAttempt>>, ApiError> {
    let status = filter
        .status
        .map(|s| parse_attempt_status(&s))
        .transpose()?;
    let attempts = state
        .attempt_recorder
        .attempts_for_endpoint(endpoint_id, &schema_query.schema, status, filter.since)
        .await?;
    Ok(Json(attempts))
}

fn parse_attempt_status(s: &str) -> Result<AttemptStatus, ApiError> {
    match s {
        "pending" => Ok(AttemptStatus::Pending),
        "in_flight" => Ok(AttemptStatus::InFlight),
        "success" => Ok(AttemptStatus::Success),
        "failed" => Ok(AttemptStatus::Failed),
        "timeout" => Ok(AttemptStatus::Timeout),
        "cancelled" => Ok(AttemptStatus::Cancelled),
        "retrying" => Ok(AttemptStatus::Retrying),
        other => Err(ApiError::BadRequest(format!("unknown attempt status: {other}"))),
    }
}

/// `GET /v1/metrics`
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics.render().await;
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

/// `GET /v1/health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.check_all().await;
    let status_code = if report.status == "down" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status_code, Json(report))
}
