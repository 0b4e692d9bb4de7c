//! Maps `CoreError` (and the handful of API-only failure modes) onto the
//! problem+json body shape from §7: `{code, message, details}`. Nothing
//! downstream of this module ever renders an error as free text.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use eventcore::error::CoreError;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ProblemBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Wraps `CoreError` so handlers can `?`-propagate it and still produce a
/// stable HTTP response; also carries the handful of failure modes that
/// only make sense at the HTTP edge (bad pagination cursors, unparseable
/// path segments) rather than inventing new `CoreError` variants for them.
#[derive(Debug)]
pub enum ApiError {
    Core(CoreError),
    BadRequest(String),
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError::Core(e)
    }
}

impl From<uuid::Error> for ApiError {
    fn from(e: uuid::Error) -> Self {
        ApiError::BadRequest(format!("malformed id: {e}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Core(e) => (status_for(&e), ProblemBody {
                code: e.code(),
                message: e.to_string(),
                details: None,
            }),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ProblemBody {
                    code: "invalid_input",
                    message,
                    details: None,
                },
            ),
        };

        (status, Json(body)).into_response()
    }
}

/// Stable mapping from a `CoreError` kind to an HTTP status, per §7.
fn status_for(e: &CoreError) -> StatusCode {
    match e {
        CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Conflict(_) => StatusCode::CONFLICT,
        CoreError::StorageUnavailable(_) | CoreError::StreamUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        CoreError::RemoteUnavailable(_) => StatusCode::BAD_GATEWAY,
        CoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        CoreError::PolicyExhausted => StatusCode::UNPROCESSABLE_ENTITY,
        CoreError::Cancelled(_) => StatusCode::CONFLICT,
        CoreError::IntegrityViolation(_) => StatusCode::CONFLICT,
    }
}
