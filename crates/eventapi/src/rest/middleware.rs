//! HTTP-level middleware. Authentication and rate limiting are explicitly
//! out of scope (§1 Non-goals) — this module carries only the request-id
//! correlation the rest of the stack's tracing spans assume.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Stamps every request/response pair with a request id, reusing one the
/// caller already supplied so traces compose across service boundaries.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request
        .headers_mut()
        .insert(REQUEST_ID_HEADER, HeaderValue::from_str(&request_id).unwrap_or_else(|_| HeaderValue::from_static("invalid")));

    tracing::Span::current().record("request_id", tracing::field::display(&request_id));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(axum::middleware::from_fn(request_id_middleware))
    }

    #[tokio::test]
    async fn generates_a_request_id_when_none_supplied() {
        let response = app()
            .oneshot(HttpRequest::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let id = response.headers().get(REQUEST_ID_HEADER).expect("request id header");
        assert!(Uuid::parse_str(id.to_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn preserves_a_caller_supplied_request_id() {
        let response = app()
            .oneshot(
                HttpRequest::builder()
                    .uri("/ping")
                    .header(REQUEST_ID_HEADER, "caller-supplied-id")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get(REQUEST_ID_HEADER).unwrap(),
            "caller-supplied-id"
        );
    }
}
