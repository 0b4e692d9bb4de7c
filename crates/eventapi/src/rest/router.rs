//! Axum router configuration for the endpoint management and observability
//! surfaces (§6.2, §6.3). Authentication is explicitly out of scope — the
//! daemon is expected to sit behind a trusted ingress that handles it.

use axum::middleware as axum_middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::rest::{handlers, middleware};
use crate::AppState;

pub fn create_router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/webhook-endpoints", post(handlers::create_endpoint).get(handlers::list_endpoints))
        .route(
            "/webhook-endpoints/:id",
            get(handlers::get_endpoint)
                .patch(handlers::update_endpoint)
                .delete(handlers::delete_endpoint),
        )
        .route("/webhook-endpoints/:id/test", post(handlers::test_endpoint))
        .route("/webhook-endpoints/:id/attempts", get(handlers::list_attempts))
        .route("/events/:id", get(handlers::get_event))
        .route("/metrics", get(handlers::metrics))
        .route("/health", get(handlers::health));

    Router::new()
        .nest("/v1", v1)
        .layer(axum_middleware::from_fn(middleware::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exercised end-to-end in `apps/eventd`'s integration tests, where a
    // real `AppState` can be built against a test database. Route wiring
    // alone has nothing meaningful to assert without one.
}
