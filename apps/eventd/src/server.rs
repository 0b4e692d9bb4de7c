//! HTTP server: mounts the endpoint management and observability API
//! (`eventapi`) behind a thin root banner/liveness layer.

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use tracing::info;

use eventapi::{create_router, AppState};

use crate::cli::Args;

pub struct Server {
    args: Args,
    state: AppState,
}

impl Server {
    pub fn new(args: Args, state: AppState) -> Result<Self> {
        Ok(Self { args, state })
    }

    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.args.port));

        let app = Router::new()
            .route("/", get(root))
            .route("/livez", get(livez))
            .merge(create_router(self.state));

        info!(%addr, "HTTP server listening");

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind HTTP server")?;

        axum::serve(listener, app.into_make_service())
            .await
            .context("HTTP server error")?;

        Ok(())
    }
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "service": "eventd",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

async fn livez() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn root_reports_service_name() {
        let response = root().await;
        assert_eq!(response.0["service"], "eventd");
    }

    #[tokio::test]
    async fn livez_is_ok() {
        assert_eq!(livez().await, StatusCode::OK);
    }
}
