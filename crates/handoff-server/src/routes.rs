//! Demo routes. Every response names the process that served it, which makes
//! a succession visible from the client side.

use std::time::Duration;

use axum::extract::Path;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Upper bound for `/sleep/:ms`.
const MAX_SLEEP: Duration = Duration::from_secs(60);

pub fn router() -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/sleep/:ms", get(sleep_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

async fn root_handler() -> String {
    format!("Hello from pid {}\n", std::process::id())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    pid: u32,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        pid: std::process::id(),
    })
}

/// Holds the request open, for watching a drain in progress.
async fn sleep_handler(Path(ms): Path<u64>) -> String {
    let delay = Duration::from_millis(ms).min(MAX_SLEEP);
    tokio::time::sleep(delay).await;
    format!("Slept {}ms in pid {}\n", delay.as_millis(), std::process::id())
}
