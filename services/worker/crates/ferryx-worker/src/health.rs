//! Liveness endpoint for container and load-balancer probes.

use axum::Router;
use axum::routing::get;

/// `GET /health` → `200 OK` with body `OK`. Unauthenticated.
pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

async fn health() -> &'static str {
    "OK"
}
