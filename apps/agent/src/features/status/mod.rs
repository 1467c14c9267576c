use axum::{response::IntoResponse, routing::get, Extension, Json, Router};

use crate::agent::Agent;

pub fn router() -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/health", get(health))
}

/// Monotonic microseconds since agent boot plus the initialization
/// history; the supervisor's window into a stuck agent.
async fn status(Extension(agent): Extension<Agent>) -> impl IntoResponse {
    let (now, init_history) = agent.status_snapshot();
    Json(serde_json::json!({
        "now": now,
        "init_history": init_history,
    }))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "time": chrono::Utc::now(),
    }))
}
