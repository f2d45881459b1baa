pub mod runs;

use axum::routing::{get, post};
use axum::response::{IntoResponse, Json};
use axum::Router;

use crate::state::AppState;

/// Build the API router.
pub fn router() -> Router<AppState> {
    Router::new()
        // Runs (pipeline orchestration)
        .route("/runs", post(runs::create_run))
        .route("/runs", get(runs::list_runs))
        .route("/runs/:id", get(runs::get_run))
        .route("/runs/:id/stream", get(runs::stream_run))
        .route("/runs/:id/abort", post(runs::abort_run))
        // Health probe
        .route("/health", get(health))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
