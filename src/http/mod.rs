mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::container::Container;

pub struct AppState {
    pub container: Arc<Container>,
}

/// Builds the full route table described by the control plane: per-channel
/// lifecycle endpoints, fleet-wide status/health/error endpoints, and the
/// HLS file server. Grounded on the original Flask app's route table
/// (`routes.py`), including its two health aliases and `/api/info`.
pub fn build_router(container: Arc<Container>) -> Router {
    let state = Arc::new(AppState { container });

    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any),
        );

    Router::new()
        .route("/api/process/{channel_id}/start", post(handlers::start_channel))
        .route("/api/process/{channel_id}/stop", post(handlers::stop_channel))
        .route("/api/process/{channel_id}/status", get(handlers::channel_status))
        .route("/api/process/{channel_id}/activity", post(handlers::touch_activity))
        .route("/api/processes", get(handlers::list_channels))
        .route("/api/status", get(handlers::container_status))
        .route("/api/info", get(handlers::info))
        .route("/health", get(handlers::liveness))
        .route("/api/health", get(handlers::health))
        .route("/api/errors", get(handlers::recent_errors))
        .route("/api/recovery/{channel_id}", post(handlers::replay_recovery))
        .route("/api/cleanup", post(handlers::trigger_cleanup))
        .route("/hls/{channel_id}/{filename}", get(handlers::serve_hls_file))
        .fallback(not_found)
        .layer(middleware)
        .with_state(state)
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        axum::Json(serde_json::json!({"code": 404, "message": "not found"})),
    )
}
