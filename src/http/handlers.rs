use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use crate::errors::{ApiError, ApiOk, ApiResult, SupervisorError};
use crate::ids::validate_channel_id;
use crate::journal::ErrorRecord;
use crate::process::{ChannelRecord, ProcessStatus};

const PLAYLIST_WAIT_ATTEMPTS: u32 = 5;
const PLAYLIST_WAIT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub stream_url: String,
}

pub async fn start_channel(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
    Json(body): Json<StartRequest>,
) -> ApiResult<ApiOk<ChannelRecord>> {
    let record = state.container.supervisor.start(&channel_id, body.stream_url).await?;
    Ok(ApiOk::new("channel started", record))
}

pub async fn stop_channel(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> ApiResult<ApiOk<serde_json::Value>> {
    validate_channel_id(&channel_id)?;
    let stopped = state.container.supervisor.stop(&channel_id).await;
    Ok(ApiOk::new(
        "channel stopped",
        json!({ "channel_id": channel_id, "stopped": stopped }),
    ))
}

pub async fn channel_status(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> ApiResult<ApiOk<ChannelRecord>> {
    validate_channel_id(&channel_id)?;
    state
        .container
        .supervisor
        .get_status(&channel_id)
        .await
        .map(|record| ApiOk::new("ok", record))
        .ok_or_else(|| ApiError::Supervisor(SupervisorError::NotFound))
}

pub async fn touch_activity(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> ApiResult<ApiOk<serde_json::Value>> {
    validate_channel_id(&channel_id)?;
    if state.container.supervisor.get_status(&channel_id).await.is_none() {
        return Err(ApiError::Supervisor(SupervisorError::NotFound));
    }
    state.container.supervisor.update_activity(&channel_id).await;
    Ok(ApiOk::new(
        "activity updated",
        json!({ "channel_id": channel_id, "updated": true }),
    ))
}

pub async fn list_channels(State(state): State<Arc<AppState>>) -> ApiOk<serde_json::Value> {
    let processes = state.container.supervisor.list().await;
    ApiOk::new("ok", json!({ "total": processes.len(), "processes": processes }))
}

pub async fn container_status(State(state): State<Arc<AppState>>) -> ApiOk<crate::container::ContainerStatus> {
    ApiOk::new("ok", state.container.status().await)
}

pub async fn info(State(state): State<Arc<AppState>>) -> ApiOk<serde_json::Value> {
    ApiOk::new(
        "ok",
        json!({
            "name": "transcoder-supervisor",
            "version": env!("CARGO_PKG_VERSION"),
            "hls_output_dir": state.container.config.hls_output_dir,
            "idle_timeout": state.container.config.idle_timeout,
        }),
    )
}

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.container.health().await;
    let code = if status.overall_status == "error" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    ApiOk::with_status(code, "ok", status)
}

/// Lightweight liveness probe distinct from `/api/health`: a plain 200/503
/// a load balancer can poll without paying for the full diagnostic payload.
pub async fn liveness(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let running = state.container.is_running().await;
    let status = state.container.health().await;
    let healthy = running && status.overall_status != "error";
    let code = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    ApiOk::with_status(
        code,
        "ok",
        json!({ "status": if healthy { "healthy" } else { "unhealthy" } }),
    )
}

#[derive(Debug, Deserialize)]
pub struct ErrorsQuery {
    #[serde(default = "default_minutes")]
    minutes: i64,
}

fn default_minutes() -> i64 {
    60
}

pub async fn recent_errors(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ErrorsQuery>,
) -> ApiOk<serde_json::Value> {
    let errors = state.container.journal.recent(query.minutes);
    let statistics = state.container.journal.statistics();
    ApiOk::new(
        "ok",
        json!({
            "minutes": query.minutes,
            "count": errors.len(),
            "errors": errors,
            "statistics": statistics,
        }),
    )
}

/// Replays the recovery routine against the latest journaled error for this
/// channel. 404 if the channel has never journaled an error.
pub async fn replay_recovery(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> ApiResult<ApiOk<ErrorRecord>> {
    validate_channel_id(&channel_id)?;
    state
        .container
        .journal
        .retry_recovery(&channel_id)
        .await
        .map(|record| ApiOk::new("recovery replayed", record))
        .ok_or_else(|| ApiError::Supervisor(SupervisorError::NotFound))
}

pub async fn trigger_cleanup(State(state): State<Arc<AppState>>) -> ApiOk<crate::disk::EvictStats> {
    let max_age = Duration::from_secs(state.container.config.hls_max_age * 60);
    let stats = state.container.disk.evict(max_age).await;
    ApiOk::new("cleanup triggered", stats)
}

/// Serves HLS playlist/segment files. Rejects path traversal in both path
/// components before ever touching the filesystem, then polls briefly
/// (~500ms total) for `playlist.m3u8` to appear — a channel that just
/// started may not have written its first playlist yet — aborting early if
/// the channel is not `RUNNING`, mirroring the original's wait-for-playlist
/// loop in its `/hls/<channel_id>/<filename>` route.
pub async fn serve_hls_file(
    State(state): State<Arc<AppState>>,
    Path((channel_id, filename)): Path<(String, String)>,
) -> impl IntoResponse {
    if validate_channel_id(&channel_id).is_err() || !is_safe_filename(&filename) {
        return (StatusCode::BAD_REQUEST, "invalid path").into_response();
    }

    let path = state.container.config.hls_output_dir.join(&channel_id).join(&filename);
    let is_playlist = filename.ends_with(".m3u8");

    let mut attempts = 0;
    loop {
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let mut headers = axum::http::HeaderMap::new();
                headers.insert(header::CONTENT_TYPE, content_type(&filename));
                headers.insert(header::CACHE_CONTROL, cache_control(&filename));
                return (StatusCode::OK, headers, bytes).into_response();
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && is_playlist && attempts < PLAYLIST_WAIT_ATTEMPTS => {
                let running = matches!(
                    state.container.supervisor.get_status(&channel_id).await,
                    Some(r) if r.status == ProcessStatus::Running
                );
                if !running {
                    return (StatusCode::NOT_FOUND, "file not found").into_response();
                }
                attempts += 1;
                tokio::time::sleep(PLAYLIST_WAIT_INTERVAL).await;
            }
            Err(_) => return (StatusCode::NOT_FOUND, "file not found").into_response(),
        }
    }
}

fn is_safe_filename(filename: &str) -> bool {
    !filename.is_empty() && !filename.contains('/') && !filename.contains('\\') && !filename.contains("..")
}

fn content_type(filename: &str) -> header::HeaderValue {
    if filename.ends_with(".m3u8") {
        header::HeaderValue::from_static("application/vnd.apple.mpegurl")
    } else if filename.ends_with(".ts") {
        header::HeaderValue::from_static("video/MP2T")
    } else {
        header::HeaderValue::from_static("application/octet-stream")
    }
}

fn cache_control(filename: &str) -> header::HeaderValue {
    if filename.ends_with(".m3u8") {
        header::HeaderValue::from_static("no-cache")
    } else {
        header::HeaderValue::from_static("public, max-age=60")
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::container::Container;
    use crate::http::build_router;
    use axum_test::TestServer;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn test_server() -> (TestServer, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("hls")).unwrap();
        std::fs::create_dir_all(dir.path().join("locks")).unwrap();
        let config = Config {
            ffmpeg_path: PathBuf::from("/bin/false"),
            hls_output_dir: dir.path().join("hls"),
            lock_dir: dir.path().join("locks"),
            ..Config::default()
        };
        let container = Arc::new(Container::initialize(config).unwrap());
        container.start().await;
        let app = build_router(container);
        (TestServer::new(app).unwrap(), dir)
    }

    #[tokio::test]
    async fn unknown_channel_status_returns_404() {
        let (server, _dir) = test_server().await;
        let response = server.get("/api/process/ghost/status").await;
        response.assert_status_not_found();
    }

    #[tokio::test]
    async fn hls_path_traversal_is_rejected() {
        let (server, _dir) = test_server().await;
        let response = server.get("/hls/ch1/..%2F..%2Fetc%2Fpasswd").await;
        response.assert_status_bad_request();
    }

    #[tokio::test]
    async fn list_processes_reports_total_and_empty_fleet() {
        let (server, _dir) = test_server().await;
        let response = server.get("/api/processes").await;
        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["data"]["total"], 0);
        assert_eq!(body["data"]["processes"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn liveness_probe_is_healthy_once_started() {
        let (server, _dir) = test_server().await;
        let response = server.get("/health").await;
        response.assert_status_ok();
    }
}
