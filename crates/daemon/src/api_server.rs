//! HTTP control surface for the ABR orchestrator
//!
//! Exposes start/stop/status/list for operators and the serving layer, plus
//! the quality ladder, health and metrics. Every body uses the envelope
//! `{"success": bool, "data": ..., "error": {"kind", "message"}}`.

use crate::encode::{codec_string, RENDITION_PLAYLIST};
use crate::job_manager::JobManager;
use crate::jobs::{JobInfo, StartError, StopError, StopOutcome};
use crate::metrics::{build_snapshot, MetricsSnapshot, SharedMetrics};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Errors that can occur when running the API server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(std::io::Error),
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub manager: JobManager,
    pub metrics: SharedMetrics,
}

#[derive(Debug, Serialize)]
struct ApiError {
    kind: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ApiError>,
}

fn ok<T: Serialize>(data: T) -> Response {
    (
        StatusCode::OK,
        Json(Envelope {
            success: true,
            data: Some(data),
            error: None,
        }),
    )
        .into_response()
}

fn fail(status: StatusCode, kind: &str, message: String) -> Response {
    (
        status,
        Json(Envelope::<()> {
            success: false,
            data: None,
            error: Some(ApiError {
                kind: kind.to_string(),
                message,
            }),
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct StartResponse {
    already_running: bool,
    master_playlist: String,
    job: JobInfo,
}

#[derive(Debug, Serialize)]
struct StopResponse {
    source_key: String,
    outcome: StopOutcome,
}

#[derive(Debug, Serialize)]
struct QualityEntry {
    index: usize,
    name: String,
    width: u32,
    height: u32,
    video_bitrate_kbps: u32,
    max_bitrate_kbps: u32,
    buffer_size_kbps: u32,
    audio_bitrate_kbps: u32,
    codecs: Option<String>,
    playlist: String,
}

fn start_error_status(err: &StartError) -> StatusCode {
    match err {
        StartError::InvalidSourceKey(_) => StatusCode::BAD_REQUEST,
        StartError::AlreadyRunning { .. } | StartError::Stopping(_) => StatusCode::CONFLICT,
        StartError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        StartError::InvalidProfile(_)
        | StartError::Lock(_)
        | StartError::OutputDir { .. }
        | StartError::SpawnFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn health(State(state): State<AppState>) -> Response {
    ok(serde_json::json!({
        "status": "healthy",
        "active_jobs": state.manager.active_keys().len(),
    }))
}

async fn qualities(State(state): State<AppState>) -> Response {
    let entries: Vec<QualityEntry> = state
        .manager
        .settings()
        .ladder
        .iter()
        .enumerate()
        .map(|(index, p)| QualityEntry {
            index,
            name: p.name.clone(),
            width: p.width,
            height: p.height,
            video_bitrate_kbps: p.video_bitrate_kbps,
            max_bitrate_kbps: p.max_bitrate_kbps,
            buffer_size_kbps: p.buffer_size_kbps,
            audio_bitrate_kbps: p.audio_bitrate_kbps,
            codecs: codec_string(&p.codec_profile, &p.codec_level),
            playlist: format!("{}/{}", p.name, RENDITION_PLAYLIST),
        })
        .collect();
    ok(entries)
}

async fn start(State(state): State<AppState>, Path(source_key): Path<String>) -> Response {
    match state.manager.start(&source_key).await {
        Ok(outcome) => {
            let already_running = outcome.already_running();
            let job = outcome.into_info();
            ok(StartResponse {
                already_running,
                master_playlist: job.master_playlist(),
                job,
            })
        }
        Err(e) => fail(start_error_status(&e), e.kind(), e.to_string()),
    }
}

async fn stop(State(state): State<AppState>, Path(source_key): Path<String>) -> Response {
    match state.manager.stop(&source_key).await {
        Ok(outcome) => ok(StopResponse {
            source_key,
            outcome,
        }),
        Err(e @ StopError::InvalidSourceKey(_)) => {
            fail(StatusCode::BAD_REQUEST, e.kind(), e.to_string())
        }
    }
}

async fn status(State(state): State<AppState>, Path(source_key): Path<String>) -> Response {
    match state.manager.status(&source_key) {
        Some(info) => ok(info),
        None => fail(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no job for stream '{}'", source_key),
        ),
    }
}

async fn active(State(state): State<AppState>) -> Response {
    ok(state.manager.list_active())
}

/// Current snapshot: jobs and counters are read live, system metrics come
/// from the background updater
async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    let system = state.metrics.read().await.system.clone();
    let snapshot = build_snapshot(
        &state.manager.list_all(),
        state.manager.counters(),
        system,
    );
    Json(snapshot)
}

/// Creates the axum Router with every control endpoint
pub fn create_api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/qualities", get(qualities))
        .route("/transcode/start/:source_key", post(start))
        .route("/transcode/stop/:source_key", post(stop))
        .route("/transcode/status/:source_key", get(status))
        .route("/transcode/active", get(active))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the API on `bind` until `shutdown` is cancelled
pub async fn run_api_server(
    bind: &str,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let app = create_api_router(state);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind.to_string(),
            source,
        })?;
    info!(addr = %bind, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(ServerError::Serve)?;

    Ok(())
}
