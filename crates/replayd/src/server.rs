//! HTTP control plane for replayd.
//!
//! Local-only REST surface over the execution controller plus an SSE
//! status stream for live dashboards. All state changes go through the
//! controller; handlers never touch the status board or sink directly
//! except for reads.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use replay_core::{ExecutionStatus, Id, LogEntry, ResultRecord, StatusBoard};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::controller::{ControlError, Controller};
use crate::sink::ExportScope;

/// Shared state for HTTP handlers.
pub struct AppState {
    pub controller: Arc<Controller>,
    pub auth_token: Option<String>,
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/test/start", post(start_run))
        .route("/test/pause", post(pause_run))
        .route("/test/resume", post(resume_run))
        .route("/test/stop", post(stop_run))
        .route("/test/restart", post(restart_run))
        .route("/test/status", get(get_status))
        .route("/test/logs", get(get_logs))
        .route("/test/logs/export", get(export_logs))
        .route("/test/export", get(export_results))
        .route("/test/stream", get(stream_status))
        .route("/health", get(health_check))
        .with_state(state)
}

/// Start the HTTP server, bound to localhost only.
pub async fn start_server(
    controller: Arc<Controller>,
    port: u16,
    auth_token: Option<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = Arc::new(AppState {
        controller,
        auth_token,
    });

    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

/// Validate auth token if configured.
fn check_auth(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if let Some(expected) = &state.auth_token {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

        match provided {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "invalid auth token".to_string(),
                }),
            )),
            None => Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "missing auth token".to_string(),
                }),
            )),
        }
    } else {
        Ok(())
    }
}

fn control_error_response(e: ControlError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        ControlError::AlreadyRunning
        | ControlError::NotRunning
        | ControlError::NotPaused
        | ControlError::StillActive => StatusCode::CONFLICT,
        ControlError::NoCases | ControlError::Config(_) | ControlError::CaseFile(_) => {
            StatusCode::BAD_REQUEST
        }
        ControlError::Sink(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Response for POST /test/start.
#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub run_id: Id,
}

/// Generic acknowledgement for control verbs.
#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub ok: bool,
}

/// Query params for GET /test/logs.
#[derive(Debug, Deserialize, Default)]
pub struct LogsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Response for the log endpoints.
#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub logs: Vec<LogEntry>,
}

/// Query params for GET /test/export.
#[derive(Debug, Deserialize, Default)]
pub struct ExportQuery {
    /// `all` or `run`. Defaults to `run`.
    #[serde(default)]
    pub scope: Option<String>,
    /// Run to export; defaults to the most recent run.
    #[serde(default)]
    pub run_id: Option<String>,
}

/// Response for GET /test/export.
#[derive(Debug, Serialize)]
pub struct ExportResponse {
    pub records: Vec<ResultRecord>,
}

// --- Handlers ---

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /test/start - Start a run from the configured case file.
async fn start_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;

    let run_id = state.controller.start().map_err(|e| {
        warn!("start rejected: {}", e);
        control_error_response(e)
    })?;

    info!("run started: {}", run_id);
    Ok((StatusCode::CREATED, Json(StartResponse { run_id })))
}

/// POST /test/pause - Park the run at the next group boundary.
async fn pause_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    state.controller.pause().map_err(|e| {
        warn!("pause rejected: {}", e);
        control_error_response(e)
    })?;
    Ok(Json(AckResponse { ok: true }))
}

/// POST /test/resume - Resume a paused run.
async fn resume_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    state.controller.resume().map_err(|e| {
        warn!("resume rejected: {}", e);
        control_error_response(e)
    })?;
    Ok(Json(AckResponse { ok: true }))
}

/// POST /test/stop - Request a stop between turns.
async fn stop_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    state.controller.stop().map_err(|e| {
        warn!("stop rejected: {}", e);
        control_error_response(e)
    })?;
    Ok(Json(AckResponse { ok: true }))
}

/// POST /test/restart - Reset a finished run back to idle.
async fn restart_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    state.controller.restart().map_err(|e| {
        warn!("restart rejected: {}", e);
        control_error_response(e)
    })?;
    Ok(Json(AckResponse { ok: true }))
}

/// GET /test/status - Current execution status snapshot.
async fn get_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ExecutionStatus>, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    Ok(Json(state.controller.status()))
}

/// GET /test/logs - Recent log entries, newest last.
async fn get_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;

    let mut logs = state.controller.status().logs;
    if let Some(limit) = query.limit {
        let skip = logs.len().saturating_sub(limit);
        logs.drain(..skip);
    }
    Ok(Json(LogsResponse { logs }))
}

/// GET /test/logs/export - The full, uncapped log trail.
async fn export_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;
    Ok(Json(LogsResponse {
        logs: state.controller.board().full_log(),
    }))
}

/// GET /test/export - Persisted result records.
async fn export_results(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ExportQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;

    let scope = match query.scope.as_deref() {
        Some("all") => ExportScope::All,
        Some("run") | None => {
            let run_id = match query.run_id {
                Some(id) => Some(Id::from_string(id)),
                None => state.controller.sink().latest_run_id().await.map_err(|e| {
                    error!("failed to resolve latest run: {}", e);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(ErrorResponse {
                            error: format!("failed to resolve latest run: {e}"),
                        }),
                    )
                })?,
            };
            match run_id {
                Some(id) => ExportScope::Run(id),
                // Nothing persisted yet; an empty export is not an error.
                None => ExportScope::All,
            }
        }
        Some(other) => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: format!("unknown export scope: {other}"),
                }),
            ));
        }
    };

    let records = state.controller.export(&scope).await.map_err(|e| {
        error!("export failed: {}", e);
        control_error_response(e)
    })?;
    Ok(Json(ExportResponse { records }))
}

/// GET /test/stream - SSE stream of status snapshots.
///
/// Emits one snapshot per second and closes after the first terminal
/// snapshot, so a watcher sees the final state exactly once.
async fn stream_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, (StatusCode, Json<ErrorResponse>)>
{
    check_auth(&state, &headers)?;

    let board: Arc<StatusBoard> = state.controller.board().clone();

    // State: (board, emitted any, emitted a terminal snapshot).
    let stream = stream::unfold(
        (board, false, false),
        move |(board, started, sent_terminal)| async move {
            if sent_terminal {
                return None;
            }
            if started {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }

            let snapshot = board.snapshot();
            let terminal = snapshot.phase.is_terminal();
            let json = serde_json::to_string(&snapshot).unwrap_or_default();
            let event = Ok(SseEvent::default().event("status").data(json));
            Some((event, (board, true, terminal)))
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
