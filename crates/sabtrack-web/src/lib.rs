//! JSON HTTP surface over the download tracker.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use sabtrack_core::{DownloadRecord, DownloadStats, DownloadStatus};
use sabtrack_storage::StoreError;
use sabtrack_sync::{PriorityError, PriorityUpdate, Tracker};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "sabtrack-web";

#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<Tracker>,
}

impl AppState {
    pub fn new(tracker: Arc<Tracker>) -> Self {
        Self { tracker }
    }
}

#[derive(Debug, Deserialize)]
pub struct PriorityRequest {
    pub priority: String,
}

#[derive(Debug, Serialize)]
struct ResetResponse {
    reset: u64,
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    BadGateway(String),
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &str) {
        match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.as_str()),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg.as_str()),
            Self::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.as_str()),
            Self::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg.as_str()),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.as_str()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.parts();
        if status.is_server_error() {
            error!(%status, error = message, "request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<PriorityError> for ApiError {
    fn from(err: PriorityError) -> Self {
        let message = err.to_string();
        match err {
            PriorityError::UnknownLevel(_) => Self::Unprocessable(message),
            PriorityError::NotFound(_) => Self::NotFound(message),
            PriorityError::NotActive { .. } => Self::Conflict(message),
            PriorityError::Upstream(_) => Self::BadGateway(message),
            PriorityError::Store(_) => Self::Internal(message),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/api/downloads", get(downloads_handler))
        .route("/api/downloads/{status}", get(downloads_by_status_handler))
        .route("/api/downloads/{id}/priority", post(priority_handler))
        .route(
            "/api/downloads/admin/reset-poster-flags",
            post(reset_poster_flags_handler),
        )
        .route("/api/stats", get(stats_handler))
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` resolves, letting in-flight requests finish.
pub async fn serve(
    state: AppState,
    addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "sabtrack",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn downloads_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DownloadRecord>>, ApiError> {
    Ok(Json(state.tracker.downloads(None).await?))
}

async fn downloads_by_status_handler(
    State(state): State<Arc<AppState>>,
    Path(status): Path<String>,
) -> Result<Json<Vec<DownloadRecord>>, ApiError> {
    let status = DownloadStatus::from_str(&status)
        .map_err(|err| ApiError::Unprocessable(err.to_string()))?;
    Ok(Json(state.tracker.downloads(Some(status)).await?))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Result<Json<DownloadStats>, ApiError> {
    Ok(Json(state.tracker.stats().await?))
}

async fn priority_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<PriorityRequest>,
) -> Result<Json<PriorityUpdate>, ApiError> {
    Ok(Json(
        state
            .tracker
            .update_priority(&id, &request.priority)
            .await?,
    ))
}

async fn reset_poster_flags_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ResetResponse>, ApiError> {
    let reset = state.tracker.reset_poster_flags().await?;
    Ok(Json(ResetResponse { reset }))
}
