//! HTTP control plane for the expert distribution recorder
//!
//! Operators drive recording sessions over HTTP while the engine runs.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `POST /start_expert_distribution_record` - Open a new session
//! - `POST /stop_expert_distribution_record` - Stop capturing, keep data
//! - `POST /dump_expert_distribution_record` - Write the artifact, then reset
//! - `POST /reset_expert_distribution_record` - Discard data, go idle
//! - `GET /expert_distribution_record/status` - State and session sizes
//!
//! ## Example
//!
//! ```rust,ignore
//! use expert_distribution::api::{create_router, AppState};
//!
//! let state = AppState::new(recorder);
//! let app = create_router(state);
//! axum::serve(listener, app).await?;
//! ```

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::config::RecorderConfig;
use crate::recorder::{ExpertDistributionRecorder, RecorderStatus};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    recorder: Arc<ExpertDistributionRecorder>,
}

impl AppState {
    /// Serve an existing recorder
    #[must_use]
    pub fn new(recorder: Arc<ExpertDistributionRecorder>) -> Self {
        Self { recorder }
    }

    /// State with a host-device recorder built from `config`
    #[must_use]
    pub fn with_config(config: RecorderConfig) -> Self {
        Self::new(Arc::new(ExpertDistributionRecorder::with_host_device(config)))
    }

    /// The shared recorder
    #[must_use]
    pub fn recorder(&self) -> &Arc<ExpertDistributionRecorder> {
        &self.recorder
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Device backend reading routing tensors
    pub device: String,
}

/// Result of a lifecycle transition
#[derive(Debug, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Whether the operation was applied
    pub success: bool,
    /// Human-readable outcome
    pub message: String,
}

/// Result of a successful dump
#[derive(Debug, Serialize, Deserialize)]
pub struct DumpResponse {
    /// Artifact written
    pub path: String,
    /// Layers present in the artifact
    pub layers: usize,
    /// Data rows written
    pub rows: usize,
    /// Sum of all counts
    pub total_activations: u64,
}

/// Recorder status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// `true` while capturing
    pub recording: bool,
    /// Full status
    #[serde(flatten)]
    pub status: RecorderStatus,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/start_expert_distribution_record",
            post(start_record_handler),
        )
        .route("/stop_expert_distribution_record", post(stop_record_handler))
        .route("/dump_expert_distribution_record", post(dump_record_handler))
        .route(
            "/reset_expert_distribution_record",
            post(reset_record_handler),
        )
        .route("/expert_distribution_record/status", get(status_handler))
        .with_state(state)
}

/// Health check handler
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: crate::VERSION.to_string(),
        device: state.recorder.device_name().to_string(),
    })
}

fn control_ok(message: &str) -> Json<ControlResponse> {
    Json(ControlResponse {
        success: true,
        message: message.to_string(),
    })
}

async fn start_record_handler(State(state): State<AppState>) -> Json<ControlResponse> {
    state.recorder.start();
    control_ok("Start recording the expert distribution.")
}

async fn stop_record_handler(State(state): State<AppState>) -> Json<ControlResponse> {
    state.recorder.stop();
    control_ok("Stop recording the expert distribution.")
}

async fn reset_record_handler(State(state): State<AppState>) -> Json<ControlResponse> {
    state.recorder.reset();
    control_ok("Expert distribution record reset.")
}

fn internal_error(error: String) -> Response {
    tracing::error!(%error, "failed to dump expert distribution");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse { error }),
    )
        .into_response()
}

/// Dump handler - file I/O runs on the blocking pool
async fn dump_record_handler(State(state): State<AppState>) -> Response {
    let recorder = Arc::clone(&state.recorder);
    match tokio::task::spawn_blocking(move || recorder.dump()).await {
        Ok(Ok(report)) => Json(DumpResponse {
            path: report.path.display().to_string(),
            layers: report.layers,
            rows: report.rows,
            total_activations: report.total_activations,
        })
        .into_response(),
        Ok(Err(e)) => internal_error(e.to_string()),
        Err(e) => internal_error(format!("dump task failed: {e}")),
    }
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        recording: state.recorder.is_recording(),
        status: state.recorder.status(),
    })
}
