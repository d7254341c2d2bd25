//! HTTP control plane tests
//!
//! Drives the router with `tower::ServiceExt::oneshot` and checks both the
//! JSON responses and the recorder state behind them.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use expert_distribution::api::{
    create_router, AppState, ControlResponse, DumpResponse, ErrorResponse, HealthResponse,
    StatusResponse,
};
use expert_distribution::{
    ExpertDistributionRecorder, LayerId, RecorderConfig, RecordingState, TopkIds,
};
use serde::de::DeserializeOwned;
use tower::ServiceExt;

fn test_state(dir: &std::path::Path) -> AppState {
    AppState::new(Arc::new(ExpertDistributionRecorder::with_host_device(
        RecorderConfig::new().with_output_dir(dir).with_rank(2),
    )))
}

async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, axum::body::Bytes) {
    let response = app
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .expect("test"),
        )
        .await
        .expect("test");
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("test");
    (status, body)
}

async fn call_json<T: DeserializeOwned>(
    state: &AppState,
    method: &str,
    uri: &str,
) -> (StatusCode, T) {
    let (status, body) = call(create_router(state.clone()), method, uri).await;
    (status, serde_json::from_slice(&body).expect("test"))
}

#[tokio::test]
async fn test_health_reports_device() {
    let dir = tempfile::tempdir().expect("test");
    let state = test_state(dir.path());

    let (status, health): (_, HealthResponse) = call_json(&state, "GET", "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health.status, "healthy");
    assert_eq!(health.device, "host");
    assert!(!health.version.is_empty());
}

#[tokio::test]
async fn test_start_stop_cycle() {
    let dir = tempfile::tempdir().expect("test");
    let state = test_state(dir.path());

    let (status, resp): (_, ControlResponse) =
        call_json(&state, "POST", "/start_expert_distribution_record").await;
    assert_eq!(status, StatusCode::OK);
    assert!(resp.success);
    assert!(state.recorder().is_recording());

    let (status, resp): (_, ControlResponse) =
        call_json(&state, "POST", "/stop_expert_distribution_record").await;
    assert_eq!(status, StatusCode::OK);
    assert!(resp.success);
    assert!(!state.recorder().is_recording());
}

#[tokio::test]
async fn test_dump_writes_artifact_and_resets() {
    let dir = tempfile::tempdir().expect("test");
    let state = test_state(dir.path());

    call(create_router(state.clone()), "POST", "/start_expert_distribution_record").await;
    state.recorder().set_current_layer(0);
    state
        .recorder()
        .record_new_token(&TopkIds::from_rows(&[[1u32, 2], [2, 3]]).expect("test"))
        .expect("test");

    let (status, dump): (_, DumpResponse) =
        call_json(&state, "POST", "/dump_expert_distribution_record").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(dump.rows, 3);
    assert_eq!(dump.total_activations, 4);
    assert!(dump.path.contains("expert_distribution_rank2_timestamp"));
    assert_eq!(
        std::fs::read_to_string(&dump.path).expect("test"),
        "layer_id,expert_id,count\n0,1,1\n0,2,2\n0,3,1\n"
    );
    assert_eq!(state.recorder().status().state, RecordingState::Idle);
    assert_eq!(state.recorder().current_layer(), None);
}

#[tokio::test]
async fn test_dump_failure_is_500_and_keeps_session() {
    let dir = tempfile::tempdir().expect("test");
    let state = test_state(&dir.path().join("missing"));

    call(create_router(state.clone()), "POST", "/start_expert_distribution_record").await;
    state.recorder().set_current_layer(1);
    state
        .recorder()
        .record_new_token(&TopkIds::from_rows(&[[4u32, 5]]).expect("test"))
        .expect("test");

    let (status, err): (_, ErrorResponse) =
        call_json(&state, "POST", "/dump_expert_distribution_record").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(err.error.contains("missing"));
    assert!(state.recorder().is_recording());
    assert_eq!(state.recorder().snapshot().num_records(), 1);
}

#[tokio::test]
async fn test_reset_clears_session() {
    let dir = tempfile::tempdir().expect("test");
    let state = test_state(dir.path());

    call(create_router(state.clone()), "POST", "/start_expert_distribution_record").await;
    state.recorder().set_current_layer(3);

    let (status, resp): (_, ControlResponse) =
        call_json(&state, "POST", "/reset_expert_distribution_record").await;

    assert_eq!(status, StatusCode::OK);
    assert!(resp.success);
    assert!(!state.recorder().is_recording());
    assert_eq!(state.recorder().current_layer(), None);
}

#[tokio::test]
async fn test_status_reflects_session() {
    let dir = tempfile::tempdir().expect("test");
    let state = test_state(dir.path());

    state.recorder().start();
    state.recorder().set_current_layer(5);
    state
        .recorder()
        .record_new_token(&TopkIds::from_rows(&[[0u32, 1], [1, 2]]).expect("test"))
        .expect("test");

    let (status, resp): (_, StatusResponse) =
        call_json(&state, "GET", "/expert_distribution_record/status").await;

    assert_eq!(status, StatusCode::OK);
    assert!(resp.recording);
    assert_eq!(resp.status.state, RecordingState::Recording);
    assert_eq!(resp.status.current_layer, Some(LayerId(5)));
    assert_eq!(resp.status.layers, 1);
    assert_eq!(resp.status.records, 2);
    assert_eq!(resp.status.sessions_started, 1);
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let dir = tempfile::tempdir().expect("test");
    let (status, _) = call(
        create_router(test_state(dir.path())),
        "POST",
        "/start_profile",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
