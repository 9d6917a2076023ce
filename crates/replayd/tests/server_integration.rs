//! Integration tests for the HTTP control plane.
//!
//! Covers control verb misuse, status snapshots, auth enforcement, and
//! the export surface. Run execution itself is covered by the controller
//! unit tests; these tests exercise the HTTP layer on top of it.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use http_body_util::BodyExt;
use replay_core::{Config, StatusBoard};
use replayd::controller::Controller;
use replayd::server::{create_router, AppState};
use replayd::sink::Sink;
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

async fn create_test_app(auth_token: Option<&str>) -> (axum::Router, Arc<AppState>, TempDir) {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("test.db");
    let sink = Sink::new(&db_path).await.unwrap();
    sink.migrate_embedded().await.unwrap();

    let cases_path = dir.path().join("cases.csv");
    let mut file = std::fs::File::create(&cases_path).unwrap();
    file.write_all(b"conversation_id,round,question,expected_answer\ng1,1,hello,\n")
        .unwrap();

    let config = Config {
        cases_path,
        api_url: "http://127.0.0.1:1".to_string(),
        api_key: "test-key".to_string(),
        ..Config::default()
    };
    let controller = Arc::new(Controller::new(
        config,
        Arc::new(StatusBoard::new()),
        Arc::new(sink),
    ));

    let state = Arc::new(AppState {
        controller,
        auth_token: auth_token.map(str::to_string),
    });

    let router = create_router(Arc::clone(&state));
    (router, state, dir)
}

async fn body_to_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_check_works() {
    let (app, _, _dir) = create_test_app(None).await;

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn status_starts_idle() {
    let (app, _, _dir) = create_test_app(None).await;

    let response = app.oneshot(get("/test/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert_eq!(json["phase"], "idle");
    assert_eq!(json["progress"]["total"], 0);
    assert!(json["run_id"].is_null());
}

#[tokio::test]
async fn control_verbs_rejected_when_idle() {
    let (app, _, _dir) = create_test_app(None).await;

    for verb in ["/test/pause", "/test/resume", "/test/stop"] {
        let response = app.clone().oneshot(post(verb)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT, "verb: {verb}");
        let json = body_to_json(response).await;
        assert!(json["error"].is_string());
    }

    // Restart from idle is allowed.
    let response = app.oneshot(post("/test/restart")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn export_is_empty_before_any_run() {
    let (app, _, _dir) = create_test_app(None).await;

    let response = app
        .clone()
        .oneshot(get("/test/export?scope=all"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert_eq!(json["records"].as_array().unwrap().len(), 0);

    // Default scope (latest run) with nothing persisted is still OK.
    let response = app.oneshot(get("/test/export")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_export_scope_is_rejected() {
    let (app, _, _dir) = create_test_app(None).await;

    let response = app
        .oneshot(get("/test/export?scope=everything"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn logs_endpoint_honors_limit() {
    let (app, state, _dir) = create_test_app(None).await;

    for i in 0..10 {
        state
            .controller
            .board()
            .log(replay_core::LogLevel::Info, format!("entry {i}"));
    }

    let response = app
        .clone()
        .oneshot(get("/test/logs?limit=3"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    let logs = json["logs"].as_array().unwrap();
    assert_eq!(logs.len(), 3);
    assert_eq!(logs[0]["message"], "entry 7");

    let response = app.oneshot(get("/test/logs/export")).await.unwrap();
    let json = body_to_json(response).await;
    assert_eq!(json["logs"].as_array().unwrap().len(), 10);
}

#[tokio::test]
async fn auth_is_enforced_when_configured() {
    let (app, _, _dir) = create_test_app(Some("secret")).await;

    let response = app.clone().oneshot(get("/test/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/test/status")
                .header("authorization", "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/test/status")
                .header("authorization", "Bearer secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn start_fails_cleanly_when_case_file_is_missing() {
    let (app, state, dir) = create_test_app(None).await;
    std::fs::remove_file(dir.path().join("cases.csv")).unwrap();

    let response = app.oneshot(post("/test/start")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    // A rejected start leaves the controller idle.
    assert_eq!(state.controller.status().phase, replay_core::RunPhase::Idle);
}
