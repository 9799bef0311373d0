use ace_server::{AceConfig, AppState};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

fn build_app() -> axum::Router {
    let config = AceConfig::default();
    let state = AppState::build(config).expect("app state builds with defaults");
    ace_server::build_router(state)
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(v) => Body::from(v.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn stream_started_body(container_id: &str, key: &str, session: &str) -> Value {
    json!({
        "container_id": container_id,
        "engine": {"host": container_id, "port": 6878},
        "stream": {"key_type": "infohash", "key": key},
        "session": {
            "playback_session_id": session,
            "stat_url": "http://engine/stat",
            "command_url": "http://engine/cmd",
            "is_live": false
        },
        "labels": {}
    })
}

#[tokio::test]
async fn stream_started_then_listed() {
    let app = build_app();
    let (status, body) = send(&app, "POST", "/events/stream_started", Some(stream_started_body("eng-1", "hash1", "sess-1"))).await;
    assert_eq!(status, StatusCode::OK);
    let stream_id = body["id"].as_str().unwrap().to_string();

    let (status, streams) = send(&app, "GET", "/streams", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(streams.as_array().unwrap().iter().any(|s| s["id"] == stream_id));
}

#[tokio::test]
async fn replayed_stream_ended_is_not_updated_twice() {
    let app = build_app();
    let (_, started) = send(&app, "POST", "/events/stream_started", Some(stream_started_body("eng-2", "hash2", "sess-2"))).await;
    let stream_id = started["id"].as_str().unwrap().to_string();

    let end_body = json!({"stream_id": stream_id, "reason": "explicit"});
    let (status, first) = send(&app, "POST", "/events/stream_ended", Some(end_body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["updated"], true);

    let (status, second) = send(&app, "POST", "/events/stream_ended", Some(end_body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["updated"], false);
}

#[tokio::test]
async fn vpn_status_reports_none_mode_by_default() {
    let app = build_app();
    let (status, body) = send(&app, "GET", "/vpn/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "none");
    assert_eq!(body["emergency_mode"], false);
}

#[tokio::test]
async fn health_ready_is_ready_with_no_engines_and_closed_circuit() {
    let app = build_app();
    let (status, body) = send(&app, "GET", "/health/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
    assert_eq!(body["engines"], 0);
    assert_eq!(body["circuit_state"], "closed");
}

#[tokio::test]
async fn metrics_endpoint_returns_prometheus_text() {
    let app = build_app();
    let request = Request::builder()
        .method("GET")
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("ace_engines_total"));
}

#[tokio::test]
async fn looping_streams_reports_configured_retention() {
    let app = build_app();
    let (status, body) = send(&app, "GET", "/looping-streams", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stream_ids"].as_array().unwrap().len(), 0);
    assert_eq!(body["retention_minutes"], 60);
}
