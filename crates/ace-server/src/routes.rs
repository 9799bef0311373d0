//! Event & Query HTTP surface (C9, spec §4.9/§6). Router and handlers built
//! the way `vpn-identity/src/bin/vpn-identity.rs` builds its router: one flat
//! `Router::new().route(...)` chain, an `AppState` extractor on every
//! handler, and a `ServiceBuilder` middleware stack for tracing/CORS.

use std::collections::HashMap;

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use ace_control::{AceProvisionRequest, Autoscaler, TraceCategory};
use ace_state::{StreamEndedEvent, StreamStartedEvent};
use ace_types::StreamStatus;

use crate::error::ApiError;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/provision", post(provision_generic))
        .route("/provision/acestream", post(provision_acestream))
        .route("/containers/{id}", delete(delete_container))
        .route("/gc", post(gc))
        .route("/scale/{n}", post(scale))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/events/stream_started", post(stream_started))
        .route("/events/stream_ended", post(stream_ended))
        .route("/engines", get(list_engines))
        .route("/engines/select", get(select_engine))
        .route("/engines/{id}", get(get_engine))
        .route("/streams", get(list_streams))
        .route("/streams/{id}/stats", get(stream_stats))
        .route("/by-label", get(by_label))
        .route("/vpn/status", get(vpn_status))
        .route("/looping-streams", get(looping_streams))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(metrics))
        .merge(protected)
        .with_state(state)
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
}

/// Rejects with 401 when `server.auth_token` is configured and the bearer
/// token doesn't match. Auth is a no-op when no token is configured, matching
/// local/dev usage of the teacher's identity binary.
async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.0.config.server.auth_token else {
        return next.run(req).await;
    };

    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if presented == Some(expected.as_str()) {
        next.run(req).await
    } else {
        ApiError::Unauthorized.into_response()
    }
}

async fn provision_generic(
    State(state): State<AppState>,
    Json(req): Json<AceProvisionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let response = provision_inner(&state, req).await?;
    Ok(Json(json!({ "container_id": response.container_id })))
}

async fn provision_acestream(
    State(state): State<AppState>,
    Json(req): Json<AceProvisionRequest>,
) -> Result<Response, ApiError> {
    let circuit_state = if state.0.circuit.is_open(ace_control::provisioner::CIRCUIT_CLASS).await {
        "open"
    } else {
        "closed"
    };

    let admission = state.0.rate_limiter.admit().await;
    if !admission.allowed {
        return Ok((
            StatusCode::TOO_MANY_REQUESTS,
            [
                ("X-RateLimit-Provisioning-Limit", admission.limit.to_string()),
                ("X-RateLimit-Provisioning-Remaining", admission.remaining.to_string()),
                ("X-Circuit-State", circuit_state.to_string()),
            ],
            Json(json!({ "error": "provisioning rate limit exceeded" })),
        )
            .into_response());
    }

    let start = std::time::Instant::now();
    let response = provision_inner(&state, req).await?;
    state
        .0
        .metrics
        .observe_provisioning_duration(start.elapsed().as_secs_f64());

    Ok((
        StatusCode::OK,
        [
            ("X-RateLimit-Provisioning-Limit", admission.limit.to_string()),
            ("X-RateLimit-Provisioning-Remaining", admission.remaining.to_string()),
            ("X-Circuit-State", circuit_state.to_string()),
        ],
        Json(response),
    )
        .into_response())
}

async fn provision_inner(
    state: &AppState,
    req: AceProvisionRequest,
) -> Result<ace_control::ProvisionResponse, ApiError> {
    let response = state.0.provisioner.provision_acestream(req).await;
    state.0.cache.invalidate_all().await;
    let response = response?;
    state.0.trace.emit(
        TraceCategory::Provisioning,
        HashMap::from([("container_id".to_string(), json!(response.container_id))]),
    );
    Ok(response)
}

async fn stream_started(
    State(state): State<AppState>,
    Json(event): Json<StreamStartedEvent>,
) -> Result<Json<ace_types::Stream>, ApiError> {
    let stream = state.0.state.on_stream_started(event).await?;
    state.0.cache.invalidate_all().await;
    Ok(Json(stream))
}

async fn stream_ended(
    State(state): State<AppState>,
    Json(event): Json<StreamEndedEvent>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state.0.state.on_stream_ended(event).await?;
    state.0.cache.invalidate_all().await;
    let stream = state.0.state.get_stream(&outcome.stream_id).await?;
    Ok(Json(json!({ "updated": !outcome.already_ended, "stream": stream })))
}

async fn list_engines(State(state): State<AppState>) -> Result<Response, ApiError> {
    if let Some(cached) = state.0.cache.get("engines").await {
        return Ok(engines_response(cached));
    }
    let engines = state.0.state.list_engines().await;
    let body = serde_json::to_value(&engines).unwrap_or(json!([]));
    state.0.cache.put("engines", body.clone()).await;
    Ok(engines_response(body))
}

fn engines_response(body: serde_json::Value) -> Response {
    let etag = format!("\"{:x}\"", seahash(&body.to_string()));
    (
        StatusCode::OK,
        [
            (axum::http::header::CACHE_CONTROL, HeaderValue::from_static("max-age=5")),
            (axum::http::header::ETAG, HeaderValue::from_str(&etag).unwrap()),
        ],
        Json(body),
    )
        .into_response()
}

/// Cheap content hash for the `ETag` header; collision resistance doesn't
/// matter here since it's only used to let clients skip re-downloading an
/// unchanged engine list, not for integrity.
fn seahash(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// §4.6/§4.9 shared layer-filling query: which engine should a new stream
/// land on right now, by the same policy the autoscaler's lookahead uses.
async fn select_engine(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let engines = state.0.state.list_engines().await;
    let streams = state.0.state.list_streams().await;
    let loaded: Vec<_> = engines
        .into_iter()
        .map(|e| {
            let load = streams
                .iter()
                .filter(|s| s.engine_container_id == e.container_id && s.status == StreamStatus::Started)
                .count();
            (e, load)
        })
        .collect();
    let picked = Autoscaler::select_engine_for_stream(&loaded, state.0.config.replicas.max_streams_per_engine);
    Ok(Json(json!({ "container_id": picked })))
}

async fn get_engine(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let engine = state.0.state.get_engine(&id).await?;
    let streams: Vec<_> = state
        .0
        .state
        .list_streams()
        .await
        .into_iter()
        .filter(|s| s.engine_container_id == id)
        .collect();
    Ok(Json(json!({ "engine": engine, "streams": streams })))
}

#[derive(Debug, Deserialize)]
struct StreamsQuery {
    status: Option<String>,
    container_id: Option<String>,
}

async fn list_streams(
    State(state): State<AppState>,
    Query(query): Query<StreamsQuery>,
) -> Json<Vec<ace_types::Stream>> {
    let status = query.status.and_then(|s| match s.as_str() {
        "started" => Some(StreamStatus::Started),
        "ended" => Some(StreamStatus::Ended),
        _ => None,
    });
    let streams = state
        .0
        .state
        .list_streams()
        .await
        .into_iter()
        .filter(|s| status.map(|want| s.status == want).unwrap_or(true))
        .filter(|s| {
            query
                .container_id
                .as_ref()
                .map(|id| &s.engine_container_id == id)
                .unwrap_or(true)
        })
        .collect();
    Json(streams)
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    since: Option<chrono::DateTime<Utc>>,
}

async fn stream_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StatsQuery>,
) -> Json<Vec<ace_types::StreamStatSnapshot>> {
    Json(state.0.state.list_stat_snapshots(&id, query.since).await)
}

#[derive(Debug, Deserialize)]
struct ByLabelQuery {
    key: String,
    value: String,
}

async fn by_label(
    State(state): State<AppState>,
    Query(query): Query<ByLabelQuery>,
) -> Json<Vec<ace_types::Engine>> {
    let engines = state
        .0
        .state
        .list_engines()
        .await
        .into_iter()
        .filter(|e| e.labels.get(&query.key) == Some(&query.value))
        .collect();
    Json(engines)
}

async fn vpn_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mode = state.0.vpn_health.mode();
    let snapshot = state.0.vpn_health.snapshot().await;
    let names = state.0.config.vpn_names();
    let vpn1 = names.first().and_then(|n| snapshot.get(n));
    let vpn2 = names.get(1).and_then(|n| snapshot.get(n));
    Json(json!({
        "mode": mode,
        "vpn1": vpn1,
        "vpn2": vpn2,
        "emergency_mode": state.0.vpn_health.is_emergency().await,
    }))
}

async fn looping_streams(State(state): State<AppState>) -> Json<serde_json::Value> {
    let entries = state.0.looping_streams.snapshot().await;
    let stream_ids: Vec<_> = entries.iter().map(|e| e.stream_id.clone()).collect();
    let by_id: HashMap<_, _> = entries.into_iter().map(|e| (e.stream_id.clone(), e)).collect();
    Json(json!({
        "stream_ids": stream_ids,
        "streams": by_id,
        "retention_minutes": state.0.config.loop_detection.retention_minutes,
    }))
}

async fn delete_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.0.driver.stop(&id, None).await?;
    state.0.state.remove_engine(&id).await?;
    state.0.cache.invalidate_all().await;
    Ok(Json(json!({})))
}

async fn gc(State(state): State<AppState>) -> Json<serde_json::Value> {
    let outcome = state.0.autoscaler.run_cycle(false).await;
    state.0.cache.invalidate_all().await;
    Json(json!({ "started": outcome.started, "reaped": outcome.reaped }))
}

/// Drives the free-engine count toward `n`: provisions more when short,
/// reaps the longest-idle ones when over. Unlike the periodic autoscaler
/// this ignores `MIN_REPLICAS`/grace period — a manual scale call is an
/// explicit override.
async fn scale(State(state): State<AppState>, Path(n): Path<usize>) -> Result<Json<serde_json::Value>, ApiError> {
    let engines = state.0.state.list_engines().await;
    let streams = state.0.state.list_streams().await;
    let mut idle: Vec<_> = engines
        .iter()
        .filter(|e| {
            !streams
                .iter()
                .any(|s| s.engine_container_id == e.container_id && s.status == StreamStatus::Started)
        })
        .collect();

    let mut started = 0;
    let mut reaped = 0;
    if idle.len() < n {
        for _ in 0..(n - idle.len()) {
            if state
                .0
                .provisioner
                .provision_acestream(AceProvisionRequest::default())
                .await
                .is_ok()
            {
                started += 1;
            }
        }
    } else if idle.len() > n {
        idle.sort_by_key(|e| e.last_stream_usage);
        for engine in idle.into_iter().take(idle.len() - n) {
            if state.0.state.remove_engine(&engine.container_id).await.is_ok() {
                reaped += 1;
            }
        }
    }
    state.0.cache.invalidate_all().await;
    Ok(Json(json!({ "started": started, "reaped": reaped })))
}

async fn health_ready(State(state): State<AppState>) -> Response {
    let engines = state.0.state.list_engines().await;
    let streams = state.0.state.list_streams().await;
    let active_streams = streams.iter().filter(|s| s.status == StreamStatus::Started).count();
    let circuit_open = state.0.circuit.is_open(ace_control::provisioner::CIRCUIT_CLASS).await;
    let ready = !circuit_open;

    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(json!({
            "ready": ready,
            "engines": engines.len(),
            "active_streams": active_streams,
            "circuit_state": if circuit_open { "open" } else { "closed" },
            "ts": Utc::now(),
        })),
    )
        .into_response()
}

async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let engines = state.0.state.list_engines().await;
    let streams = state.0.state.list_streams().await;
    let active_streams = streams.iter().filter(|s| s.status == StreamStatus::Started).count();
    let free = engines
        .iter()
        .filter(|e| {
            !streams
                .iter()
                .any(|s| s.engine_container_id == e.container_id && s.status == StreamStatus::Started)
        })
        .count();
    state
        .0
        .metrics
        .set_engine_gauges(engines.len(), free, active_streams);
    state.0.metrics.set_circuit_open(
        ace_control::provisioner::CIRCUIT_CLASS,
        state.0.circuit.is_open(ace_control::provisioner::CIRCUIT_CLASS).await,
    );

    let body = state
        .0
        .metrics
        .encode()
        .map_err(|e| ApiError::Core(ace_types::CoreError::Internal(e.to_string())))?;
    Ok((
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_hash_is_stable_for_the_same_body() {
        let a = seahash("[]");
        let b = seahash("[]");
        assert_eq!(a, b);
    }

    #[test]
    fn etag_hash_differs_for_different_bodies() {
        assert_ne!(seahash("[]"), seahash("[1]"));
    }
}
