//! HTTP transport for every surface named in spec.md section 6: node
//! registration/heartbeat/claim, task ack/result/submit/read/cancel, DLQ
//! inspection/replay, node admin ops, the live event stream, Prometheus
//! metrics, and the aggregate run summary.
//!
//! Shaped after the teacher's `serve_cmd` module: an `AppError` that
//! implements `IntoResponse`, a `build_router(state) -> Router`, and
//! `run_serve` wiring graceful shutdown to Ctrl+C. Generalized from a
//! single read-only `PgPool` state to an `AppState` bundling the Store,
//! Event Bus, Lifecycle Coordinator, Admin Surface, and the four token
//! secrets, since this surface must authenticate and mutate as well as
//! read.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use edgemesh_core::claim::{self, ClaimConfig};
use edgemesh_core::clock::{Clock, SystemClock};
use edgemesh_core::error::CoreError;
use edgemesh_core::events::EventBus;
use edgemesh_core::ids::{NodeId, TaskId};
use edgemesh_core::lifecycle::LifecycleCoordinator;
use edgemesh_core::metrics;
use edgemesh_core::store::{Heartbeat, Node, NodeCapabilities, NewTask, Store, Task};
use edgemesh_core::token::{self, ReplayCache, TokenError, TokenSecret};
use edgemesh_core::admin::AdminSurface;

use crate::config::EdgeMeshConfig;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub events: Arc<EventBus>,
    pub lifecycle: Arc<LifecycleCoordinator>,
    pub admin: Arc<AdminSurface>,
    pub clock: Arc<dyn Clock>,
    pub claim_config: ClaimConfig,
    pub bootstrap_secret: TokenSecret,
    pub node_token_secret: TokenSecret,
    pub job_token_secret: TokenSecret,
    pub admin_secret: TokenSecret,
    pub node_token_ttl_ms: i64,
    pub job_replay_cache: Arc<ReplayCache>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, events: Arc<EventBus>, config: &EdgeMeshConfig) -> Self {
        let lifecycle = Arc::new(LifecycleCoordinator::new(store.clone(), events.clone(), config.retry_config));
        let admin = Arc::new(AdminSurface::new(store.clone(), events.clone(), lifecycle.clone()));
        Self {
            store,
            events,
            lifecycle,
            admin,
            clock: Arc::new(SystemClock),
            claim_config: ClaimConfig {
                claim_ttl_ms: config.claim_ttl_ms,
                freshness_thresholds: config.freshness_thresholds,
            },
            bootstrap_secret: config.bootstrap_secret.clone(),
            node_token_secret: config.node_token_secret.clone(),
            job_token_secret: config.job_token_secret.clone(),
            admin_secret: config.admin_secret.clone(),
            node_token_ttl_ms: config.node_token_ttl_ms,
            job_replay_cache: Arc::new(ReplayCache::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Maps the error taxonomy in spec.md section 6/7 onto HTTP status codes.
/// The `code` field is the stable name callers are told to match on; the
/// HTTP status is incidental transport detail.
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into() }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", msg)
    }

    pub fn missing_node_token() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "missing_node_token", "missing node token")
    }

    pub fn missing_job_token() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "missing_job_token", "missing job token")
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::FORBIDDEN, "unauthorized", "unauthorized")
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", format!("{err:#}"))
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        let code = err.code();
        let status = match &err {
            CoreError::UnknownNode(_) | CoreError::TaskNotFound(_) | CoreError::DlqEntryNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::NodeRevoked(_) | CoreError::TaskAlreadyTerminal(_) => StatusCode::CONFLICT,
            CoreError::NodeBootstrapDenied | CoreError::TokenNodeMismatch | CoreError::Unauthorized => StatusCode::FORBIDDEN,
            CoreError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, code, err.to_string())
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        let code: &'static str = match &err {
            TokenError::InvalidFormat(_) | TokenError::HmacMismatch => "token_signature_invalid",
            TokenError::MissingSecret => "internal_error",
            TokenError::Expired => "token_expired",
            TokenError::Replayed => "token_replay",
            TokenError::NodeMismatch => "token_node_mismatch",
            TokenError::JobMismatch => "token_job_mismatch",
        };
        let status = if code == "internal_error" { StatusCode::INTERNAL_SERVER_ERROR } else { StatusCode::UNAUTHORIZED };
        Self::new(status, code, err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.code, "message": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Auth helpers
// ---------------------------------------------------------------------------

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn require_bootstrap_token(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let raw = header_str(headers, "x-bootstrap-token").ok_or_else(AppError::unauthorized)?;
    token::validate_bootstrap_token(&state.bootstrap_secret, raw)
        .map_err(|_| AppError::new(StatusCode::FORBIDDEN, "node_bootstrap_denied", "bootstrap token rejected"))
}

fn require_node_token(state: &AppState, headers: &HeaderMap, expected: &NodeId) -> Result<(), AppError> {
    let raw = header_str(headers, "x-node-token").ok_or_else(AppError::missing_node_token)?;
    let now_ms = state.clock.now().timestamp_millis();
    token::validate_node_token(&state.node_token_secret, raw, expected, now_ms)?;
    Ok(())
}

fn require_admin_token(state: &AppState, headers: &HeaderMap) -> Result<String, AppError> {
    let raw = header_str(headers, "x-admin-token").ok_or_else(AppError::unauthorized)?;
    let claims = token::validate_admin_token(&state.admin_secret, raw, state.clock.now().timestamp_millis())?;
    Ok(claims.subject)
}

// ---------------------------------------------------------------------------
// Request / response DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub max_concurrent_tasks: u32,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub node: Node,
    pub node_token: String,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub status: edgemesh_core::store::HeartbeatStatus,
    pub load: f64,
    pub running_tasks: u32,
}

#[derive(Debug, Deserialize)]
pub struct TaskResultRequest {
    pub ok: bool,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub target_node_id: Option<String>,
    #[serde(default)]
    pub required_tags: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Serialize)]
pub struct NodeStat {
    pub node_id: NodeId,
    pub freshness_state: edgemesh_core::store::FreshnessState,
    pub in_flight_tasks: usize,
    pub max_concurrent_tasks: u32,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/nodes/register", post(node_register))
        .route("/nodes/{node_id}/token/refresh", post(node_refresh_token))
        .route("/nodes/{node_id}/heartbeat", post(node_heartbeat))
        .route("/nodes/{node_id}/claim", post(node_claim))
        .route("/nodes/{node_id}/drain", post(node_drain))
        .route("/nodes/{node_id}/undrain", post(node_undrain))
        .route("/nodes/{node_id}/revoke", post(node_revoke))
        .route("/nodes", get(node_list))
        .route("/nodes/stats", get(node_stats))
        .route("/nodes/{node_id}/tasks/{task_id}/ack", post(task_ack))
        .route("/nodes/{node_id}/tasks/{task_id}/result", post(task_result))
        .route("/tasks/{task_id}/submit", post(task_submit))
        .route("/tasks/{task_id}/cancel", post(task_cancel))
        .route("/tasks/{task_id}", get(task_get))
        .route("/tasks", get(task_list))
        .route("/tasks/queue", get(task_queue))
        .route("/tasks/running", get(task_running))
        .route("/dlq/{task_id}/replay", post(dlq_replay))
        .route("/dlq/{task_id}", get(dlq_get))
        .route("/dlq", get(dlq_list))
        .route("/events/stream", get(events_stream))
        .route("/metrics", get(metrics_text))
        .route("/runs/summary", get(runs_summary))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: Arc<AppState>, bind: &str, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("edgemesh serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("edgemesh serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers: node surface
// ---------------------------------------------------------------------------

async fn healthz() -> &'static str {
    "ok"
}

async fn node_register(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> Result<Response, AppError> {
    require_bootstrap_token(&state, &headers)?;
    if req.node_id.trim().is_empty() {
        return Err(AppError::validation("node_id must not be empty"));
    }

    let node_id = NodeId::new(req.node_id);
    let caps = NodeCapabilities::new(req.tags, req.max_concurrent_tasks);
    let node = state.store.upsert_node(Node::new(node_id.clone(), caps)).await?;

    let now = state.clock.now();
    state.events.emit_with_caller(
        edgemesh_core::store::Event::new(edgemesh_core::store::EventType::NodeRegistered, now).with_node(node_id.clone()),
        node_id.as_str(),
    );

    let node_token = token::issue_node_token(&state.node_token_secret, &node_id, now.timestamp_millis(), state.node_token_ttl_ms);
    tracing::info!(node_id = %node_id, "node registered");

    Ok(Json(RegisterResponse { node, node_token }).into_response())
}

async fn node_refresh_token(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let node_id = NodeId::new(node_id);
    require_node_token(&state, &headers, &node_id)?;
    state.events.record_request(node_id.as_str());
    let now = state.clock.now();
    let node_token = token::issue_node_token(&state.node_token_secret, &node_id, now.timestamp_millis(), state.node_token_ttl_ms);
    Ok(Json(serde_json::json!({ "node_token": node_token })).into_response())
}

async fn node_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Response, AppError> {
    let node_id = NodeId::new(node_id);
    require_node_token(&state, &headers, &node_id)?;

    let existing = state.store.get_node(&node_id).await?.ok_or_else(|| CoreError::UnknownNode(node_id.to_string()))?;
    if existing.revoked {
        // Section 7: state errors are surfaced without mutating state or
        // re-emitting an event.
        return Err(CoreError::NodeRevoked(node_id.to_string()).into());
    }

    let now = state.clock.now();
    state
        .store
        .set_heartbeat(&node_id, Heartbeat { ts: now, status: req.status, load: req.load, running_tasks: req.running_tasks })
        .await?;
    state.events.emit_with_caller(
        edgemesh_core::store::Event::new(edgemesh_core::store::EventType::NodeHeartbeat, now).with_node(node_id.clone()),
        node_id.as_str(),
    );

    let node = state.store.get_node(&node_id).await?.ok_or_else(|| CoreError::UnknownNode(node_id.to_string()))?;
    Ok(Json(node).into_response())
}

async fn node_claim(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let node_id = NodeId::new(node_id);
    require_node_token(&state, &headers, &node_id)?;
    let claimed: Option<Task> = claim::claim_task(&state.store, &state.events, state.clock.as_ref(), &node_id, state.claim_config).await?;
    Ok(Json(claimed).into_response())
}

async fn node_drain(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let subject = require_admin_token(&state, &headers)?;
    let node = state.admin.drain_node(&NodeId::new(node_id), &subject, state.clock.as_ref()).await?;
    Ok(Json(node).into_response())
}

async fn node_undrain(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let subject = require_admin_token(&state, &headers)?;
    let node = state.admin.undrain_node(&NodeId::new(node_id), &subject, state.clock.as_ref()).await?;
    Ok(Json(node).into_response())
}

async fn node_revoke(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let subject = require_admin_token(&state, &headers)?;
    let node = state.admin.revoke_node(&NodeId::new(node_id), &subject, state.clock.as_ref()).await?;
    Ok(Json(node).into_response())
}

async fn node_list(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let nodes = state.store.list_nodes().await?;
    Ok(Json(nodes).into_response())
}

async fn node_stats(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let now = state.clock.now();
    let nodes = state.store.list_nodes().await?;
    let running = state.store.list_running().await?;

    let stats: Vec<NodeStat> = nodes
        .into_iter()
        .map(|node| {
            let in_flight = running.iter().filter(|t| t.assigned_node_id.as_ref() == Some(&node.node_id)).count();
            NodeStat {
                freshness_state: node.freshness_state(now, state.claim_config.freshness_thresholds),
                in_flight_tasks: in_flight,
                max_concurrent_tasks: node.capabilities.max_concurrent_tasks,
                node_id: node.node_id,
            }
        })
        .collect();

    Ok(Json(stats).into_response())
}

// ---------------------------------------------------------------------------
// Handlers: task surface
// ---------------------------------------------------------------------------

async fn task_ack(
    State(state): State<Arc<AppState>>,
    Path((node_id, task_id)): Path<(String, Uuid)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let node_id = NodeId::new(node_id);
    require_node_token(&state, &headers, &node_id)?;
    let task = state.lifecycle.ack(&TaskId::new(task_id), &node_id, state.clock.as_ref()).await?;
    Ok(Json(task).into_response())
}

async fn task_result(
    State(state): State<Arc<AppState>>,
    Path((node_id, task_id)): Path<(String, Uuid)>,
    headers: HeaderMap,
    Json(req): Json<TaskResultRequest>,
) -> Result<Response, AppError> {
    let node_id = NodeId::new(node_id);
    require_node_token(&state, &headers, &node_id)?;
    let task = state
        .lifecycle
        .result(&TaskId::new(task_id), &node_id, req.ok, req.output, req.error, state.clock.as_ref())
        .await?;
    Ok(Json(task).into_response())
}

async fn task_submit(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<SubmitRequest>,
) -> Result<Response, AppError> {
    let raw = header_str(&headers, "x-job-token").ok_or_else(AppError::missing_job_token)?;
    let task_id = TaskId::new(task_id);
    let claims = token::validate_job_token(&state.job_token_secret, raw, task_id)?;
    state.job_replay_cache.check_and_record(&claims.nonce)?;

    if req.kind.trim().is_empty() {
        return Err(AppError::validation("kind must not be empty"));
    }

    let new_task = NewTask {
        task_id,
        kind: req.kind,
        payload: req.payload,
        target_node_id: req.target_node_id.map(NodeId::new),
        required_tags: req.required_tags.into_iter().collect(),
        priority: req.priority,
        max_attempts: req.max_attempts,
        timeout_ms: req.timeout_ms,
    };

    let now = state.clock.now();
    let task = state.store.enqueue_task(new_task.into_task(now)).await?;
    state.events.emit_with_caller(
        edgemesh_core::store::Event::new(edgemesh_core::store::EventType::TaskEnqueued, now).with_task(task_id),
        &format!("job:{task_id}"),
    );
    tracing::info!(task_id = %task_id, "task submitted");

    Ok(Json(task).into_response())
}

async fn task_cancel(State(state): State<Arc<AppState>>, Path(task_id): Path<Uuid>, headers: HeaderMap) -> Result<Response, AppError> {
    let subject = require_admin_token(&state, &headers)?;
    state.admin.cancel_task(&TaskId::new(task_id), &subject, state.clock.as_ref()).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn task_get(State(state): State<Arc<AppState>>, Path(task_id): Path<Uuid>) -> Result<Response, AppError> {
    let task = state
        .store
        .get_task(&TaskId::new(task_id))
        .await?
        .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;
    Ok(Json(task).into_response())
}

async fn task_list(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    Ok(Json(state.store.list_tasks().await?).into_response())
}

async fn task_queue(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    Ok(Json(state.store.list_queued().await?).into_response())
}

async fn task_running(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    Ok(Json(state.store.list_running().await?).into_response())
}

// ---------------------------------------------------------------------------
// Handlers: DLQ surface
// ---------------------------------------------------------------------------

async fn dlq_list(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    Ok(Json(state.store.list_dlq().await?).into_response())
}

async fn dlq_get(State(state): State<Arc<AppState>>, Path(task_id): Path<Uuid>) -> Result<Response, AppError> {
    let entry = state
        .store
        .get_dlq_entry(&TaskId::new(task_id))
        .await?
        .ok_or_else(|| CoreError::DlqEntryNotFound(task_id.to_string()))?;
    Ok(Json(entry).into_response())
}

async fn dlq_replay(State(state): State<Arc<AppState>>, Path(task_id): Path<Uuid>, headers: HeaderMap) -> Result<Response, AppError> {
    let subject = require_admin_token(&state, &headers)?;
    let task = state.admin.replay_dlq(&TaskId::new(task_id), &subject, state.clock.as_ref()).await?;
    Ok(Json(task).into_response())
}

// ---------------------------------------------------------------------------
// Handlers: observability surface
// ---------------------------------------------------------------------------

async fn events_stream(State(state): State<Arc<AppState>>) -> Sse<impl Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let rx = state.events.subscribe();
    let stream = async_stream::stream! {
        let mut rx = rx;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield Ok(SseEvent::default().event(event.event_type.to_string()).data(json));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream)
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let summary = metrics::summarize(&state.store, &state.events, state.clock.as_ref(), state.claim_config.freshness_thresholds)
        .await?;
    let text = metrics::render_prometheus_text(&summary);
    Ok(([("content-type", "text/plain; version=0.0.4")], text).into_response())
}

async fn runs_summary(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let summary = metrics::summarize(&state.store, &state.events, state.clock.as_ref(), state.claim_config.freshness_thresholds)
        .await?;
    Ok(Json(summary).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use edgemesh_core::retry::RetryConfig;
    use edgemesh_core::store::local::LocalStore;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let store: Arc<dyn Store> = Arc::new(LocalStore::new());
        let events = Arc::new(EventBus::default());
        let lifecycle = Arc::new(LifecycleCoordinator::new(store.clone(), events.clone(), RetryConfig::default()));
        let admin = Arc::new(AdminSurface::new(store.clone(), events.clone(), lifecycle.clone()));
        Arc::new(AppState {
            store,
            events,
            lifecycle,
            admin,
            clock: Arc::new(SystemClock),
            claim_config: ClaimConfig::default(),
            bootstrap_secret: TokenSecret::new(b"bootstrap".to_vec()),
            node_token_secret: TokenSecret::new(b"node".to_vec()),
            job_token_secret: TokenSecret::new(b"job".to_vec()),
            admin_secret: TokenSecret::new(b"admin".to_vec()),
            node_token_ttl_ms: 60_000,
            job_replay_cache: Arc::new(ReplayCache::default()),
        })
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = build_router(test_state());
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn register_without_bootstrap_token_is_rejected() {
        let app = build_router(test_state());
        let body = serde_json::json!({ "node_id": "n1", "tags": [], "max_concurrent_tasks": 2 });
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/nodes/register")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn register_then_claim_round_trips() {
        let state = test_state();
        let bootstrap = token::issue_bootstrap_token(&state.bootstrap_secret);
        let app = build_router(state.clone());

        let body = serde_json::json!({ "node_id": "n1", "tags": [], "max_concurrent_tasks": 2 });
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/nodes/register")
                    .header("content-type", "application/json")
                    .header("x-bootstrap-token", bootstrap)
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let node_token = json["node_token"].as_str().unwrap().to_string();

        // Heartbeat so the node is healthy enough to claim.
        let hb_body = serde_json::json!({ "status": "healthy", "load": 0.0, "running_tasks": 0 });
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/nodes/n1/heartbeat")
                    .header("content-type", "application/json")
                    .header("x-node-token", &node_token)
                    .body(Body::from(hb_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/nodes/n1/claim")
                    .header("x-node-token", &node_token)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(json.is_null(), "queue is empty, claim should return null");
    }

    #[tokio::test]
    async fn submit_requires_job_token_scoped_to_task_id() {
        let state = test_state();
        let task_id = Uuid::new_v4();
        let token_value = token::issue_job_token(&state.job_token_secret, TaskId::new(task_id));
        let app = build_router(state);

        let body = serde_json::json!({ "kind": "echo", "payload": {} });
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/tasks/{task_id}/submit"))
                    .header("content-type", "application/json")
                    .header("x-job-token", token_value)
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cancel_requires_admin_token() {
        let state = test_state();
        let task_id = Uuid::new_v4();
        let app = build_router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/tasks/{task_id}/cancel"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_text() {
        let app = build_router(test_state());
        let resp = app.oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("edgemesh_nodes_total"));
    }
}
