//! # HTTP Server
//!
//! HTTP server for metrics, health checks, status queries and admin operations.
//!
//! Provides endpoints:
//! - `/metrics` - Prometheus metrics in text format
//! - `/healthz` - Liveness probe (always returns 200)
//! - `/readyz` - Readiness probe (returns 200 once the initial sync is loaded)
//! - `/status`, `/status/{namespace}/{name}` - per-destination sync status
//! - `/stores` - last health check of every store
//! - `POST /retract`, `POST /trigger` - admin operations, `Authorization: Bearer <ADMIN_TOKEN>`
//!
//! Admin operations answer 403 when no admin token is configured.
//! The server runs on port 5000 by default (configurable via `METRICS_PORT` environment variable).

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::controller::reconciler::{Reconciler, ReconcilerError, TaskKey};
use crate::controller::rules::RuleId;
use crate::controller::state::{FailureKind, SyncOutcome, SyncPhase, SyncRecord};
use crate::observability::metrics;
use crate::secret::SecretId;

pub struct ServerState {
    /// Set once the listener is bound
    pub is_listening: AtomicBool,
    /// Set once the initial rules and secrets are loaded
    pub is_ready: AtomicBool,
    pub reconciler: Arc<Reconciler>,
    pub admin_token: Option<Zeroizing<String>>,
}

impl ServerState {
    #[must_use]
    pub fn new(reconciler: Arc<Reconciler>, admin_token: Option<Zeroizing<String>>) -> Self {
        Self {
            is_listening: AtomicBool::new(false),
            is_ready: AtomicBool::new(false),
            reconciler,
            admin_token,
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.is_ready.store(ready, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("is_listening", &self.is_listening.load(Ordering::Relaxed))
            .field("is_ready", &self.is_ready.load(Ordering::Relaxed))
            .field("admin_enabled", &self.admin_token.is_some())
            .finish_non_exhaustive()
    }
}

/// Sync status of one destination, as served by `/status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationStatus {
    pub secret: SecretId,
    pub rule: RuleId,
    pub store: String,
    pub phase: SyncPhase,
    pub synced_version: Option<u64>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_attempt_time: Option<DateTime<Utc>>,
    pub last_outcome: Option<SyncOutcome>,
    pub retry_count: u32,
    pub failure_reason: Option<FailureKind>,
    pub failure_message: Option<String>,
}

impl From<&SyncRecord> for DestinationStatus {
    fn from(record: &SyncRecord) -> Self {
        Self {
            secret: record.secret.clone(),
            rule: record.rule.clone(),
            store: record.store.clone(),
            phase: record.phase,
            synced_version: record.last_pushed_version,
            last_sync_time: record.last_success,
            last_attempt_time: record.last_attempt,
            last_outcome: record.last_outcome,
            retry_count: record.retry_count,
            failure_reason: record.last_failure.as_ref().map(|failure| failure.kind),
            failure_message: record.last_failure.as_ref().map(|failure| failure.message.clone()),
        }
    }
}

/// Body of `POST /retract` and `POST /trigger`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationRequest {
    pub secret: SecretId,
    pub rule: RuleId,
    pub store: String,
}

impl DestinationRequest {
    fn task_key(self) -> TaskKey {
        TaskKey::new(self.secret, self.rule, self.store)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetractResponse {
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/status", get(status_handler))
        .route("/status/{namespace}/{name}", get(secret_status_handler))
        .route("/stores", get(stores_handler))
        .route("/retract", post(retract_handler))
        .route("/trigger", post(trigger_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the listener fails
///
/// Readiness is left to the caller; `/readyz` answers 503 until
/// [`ServerState::set_ready`] is called.
///
/// # Errors
/// Returns an error when the port cannot be bound or the server stops.
pub async fn start_server(port: u16, state: Arc<ServerState>) -> Result<(), anyhow::Error> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on {}", addr);
    state.is_listening.store(true, Ordering::Relaxed);

    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn metrics_handler() -> Response {
    match metrics::gather_text() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {e}"),
            )
                .into_response()
        }
    }
}

async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.is_ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn status_handler(State(state): State<Arc<ServerState>>) -> Json<Vec<DestinationStatus>> {
    let snapshot = state.reconciler.state().snapshot();
    Json(snapshot.values().map(DestinationStatus::from).collect())
}

async fn secret_status_handler(
    State(state): State<Arc<ServerState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let id = SecretId::new(namespace, name);
    let snapshot = state.reconciler.state().snapshot();
    let statuses: Vec<DestinationStatus> = snapshot
        .values()
        .filter(|record| record.secret == id)
        .map(DestinationStatus::from)
        .collect();
    if statuses.is_empty() {
        return error_response(StatusCode::NOT_FOUND, format!("no sync records for secret {id}"));
    }
    Json(statuses).into_response()
}

async fn stores_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.reconciler.store_health())
}

async fn retract_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<DestinationRequest>,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    let key = request.task_key();
    info!("Retraction requested for {}", key);
    match state.reconciler.retract(&key).await {
        Ok(removed) => Json(RetractResponse { removed }).into_response(),
        Err(e) => reconciler_error_response(&e),
    }
}

async fn trigger_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<DestinationRequest>,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    match state.reconciler.trigger(request.task_key()) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => reconciler_error_response(&e),
    }
}

/// Check the bearer token against `ADMIN_TOKEN`
#[allow(clippy::result_large_err, reason = "the error is the HTTP response itself")]
fn authorize(state: &ServerState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.admin_token else {
        return Err(error_response(
            StatusCode::FORBIDDEN,
            "admin operations are disabled: ADMIN_TOKEN is not set".to_string(),
        ));
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);
    match provided {
        Some(token) if tokens_match(token, expected) => Ok(()),
        _ => {
            warn!("Rejected admin request with a missing or wrong bearer token");
            Err(error_response(
                StatusCode::UNAUTHORIZED,
                "missing or invalid bearer token".to_string(),
            ))
        }
    }
}

/// Compare digests so the comparison time does not depend on where the tokens differ
fn tokens_match(provided: &str, expected: &str) -> bool {
    let provided = Sha256::digest(provided.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    provided
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

fn reconciler_error_response(err: &ReconcilerError) -> Response {
    let status = match err {
        ReconcilerError::NotFound(_) | ReconcilerError::StoreNotFound(_) => StatusCode::NOT_FOUND,
        ReconcilerError::Retract { .. } => StatusCode::BAD_GATEWAY,
        ReconcilerError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::generator::GeneratorEngine;
    use crate::controller::reconciler::ReconcilerConfig;
    use crate::controller::state::StateStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn state(admin_token: Option<&str>) -> Arc<ServerState> {
        let reconciler = Reconciler::new(
            ReconcilerConfig::default(),
            StateStore::new(),
            GeneratorEngine::new(),
        );
        Arc::new(ServerState::new(
            reconciler,
            admin_token.map(|token| Zeroizing::new(token.to_string())),
        ))
    }

    fn retract_request(token: Option<&str>) -> Request<Body> {
        let body = serde_json::json!({
            "secret": { "namespace": "payments", "name": "db-credentials" },
            "rule": { "namespace": "payments", "name": "db-push" },
            "store": "vault-r1"
        });
        let mut builder = Request::builder()
            .method("POST")
            .uri("/retract")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder
            .body(Body::from(body.to_string()))
            .expect("valid request")
    }

    async fn status_of(state: &Arc<ServerState>, request: Request<Body>) -> StatusCode {
        router(Arc::clone(state))
            .oneshot(request)
            .await
            .expect("router is infallible")
            .status()
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("abc", "abc"));
        assert!(!tokens_match("abc", "abd"));
        assert!(!tokens_match("", "abc"));
    }

    #[tokio::test]
    async fn test_readyz_follows_ready_flag() {
        let state = state(None);
        let readyz = || Request::get("/readyz").body(Body::empty()).expect("valid request");

        assert_eq!(status_of(&state, readyz()).await, StatusCode::SERVICE_UNAVAILABLE);
        state.set_ready(true);
        assert_eq!(status_of(&state, readyz()).await, StatusCode::OK);

        let healthz = Request::get("/healthz").body(Body::empty()).expect("valid request");
        assert_eq!(status_of(&state, healthz).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_disabled_without_token() {
        let state = state(None);
        assert_eq!(
            status_of(&state, retract_request(Some("anything"))).await,
            StatusCode::FORBIDDEN
        );
    }

    #[tokio::test]
    async fn test_admin_rejects_missing_or_wrong_token() {
        let state = state(Some("s3cr3t-admin"));
        assert_eq!(
            status_of(&state, retract_request(None)).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(&state, retract_request(Some("wrong"))).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn test_retract_unknown_destination_is_not_found() {
        let state = state(Some("s3cr3t-admin"));
        let response = router(Arc::clone(&state))
            .oneshot(retract_request(Some("s3cr3t-admin")))
            .await
            .expect("router is infallible");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), 64 * 1024)
            .await
            .expect("readable body");
        let error: ErrorBody = serde_json::from_slice(&body).expect("error body");
        assert!(error.error.contains("db-credentials"));
    }

    #[tokio::test]
    async fn test_status_of_unknown_secret_is_not_found() {
        let state = state(None);
        let request = Request::get("/status/payments/missing")
            .body(Body::empty())
            .expect("valid request");
        assert_eq!(status_of(&state, request).await, StatusCode::NOT_FOUND);

        let all = Request::get("/status").body(Body::empty()).expect("valid request");
        assert_eq!(status_of(&state, all).await, StatusCode::OK);
    }
}
