//! REST API handlers for the coordinator's RPC front door
//!
//! Producers submit batches, poll or wait for their reports and cancel
//! them here. Workers are not served on this listener; they use the
//! line-delimited protocol on the worker port.

use std::time::Instant;

use axum::{
    extract::{MatchedPath, Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::catalog::CATALOG_VERSION;
use crate::error::{CoordinatorErrorTrait, Error};
use crate::manager::{BatchOutcome, QueuedJob};
use crate::metrics;
use crate::models::{BatchId, JobSpec};

use super::handle::CoordinatorHandle;
use super::registry::{RegistryStats, WorkerInfo};

// ============================================================================
// App State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Handle to the coordinator event loop
    pub coordinator: CoordinatorHandle,

    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    pub fn new(coordinator: CoordinatorHandle) -> Self {
        Self {
            coordinator,
            start_time: Instant::now(),
        }
    }
}

// ============================================================================
// API Types
// ============================================================================

/// Generic API response wrapper. The payload's fields are flattened next
/// to `success`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(flatten)]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}

/// `POST /api/batches` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub jobs: Vec<JobSpec>,
    /// Hold the request open until the batch is resolved
    #[serde(default)]
    pub wait: bool,
}

/// Reply to an accepted, non-waiting submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub batch_id: BatchId,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Version of the job-kind catalog submissions are checked against
    #[serde(default)]
    pub catalog_version: u32,
    pub uptime_secs: u64,
}

/// Worker list response
#[derive(Debug, Serialize)]
pub struct WorkersResponse {
    pub workers: Vec<WorkerInfo>,
    pub stats: RegistryStats,
}

/// Queue listing response
#[derive(Debug, Serialize)]
pub struct QueueResponse {
    pub jobs: Vec<QueuedJob>,
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/api/health", get(health_check))
        // Batch endpoints
        .route("/api/batches", post(submit_batch))
        .route("/api/batches/{id}", get(get_batch).delete(cancel_batch))
        // Introspection endpoints
        .route("/api/workers", get(list_workers))
        .route("/api/queue", get(list_queue))
        .route("/api/stats", get(get_stats))
        .route("/metrics", get(metrics_handler))
        .route_layer(middleware::from_fn(track_requests))
        .with_state(state)
}

async fn track_requests(request: Request, next: Next) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();

    let response = next.run(request).await;

    metrics::record_api_request(
        &endpoint,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse::new(message))).into_response()
}

/// Map a coordinator error onto an HTTP status
fn coordinator_error(err: Error) -> Response {
    let status = match &err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        e if e.is_fatal() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::warn!(error = %err, "RPC request failed");
    }
    error_response(status, err.to_string())
}

fn parse_batch_id(raw: &str) -> Result<BatchId, Response> {
    raw.parse()
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, format!("Invalid batch ID: {raw}")))
}

// ============================================================================
// Health Handlers
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();

    Json(ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        catalog_version: CATALOG_VERSION,
        uptime_secs: uptime,
    }))
}

/// Prometheus scrape endpoint
async fn metrics_handler() -> Response {
    match metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ============================================================================
// Batch Handlers
// ============================================================================

/// Submit a batch; with `wait` the reply is the finished report
async fn submit_batch(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Response {
    let handle = match state.coordinator.submit(request.jobs).await {
        Ok(handle) => handle,
        Err(e) => return coordinator_error(e),
    };
    let batch_id = handle.batch_id();

    if !request.wait {
        return (
            StatusCode::ACCEPTED,
            Json(ApiResponse::success(SubmitResponse { batch_id })),
        )
            .into_response();
    }

    match handle.wait().await {
        Some(BatchOutcome::Finished(report)) => {
            (StatusCode::OK, Json(ApiResponse::success(report))).into_response()
        }
        Some(BatchOutcome::Cancelled) => error_response(
            StatusCode::CONFLICT,
            format!("Batch {batch_id} was cancelled"),
        ),
        None => coordinator_error(Error::ShuttingDown),
    }
}

/// Poll a batch
async fn get_batch(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let batch_id = match parse_batch_id(&id) {
        Ok(batch_id) => batch_id,
        Err(response) => return response,
    };

    match state.coordinator.status(batch_id).await {
        Ok(Some(status)) => (StatusCode::OK, Json(ApiResponse::success(status))).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("Batch not found: {id}")),
        Err(e) => coordinator_error(e),
    }
}

/// Cancel a batch
async fn cancel_batch(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let batch_id = match parse_batch_id(&id) {
        Ok(batch_id) => batch_id,
        Err(response) => return response,
    };

    match state.coordinator.cancel(batch_id).await {
        Ok(Some(outcome)) => (StatusCode::OK, Json(ApiResponse::success(outcome))).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("Batch not found: {id}")),
        Err(e) => coordinator_error(e),
    }
}

// ============================================================================
// Introspection Handlers
// ============================================================================

/// List connected workers
async fn list_workers(State(state): State<AppState>) -> Response {
    let workers = match state.coordinator.workers().await {
        Ok(workers) => workers,
        Err(e) => return coordinator_error(e),
    };
    let stats = match state.coordinator.stats().await {
        Ok(stats) => stats.workers,
        Err(e) => return coordinator_error(e),
    };

    Json(ApiResponse::success(WorkersResponse { workers, stats })).into_response()
}

/// List queued jobs in dispatch order
async fn list_queue(State(state): State<AppState>) -> Response {
    match state.coordinator.queue().await {
        Ok(jobs) => Json(ApiResponse::success(QueueResponse { jobs })).into_response(),
        Err(e) => coordinator_error(e),
    }
}

/// Get coordinator stats
async fn get_stats(State(state): State<AppState>) -> Response {
    #[derive(Serialize)]
    struct StatsResponse {
        #[serde(flatten)]
        coordinator: super::event_loop::CoordinatorStats,
        uptime_secs: u64,
    }

    match state.coordinator.stats().await {
        Ok(coordinator) => Json(ApiResponse::success(StatsResponse {
            coordinator,
            uptime_secs: state.start_time.elapsed().as_secs(),
        }))
        .into_response(),
        Err(e) => coordinator_error(e),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ValidationError;
    use serde_json::json;

    #[test]
    fn test_api_response_success_is_flattened() {
        let response = ApiResponse::success(SubmitResponse {
            batch_id: BatchId::new(),
        });
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["success"], json!(true));
        assert!(value["batch_id"].is_string());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_error_response() {
        let response = ErrorResponse::new("test error");
        assert!(!response.success);
        assert_eq!(response.error, "test error");
    }

    #[test]
    fn test_submit_request_wait_defaults_to_false() {
        let request: SubmitRequest =
            serde_json::from_value(json!({"jobs": [{"kind": "ping", "parameters": {}}]})).unwrap();
        assert!(!request.wait);
        assert_eq!(request.jobs[0].kind, "ping");
    }

    #[test]
    fn test_error_status_mapping() {
        let response = coordinator_error(Error::Validation(ValidationError::EmptyBatch));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = coordinator_error(Error::ShuttingDown);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_invalid_batch_id() {
        let response = parse_batch_id("not-a-uuid").unwrap_err();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
