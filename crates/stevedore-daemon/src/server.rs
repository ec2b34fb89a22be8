//! The daemon's HTTP API.
//!
//! A small axum surface mirroring the CLI: list services, list images,
//! submit a release or policy change, poll a job. Requests carry a bearer
//! token when the daemon is started with one. Cluster-touching queries are
//! bounded by a semaphore so a burst of listings cannot dogpile the
//! orchestrator.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Semaphore;

use stevedore_core::api::{PolicyRequest, ReleaseRequest, ReleaseResponse};
use stevedore_core::jobs::JobError;
use stevedore_core::update::UpdateSpec;
use stevedore_core::workload::WorkloadId;

use crate::daemon::{Daemon, DaemonError};

/// Concurrent cluster-touching queries allowed per instance.
const MAX_CONCURRENT_QUERIES: usize = 8;

struct ApiState {
    daemon: Arc<Daemon>,
    token: Option<String>,
    query_limit: Semaphore,
}

/// An API error with its HTTP status.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<DaemonError> for ApiError {
    fn from(e: DaemonError) -> Self {
        let status = match &e {
            DaemonError::Jobs(JobError::NoSuchJob { .. }) => StatusCode::NOT_FOUND,
            DaemonError::Jobs(JobError::AlreadyQueued { .. }) => StatusCode::CONFLICT,
            e if e.is_user() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

/// Builds the API router.
#[must_use]
pub fn router(daemon: Arc<Daemon>, token: Option<String>) -> Router {
    let state = Arc::new(ApiState {
        daemon,
        token,
        query_limit: Semaphore::new(MAX_CONCURRENT_QUERIES),
    });
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/services", get(list_services))
        .route("/v1/images", get(list_images))
        .route("/v1/release", post(post_release))
        .route("/v1/policy", post(post_policy))
        .route("/v1/jobs/:id", get(get_job))
        .with_state(state)
}

fn authorize(state: &ApiState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.token else {
        return Ok(());
    };
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(ApiError {
            status: StatusCode::UNAUTHORIZED,
            message: "missing or invalid token".to_string(),
        })
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_services(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)?;
    let _permit = state.query_limit.acquire().await;
    let daemon = Arc::clone(&state.daemon);
    let services = tokio::task::spawn_blocking(move || daemon.list_services())
        .await
        .map_err(|e| bad_request(e.to_string()))??;
    Ok(Json(services).into_response())
}

#[derive(Deserialize)]
struct ImagesQuery {
    service: Option<String>,
}

async fn list_images(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<ImagesQuery>,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)?;
    let service = query
        .service
        .map(|s| s.parse::<WorkloadId>())
        .transpose()
        .map_err(|e| bad_request(e.to_string()))?;
    let _permit = state.query_limit.acquire().await;
    let daemon = Arc::clone(&state.daemon);
    let images = tokio::task::spawn_blocking(move || daemon.list_images(service.as_ref()))
        .await
        .map_err(|e| bad_request(e.to_string()))??;
    Ok(Json(images).into_response())
}

async fn post_release(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(request): Json<ReleaseRequest>,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)?;
    let daemon = Arc::clone(&state.daemon);
    let id = tokio::task::spawn_blocking(move || {
        daemon.update_manifests(request.spec, request.cause)
    })
    .await
    .map_err(|e| bad_request(e.to_string()))??;
    Ok(Json(ReleaseResponse {
        release_id: id.to_string(),
    })
    .into_response())
}

async fn post_policy(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(request): Json<PolicyRequest>,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)?;
    if request.updates.is_empty() {
        return Err(bad_request("no policy updates given"));
    }
    let daemon = Arc::clone(&state.daemon);
    let id = tokio::task::spawn_blocking(move || {
        daemon.update_manifests(UpdateSpec::Policies(request.updates), request.cause)
    })
    .await
    .map_err(|e| bad_request(e.to_string()))??;
    Ok(Json(ReleaseResponse {
        release_id: id.to_string(),
    })
    .into_response())
}

async fn get_job(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)?;
    let id = id
        .parse::<stevedore_core::jobs::JobId>()
        .map_err(|e| bad_request(e.to_string()))?;
    let daemon = Arc::clone(&state.daemon);
    let job = tokio::task::spawn_blocking(move || daemon.release_status(id))
        .await
        .map_err(|e| bad_request(e.to_string()))??;
    Ok(Json(job).into_response())
}
