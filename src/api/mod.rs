//! HTTP API for submission, status, deletion, monitor events, search, source
//! images and reset.

use std::net::SocketAddr;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::collab::HeaderCaptioner;
use crate::context::FleetContext;
use crate::error::{FleetError, Result};
use crate::monitor::MonitorEvent;
use crate::scheduler::{TaskId, TaskState};
use crate::store::TenantId;

const DEFAULT_EVENT_LIMIT: usize = 50;
const DEFAULT_TOP_K: usize = 5;

#[derive(Clone)]
pub struct ApiState {
    pub ctx: FleetContext,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub resource_paths: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub queued: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub removed: usize,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub top_k: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResult {
    pub resource_path: String,
    /// Where the API serves the source image of this hit.
    pub image_url: String,
    pub caption: String,
    pub distance: f32,
    pub similarity: f32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Error body plus a status code chosen from the error kind.
struct ApiError(FleetError);

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FleetError::TaskNotFound { .. } => StatusCode::NOT_FOUND,
            FleetError::InvalidConfig(_)
            | FleetError::InvalidResourcePath(_)
            | FleetError::DimensionMismatch { .. } => StatusCode::BAD_REQUEST,
            FleetError::LockTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "API request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/tenants", get(list_tenants_handler))
        .route("/api/tenants/:tenant/tasks", post(submit_handler))
        .route("/api/tenants/:tenant/status", get(tenant_status_handler))
        .route("/api/tenants/:tenant/queue/*path", delete(delete_task_handler))
        .route("/api/tenants/:tenant/search", post(search_handler))
        .route("/api/tenants/:tenant/image/*path", get(image_handler))
        .route("/api/tenants/:tenant/reset", post(reset_handler))
        .route("/api/workers", get(workers_handler))
        .route("/api/monitor/events", get(events_handler))
        .route("/api/monitor/events/reset", post(reset_events_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `cancel` fires.
pub async fn run_api(addr: SocketAddr, state: ApiState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting API server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    tracing::info!("API server stopped");
    Ok(())
}

async fn submit_handler(
    State(state): State<ApiState>,
    Path(tenant): Path<String>,
    Json(payload): Json<SubmitRequest>,
) -> ApiResult<Json<SubmitResponse>> {
    let tenant = TenantId::new(tenant)?;
    // Validate the whole batch before queueing any of it.
    let tasks = payload
        .resource_paths
        .into_iter()
        .map(|path| TaskId::new(tenant.clone(), path))
        .collect::<Result<Vec<_>>>()?;

    for task in &tasks {
        state.ctx.lifecycle.submit(task).await?;
    }
    Ok(Json(SubmitResponse {
        queued: tasks.len(),
    }))
}

async fn tenant_status_handler(
    State(state): State<ApiState>,
    Path(tenant): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let tenant = TenantId::new(tenant)?;
    Ok(Json(state.ctx.status().tenant(&tenant).await?))
}

async fn list_tenants_handler(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ctx.status().tenants().await?))
}

async fn delete_task_handler(
    State(state): State<ApiState>,
    Path((tenant, path)): Path<(String, String)>,
) -> ApiResult<Json<DeleteResponse>> {
    let tenant = TenantId::new(tenant)?;
    let removed = state.ctx.lifecycle.delete_queued(&tenant, &path).await?;
    Ok(Json(DeleteResponse { removed }))
}

async fn workers_handler(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.ctx.status().workers().await?))
}

async fn events_handler(
    State(state): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<MonitorEvent>>> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    Ok(Json(state.ctx.events.recent(limit).await?))
}

async fn reset_events_handler(State(state): State<ApiState>) -> ApiResult<StatusCode> {
    state.ctx.events.clear().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn search_handler(
    State(state): State<ApiState>,
    Path(tenant): Path<String>,
    Json(payload): Json<SearchRequest>,
) -> ApiResult<Json<Vec<SearchResult>>> {
    let tenant = TenantId::new(tenant)?;
    let vector = state.ctx.processor.embedder().embed(&payload.query).await?;
    let hits = state
        .ctx
        .artifacts
        .search(&tenant, &vector, payload.top_k.unwrap_or(DEFAULT_TOP_K))
        .await?;

    Ok(Json(
        hits.into_iter()
            .map(|hit| SearchResult {
                similarity: hit.similarity(),
                distance: hit.distance,
                image_url: image_url(&tenant, &hit.entry.resource_path),
                resource_path: hit.entry.resource_path,
                caption: hit.entry.caption,
            })
            .collect(),
    ))
}

fn image_url(tenant: &TenantId, resource_path: &str) -> String {
    let path = resource_path
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("/api/tenants/{tenant}/image/{path}")
}

/// Source image of a task the tenant has finished indexing.
async fn image_handler(
    State(state): State<ApiState>,
    Path((tenant, path)): Path<(String, String)>,
) -> ApiResult<Response> {
    let tenant = TenantId::new(tenant)?;
    if state.ctx.lifecycle.state_of(&tenant, &path).await? != TaskState::Done {
        return Err(FleetError::TaskNotFound {
            tenant: tenant.to_string(),
            resource_path: path,
        }
        .into());
    }

    let bytes = state.ctx.processor.fetcher().fetch(&path).await?;
    let media_type = HeaderCaptioner::media_type(&bytes);
    Ok(([(header::CONTENT_TYPE, media_type)], bytes).into_response())
}

/// Drop the tenant's coordination state and artifact.
async fn reset_handler(
    State(state): State<ApiState>,
    Path(tenant): Path<String>,
) -> ApiResult<StatusCode> {
    let tenant = TenantId::new(tenant)?;
    state.ctx.lifecycle.purge_tenant(&tenant).await?;
    state.ctx.artifacts.clear(&tenant).await?;
    Ok(StatusCode::NO_CONTENT)
}
