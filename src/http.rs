//! HTTP surface of the document sync service.

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::document::{Update, UpdateMeta};
use crate::ot::Op;
use crate::service::DocSync;
use crate::sync::project::{ProjectDoc, ProjectUpdate};
use crate::sync::SyncError;

/// Room for JSON framing on top of the largest accepted document
const BODY_LIMIT_SLACK: usize = 64 * 1024;

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            SyncError::StaleUpdate(_) => (StatusCode::UNPROCESSABLE_ENTITY, self.to_string()),
            SyncError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            SyncError::TooLarge(_) => (StatusCode::NOT_ACCEPTABLE, self.to_string()),
            SyncError::ProjectStateChanged(_) => (StatusCode::CONFLICT, self.to_string()),
            SyncError::Backpressure(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            SyncError::OutcomeUnknown(_) => {
                warn!("Request outcome unknown: {}", self);
                (StatusCode::GATEWAY_TIMEOUT, self.to_string())
            }
            SyncError::InvalidUpdate(_) | SyncError::ContentMismatch(_) => {
                debug!("Rejecting update: {}", self);
                (StatusCode::BAD_REQUEST, "invalid update".to_string())
            }
            _ => {
                error!("Request failed: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type HandlerResult<T> = Result<T, SyncError>;

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetDocQuery {
    from_version: Option<i64>,
}

#[derive(Debug, Serialize)]
struct DocResponse {
    id: String,
    lines: Vec<String>,
    version: u64,
    ops: Vec<Update>,
    ranges: Option<Value>,
    pathname: String,
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    op: Vec<Op>,
    v: u64,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    ranges: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SetDocRequest {
    lines: Vec<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

/// A doc POST carries either an op batch or full replacement content.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DocRequest {
    Update(UpdateRequest),
    Set(SetDocRequest),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectUpdateRequest {
    updates: Vec<ProjectUpdate>,
    version: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    project_history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteDocQuery {
    #[serde(default)]
    ignore_flush_errors: bool,
    #[serde(default)]
    purge: bool,
}

#[derive(Debug, Deserialize)]
struct DeleteProjectQuery {
    #[serde(default)]
    background: bool,
}

#[derive(Debug, Deserialize)]
struct DeleteProjectsRequest {
    project_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProjectDocsQuery {
    state: String,
}

#[derive(Debug, Deserialize)]
struct FlushQueuedQuery {
    limit: Option<usize>,
    /// Milliseconds a project must have been queued for
    min_delete_age: Option<u64>,
}

// ============================================================================
// HANDLERS
// ============================================================================

async fn status() -> &'static str {
    "docsync is alive"
}

async fn total_docs(State(state): State<Arc<DocSync>>) -> impl IntoResponse {
    Json(json!({ "total": state.cache.total_docs() }))
}

async fn health_check(State(state): State<Arc<DocSync>>) -> StatusCode {
    if !state.store.ping() {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    match state.persistence().ping().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!("Durable store health check failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn health_check_fast_store(State(state): State<Arc<DocSync>>) -> StatusCode {
    if state.store.ping() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

async fn health_check_durable_store(State(state): State<Arc<DocSync>>) -> StatusCode {
    match state.persistence().ping().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!("Durable store health check failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// GET /project/:project_id/doc/:doc_id
async fn get_doc(
    State(state): State<Arc<DocSync>>,
    Path((project_id, doc_id)): Path<(String, String)>,
    Query(query): Query<GetDocQuery>,
) -> HandlerResult<Json<DocResponse>> {
    let from_version = query
        .from_version
        .and_then(|v| u64::try_from(v).ok());
    let (doc, ops) = state
        .synchronizer
        .get_doc_and_recent_ops_with_lock(&project_id, &doc_id, from_version)
        .await?;
    debug!("Got doc {} at v{} with {} ops", doc_id, doc.version, ops.len());
    Ok(Json(DocResponse {
        id: doc.doc_id,
        lines: doc.lines,
        version: doc.version,
        ops,
        ranges: doc.ranges,
        pathname: doc.pathname,
    }))
}

/// POST /project/:project_id/doc/:doc_id
async fn post_doc(
    State(state): State<Arc<DocSync>>,
    Path((project_id, doc_id)): Path<(String, String)>,
    Json(request): Json<DocRequest>,
) -> HandlerResult<Response> {
    match request {
        DocRequest::Update(req) => {
            let update = Update {
                op: req.op,
                v: req.v,
                meta: UpdateMeta {
                    user_id: req.user_id,
                    source: req.source,
                    ts: None,
                },
                ranges: req.ranges,
                ..Update::new(Vec::new(), 0)
            };
            let version = state
                .dispatcher
                .submit_and_wait(&project_id, &doc_id, update)
                .await?;
            Ok(Json(json!({ "version": version })).into_response())
        }
        DocRequest::Set(req) => {
            info!(
                "Setting doc {} of project {} ({} lines)",
                doc_id,
                project_id,
                req.lines.len()
            );
            state
                .synchronizer
                .set_doc_with_lock(&project_id, &doc_id, req.lines, req.source, req.user_id)
                .await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
    }
}

/// POST /project/:project_id/doc/:doc_id/flush
async fn flush_doc(
    State(state): State<Arc<DocSync>>,
    Path((project_id, doc_id)): Path<(String, String)>,
) -> HandlerResult<StatusCode> {
    state
        .synchronizer
        .flush_doc_if_loaded_with_lock(&project_id, &doc_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /project/:project_id/doc/:doc_id
async fn delete_doc(
    State(state): State<Arc<DocSync>>,
    Path((project_id, doc_id)): Path<(String, String)>,
    Query(query): Query<DeleteDocQuery>,
) -> HandlerResult<StatusCode> {
    if query.purge {
        state
            .synchronizer
            .delete_doc_with_lock(&project_id, &doc_id)
            .await?;
    } else {
        state
            .synchronizer
            .flush_and_delete_doc_with_lock(&project_id, &doc_id, query.ignore_flush_errors)
            .await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

/// POST /project/:project_id
async fn update_project(
    State(state): State<Arc<DocSync>>,
    Path(project_id): Path<String>,
    Json(req): Json<ProjectUpdateRequest>,
) -> HandlerResult<StatusCode> {
    state
        .projects
        .update_project_with_locks(
            &project_id,
            req.project_history_id,
            req.user_id,
            req.updates,
            &req.version,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /project/:project_id/flush
async fn flush_project(
    State(state): State<Arc<DocSync>>,
    Path(project_id): Path<String>,
) -> HandlerResult<StatusCode> {
    state.flush.flush_project(&project_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /project/:project_id/doc?state=...
async fn get_project_docs(
    State(state): State<Arc<DocSync>>,
    Path(project_id): Path<String>,
    Query(query): Query<ProjectDocsQuery>,
) -> HandlerResult<Json<Vec<ProjectDoc>>> {
    let docs = state
        .projects
        .get_project_docs_and_flush_if_old(&project_id, &query.state)
        .await?;
    Ok(Json(docs))
}

/// DELETE /project/:project_id
async fn delete_project(
    State(state): State<Arc<DocSync>>,
    Path(project_id): Path<String>,
    Query(query): Query<DeleteProjectQuery>,
) -> HandlerResult<StatusCode> {
    if query.background {
        state.flush.queue_flush_and_delete_project(&project_id)?;
    } else {
        state.flush.flush_and_delete_project(&project_id).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /project
async fn delete_multiple_projects(
    State(state): State<Arc<DocSync>>,
    Json(req): Json<DeleteProjectsRequest>,
) -> HandlerResult<StatusCode> {
    info!("Queueing {} projects for deletion", req.project_ids.len());
    for project_id in &req.project_ids {
        state.flush.queue_flush_and_delete_project(project_id)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

/// GET /flush_all_projects
async fn flush_all_projects(State(state): State<Arc<DocSync>>) -> impl IntoResponse {
    let report = state.flush.flush_all_projects().await;
    Json(json!({ "flushed": report.flushed, "failed": report.failed }))
}

/// GET /flush_queued_projects
async fn flush_queued_projects(
    State(state): State<Arc<DocSync>>,
    Query(query): Query<FlushQueuedQuery>,
) -> HandlerResult<Json<Value>> {
    let limit = query.limit.unwrap_or(1000);
    let min_age = query
        .min_delete_age
        .map(Duration::from_millis)
        .unwrap_or(state.config.flush.deferred_delete_min_age);
    let flushed = state.flush.flush_queued_projects(limit, min_age).await?;
    Ok(Json(json!({ "flushed": flushed })))
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn router(state: Arc<DocSync>) -> Router {
    let body_limit = state.config.sync.max_doc_length + BODY_LIMIT_SLACK;

    Router::new()
        .route("/status", get(status))
        .route("/total", get(total_docs))
        .route("/health_check", get(health_check))
        .route("/health_check/fast_store", get(health_check_fast_store))
        .route("/health_check/durable_store", get(health_check_durable_store))
        .route(
            "/project",
            axum::routing::delete(delete_multiple_projects),
        )
        .route(
            "/project/:project_id",
            post(update_project).delete(delete_project),
        )
        .route("/project/:project_id/flush", post(flush_project))
        .route("/project/:project_id/doc", get(get_project_docs))
        .route(
            "/project/:project_id/doc/:doc_id",
            get(get_doc).post(post_doc).delete(delete_doc),
        )
        .route("/project/:project_id/doc/:doc_id/flush", post(flush_doc))
        .route("/flush_all_projects", get(flush_all_projects))
        .route("/flush_queued_projects", get(flush_queued_projects))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
