use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use pipeline::{
    PersistOutcome, PipelineError, PipelineService, PostedMessage, SessionStatus, SessionView,
    service::validate_document,
};
use session::{ProgressSummary, ResolutionStatus, ReviewAction};

use crate::metrics::{Metrics, MetricsSnapshot, TimedOperation};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PipelineService>,
    pub metrics: Arc<Metrics>,
    pub inbox_dir: PathBuf,
    pub upload_dir: PathBuf,
    /// Dependencies checked by `/health`, by name.
    pub probes: Vec<(String, String)>,
}

/// Error body: `{ "success": false, "error": <kind>, "message": <text> }`.
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PipelineError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::EntityNotFound(_) | PipelineError::Precondition(_) => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::Concurrency { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        } else {
            warn!(error = %self.0, "Request rejected");
        }

        let body = json!({
            "success": false,
            "error": self.0.kind(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/progress", get(get_progress))
        .route("/sessions/:id/entities/:index", delete(delete_entity))
        .route("/sessions/:id/entities/:index/resolve", post(resolve_entity))
        .route(
            "/sessions/:id/conversations/:key/messages",
            post(post_message),
        )
        .route("/sessions/:id/reextract", post(reextract_entities))
        .route("/sessions/:id/persist", post(persist))
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn track_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let timer = TimedOperation::start();
    let response = next.run(request).await;
    state
        .metrics
        .record_request(response.status().is_success(), timer.elapsed());
    response
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    dependencies: BTreeMap<String, String>,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
        .unwrap_or_default();

    let mut dependencies = BTreeMap::new();
    for (name, url) in &state.probes {
        let status = match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => "ok".to_string(),
            Ok(resp) => format!("error: status {}", resp.status()),
            Err(e) => format!("error: {}", e),
        };
        dependencies.insert(name.clone(), status);
    }

    Json(HealthResponse {
        status: "ok",
        dependencies,
    })
}

async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    /// Document path inside the inbox directory, absolute or relative to it.
    /// It is copied into the upload directory.
    path: String,
    guidance: Option<String>,
    created_by: Option<String>,
}

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: Uuid,
    status: SessionStatus,
}

/// Resolve `requested` against the inbox, following links, and refuse anything
/// that ends up outside it.
async fn inbox_document(inbox: &FsPath, requested: &str) -> Result<PathBuf, PipelineError> {
    validate_document(FsPath::new(requested))?;

    let root = tokio::fs::canonicalize(inbox).await.map_err(|e| {
        PipelineError::Precondition(format!("Inbox {} unavailable: {}", inbox.display(), e))
    })?;
    let source = tokio::fs::canonicalize(root.join(requested))
        .await
        .map_err(|e| PipelineError::Precondition(format!("Cannot read document {}: {}", requested, e)))?;
    if !source.starts_with(&root) {
        return Err(PipelineError::Precondition(format!(
            "Document {} is outside the inbox directory",
            requested
        )));
    }
    validate_document(&source)?;
    Ok(source)
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<CreateSessionResponse> {
    let source = inbox_document(&state.inbox_dir, &req.path).await?;

    let file_name = source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let upload = state
        .upload_dir
        .join(format!("{}-{}", Uuid::new_v4().simple(), file_name));
    tokio::fs::copy(&source, &upload).await.map_err(|e| {
        PipelineError::Precondition(format!("Cannot read document {}: {}", req.path, e))
    })?;

    let record = match state
        .service
        .create_session(upload.clone(), req.guidance, req.created_by)
        .await
    {
        Ok(record) => record,
        Err(e) => {
            if let Err(cleanup) = tokio::fs::remove_file(&upload).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(document = %upload.display(), error = %cleanup, "Failed to remove upload");
                }
            }
            return Err(e.into());
        }
    };

    state.metrics.record_session_created();
    info!(session_id = %record.id, source = %req.path, "Document accepted");
    Ok(Json(CreateSessionResponse {
        session_id: record.id,
        status: record.status,
    }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<SessionView> {
    Ok(Json(state.service.get_session(id).await?))
}

async fn get_progress(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ProgressSummary> {
    Ok(Json(state.service.progress(id).await?))
}

#[derive(Serialize)]
struct ResolveResponse {
    index: usize,
    resolution_status: ResolutionStatus,
}

async fn resolve_entity(
    State(state): State<AppState>,
    Path((id, index)): Path<(Uuid, usize)>,
    Json(action): Json<ReviewAction>,
) -> ApiResult<ResolveResponse> {
    let resolution_status = state.service.resolve_entity(id, index, action).await?;
    state.metrics.record_review();
    Ok(Json(ResolveResponse {
        index,
        resolution_status,
    }))
}

async fn delete_entity(
    State(state): State<AppState>,
    Path((id, index)): Path<(Uuid, usize)>,
) -> ApiResult<ProgressSummary> {
    Ok(Json(state.service.delete_entity(id, index).await?))
}

#[derive(Deserialize)]
struct MessageRequest {
    text: String,
}

async fn post_message(
    State(state): State<AppState>,
    Path((id, key)): Path<(Uuid, String)>,
    Json(req): Json<MessageRequest>,
) -> ApiResult<PostedMessage> {
    let posted = state.service.post_message(id, &key, &req.text).await?;
    state.metrics.record_message();
    Ok(Json(posted))
}

#[derive(Serialize)]
struct ReextractResponse {
    task_id: Uuid,
}

async fn reextract_entities(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ReextractResponse> {
    let task_id = state.service.reextract_entities(id).await?;
    Ok(Json(ReextractResponse { task_id }))
}

#[derive(Deserialize)]
struct PersistRequest {
    description: String,
    approved_by: Option<String>,
}

async fn persist(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<PersistRequest>,
) -> ApiResult<PersistOutcome> {
    let outcome = state
        .service
        .request_persistence(id, &req.description, req.approved_by.as_deref())
        .await?;
    state.metrics.record_persisted(outcome.change_ids.len());
    Ok(Json(outcome))
}
