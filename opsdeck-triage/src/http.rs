use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header::HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::error::TriageError;
use crate::model::{IssuePriority, IssueStatus};
use crate::processor::{Processor, ProcessorPatch};
use crate::report;
use crate::service::{InvestigationService, IssuePatch, TriggerRequest};
use crate::store::{IssueFilter, NewIssue};

pub struct AppState {
    pub service: Arc<InvestigationService>,
    pub processor: Arc<Processor>,
}

impl IntoResponse for TriageError {
    fn into_response(self) -> Response {
        let status = match &self {
            TriageError::Validation(_) => StatusCode::BAD_REQUEST,
            TriageError::NotFound(_) => StatusCode::NOT_FOUND,
            TriageError::Conflict(_) => StatusCode::CONFLICT,
            TriageError::SlotLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            TriageError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if matches!(self, TriageError::Internal(_)) {
            warn!(event = "internal_error", error = %self);
        }
        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/issues", get(list_issues).post(create_issue))
        .route("/api/v1/issues/search", get(search_issues))
        .route(
            "/api/v1/issues/:id",
            get(get_issue)
                .put(update_issue)
                .patch(update_issue)
                .delete(delete_issue),
        )
        .route(
            "/api/v1/issues/:id/attachments/*path",
            get(serve_attachment),
        )
        .route("/api/v1/issues/:id/agent/conversation", get(conversation))
        .route("/api/v1/investigate", post(trigger_investigation))
        .route("/api/v1/investigate/preview", post(preview_investigation))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/export", get(export))
        .route(
            "/api/v1/automation/processor",
            get(get_processor).patch(patch_processor),
        )
        .route(
            "/api/v1/automation/processor/reset-counter",
            post(reset_counter),
        )
        .route("/api/v1/rate-limit-status", get(rate_limit_status))
        .route("/api/v1/processes/running", get(running_processes))
        .route("/api/v1/processes/running/:id", delete(cancel_process))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

// ---- issues ----

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    priority: Option<String>,
    #[serde(rename = "type")]
    issue_type: Option<String>,
    app_id: Option<String>,
    limit: Option<usize>,
}

fn parse_status(raw: &str) -> Result<IssueStatus, TriageError> {
    IssueStatus::from_str(raw).map_err(TriageError::Validation)
}

fn parse_priority(raw: &str) -> Result<IssuePriority, TriageError> {
    IssuePriority::from_str(raw).map_err(TriageError::Validation)
}

async fn list_issues(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Response, TriageError> {
    let filter = IssueFilter {
        status: query.status.as_deref().map(parse_status).transpose()?,
        priority: query.priority.as_deref().map(parse_priority).transpose()?,
        issue_type: query.issue_type,
        app_id: query.app_id,
        limit: query.limit,
    };
    let issues = state.service.store.list(&filter)?;
    Ok(Json(issues).into_response())
}

#[derive(Debug, Deserialize, Default)]
struct ReporterBody {
    #[serde(default)]
    name: String,
    contact: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateIssueBody {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "type")]
    issue_type: String,
    priority: Option<String>,
    #[serde(default)]
    app_id: String,
    #[serde(default)]
    reporter: ReporterBody,
    #[serde(default)]
    tags: Vec<String>,
}

async fn create_issue(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateIssueBody>,
) -> Result<Response, TriageError> {
    let priority = body
        .priority
        .as_deref()
        .map(parse_priority)
        .transpose()?
        .unwrap_or_default();
    let issue = state.service.create_issue(NewIssue {
        title: body.title,
        description: body.description,
        issue_type: body.issue_type,
        priority,
        app_id: body.app_id,
        reporter_name: body.reporter.name,
        reporter_contact: body.reporter.contact,
        tags: body.tags,
    })?;
    Ok((StatusCode::CREATED, Json(issue)).into_response())
}

async fn get_issue(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, TriageError> {
    let issue = state.service.store.load(&id)?;
    Ok(Json(issue).into_response())
}

#[derive(Debug, Deserialize, Default)]
struct UpdateIssueBody {
    title: Option<String>,
    description: Option<String>,
    #[serde(rename = "type")]
    issue_type: Option<String>,
    priority: Option<String>,
    app_id: Option<String>,
    status: Option<String>,
    tags: Option<Vec<String>>,
    report: Option<String>,
}

async fn update_issue(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateIssueBody>,
) -> Result<Response, TriageError> {
    let patch = IssuePatch {
        title: body.title,
        description: body.description,
        issue_type: body.issue_type,
        priority: body.priority.as_deref().map(parse_priority).transpose()?,
        app_id: body.app_id,
        status: body.status.as_deref().map(parse_status).transpose()?,
        tags: body.tags,
        report: body.report,
    };
    let issue = state.service.update_issue(&id, patch)?;
    Ok(Json(issue).into_response())
}

async fn delete_issue(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, TriageError> {
    state.service.delete_issue(&id)?;
    Ok(Json(json!({ "message": "issue deleted" })).into_response())
}

async fn serve_attachment(
    State(state): State<Arc<AppState>>,
    Path((id, path)): Path<(String, String)>,
) -> Result<Response, TriageError> {
    let resolved = state.service.store.attachment_path(&id, &path)?;
    let bytes = tokio::fs::read(&resolved).await?;
    let issue = state.service.store.load(&id)?;
    let mime = issue
        .attachments
        .iter()
        .find(|attachment| attachment.path == path)
        .map(|attachment| attachment.mime_type.clone())
        .filter(|mime| !mime.is_empty())
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let header = HeaderValue::from_str(&mime)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    Ok((
        [(HeaderName::from_static("content-type"), header)],
        bytes,
    )
        .into_response())
}

async fn conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, TriageError> {
    let entries = state.service.conversation(&id)?;
    Ok(Json(entries).into_response())
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
    limit: Option<usize>,
}

async fn search_issues(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Response, TriageError> {
    let issues = state
        .service
        .store
        .search(&query.q, query.limit.unwrap_or(50))?;
    Ok(Json(issues).into_response())
}

// ---- investigations ----

#[derive(Debug, Deserialize)]
struct TriggerBody {
    issue_id: String,
    agent_id: Option<String>,
    auto_resolve: Option<bool>,
    #[serde(default)]
    force: bool,
}

async fn trigger_investigation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TriggerBody>,
) -> Result<Response, TriageError> {
    state.service.trigger(TriggerRequest {
        issue_id: body.issue_id.clone(),
        agent_id: body.agent_id,
        auto_resolve: body.auto_resolve,
        force: body.force,
    })?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": "investigation started", "issue_id": body.issue_id })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct PreviewBody {
    issue_id: String,
    agent_id: Option<String>,
}

async fn preview_investigation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PreviewBody>,
) -> Result<Response, TriageError> {
    let prompt = state
        .service
        .preview_prompt(&body.issue_id, body.agent_id.as_deref())?;
    Ok(Json(json!({ "issue_id": body.issue_id, "prompt": prompt })).into_response())
}

// ---- reporting ----

async fn stats(State(state): State<Arc<AppState>>) -> Result<Response, TriageError> {
    let stats = report::stats(&state.service.store)?;
    Ok(Json(stats).into_response())
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    #[serde(default = "default_export_format")]
    format: String,
}

fn default_export_format() -> String {
    "json".to_string()
}

async fn export(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, TriageError> {
    let (mime, body) = report::export(&state.service.store, &query.format)?;
    let header = HeaderValue::from_str(&mime)
        .unwrap_or_else(|_| HeaderValue::from_static("text/plain"));
    Ok((
        [(HeaderName::from_static("content-type"), header)],
        body,
    )
        .into_response())
}

// ---- automation ----

async fn get_processor(State(state): State<Arc<AppState>>) -> Response {
    Json(state.processor.state()).into_response()
}

async fn patch_processor(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<ProcessorPatch>,
) -> Result<Response, TriageError> {
    let next = state.processor.update(patch)?;
    Ok(Json(next).into_response())
}

async fn reset_counter(State(state): State<Arc<AppState>>) -> Response {
    Json(state.processor.reset_counter()).into_response()
}

async fn rate_limit_status(
    State(state): State<Arc<AppState>>,
) -> Result<Response, TriageError> {
    let status = state.service.ratelimit.status()?;
    Ok(Json(status).into_response())
}

async fn running_processes(State(state): State<Arc<AppState>>) -> Response {
    Json(state.service.registry.running_processes()).into_response()
}

async fn cancel_process(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, TriageError> {
    if !state.service.stop_running_process(&id) {
        return Err(TriageError::not_found(format!(
            "no running investigation for issue {id}"
        )));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": "cancellation requested", "issue_id": id })),
    )
        .into_response())
}
