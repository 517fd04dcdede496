use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::ValidatedJson;
use crate::queue::{ExtractionJob, JobStatus};
use crate::security::{CorrelationId, OrgContext};
use crate::shared::error::ApiError;
use crate::shared::models::ChatMessage;
use crate::shared::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AsyncExtractRequest {
    pub message: String,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AsyncExtractOrderRequest {
    pub messages: Vec<ChatMessage>,
    pub webhook_url: Option<String>,
}

fn accepted(job_id: String) -> (StatusCode, Json<Value>) {
    let status_url = format!("/api/jobs/{job_id}");
    (
        StatusCode::ACCEPTED,
        Json(json!({ "jobId": job_id, "statusUrl": status_url })),
    )
}

/// Enqueues a single-message extraction and returns a job handle. The
/// request's correlation id rides along in the payload.
pub async fn enqueue_single(
    org: OrgContext,
    Extension(correlation): Extension<CorrelationId>,
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<AsyncExtractRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::Validation("message must not be empty".into()));
    }

    let job = ExtractionJob::SingleMessage {
        org_id: org.org_id,
        correlation_id: correlation.into_inner(),
        message: request.message,
        webhook_url: request.webhook_url,
    };
    let job_id = state.extraction_queue.enqueue(&job, job.priority()).await?;
    Ok(accepted(job_id))
}

pub async fn enqueue_chat(
    org: OrgContext,
    Extension(correlation): Extension<CorrelationId>,
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<AsyncExtractOrderRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if request.messages.is_empty() {
        return Err(ApiError::Validation("messages must not be empty".into()));
    }

    let job = ExtractionJob::ChatLog {
        org_id: org.org_id,
        correlation_id: correlation.into_inner(),
        messages: request.messages,
        webhook_url: request.webhook_url,
    };
    let job_id = state.extraction_queue.enqueue(&job, job.priority()).await?;
    Ok(accepted(job_id))
}

/// Job state for polling. Queue-path failures surface here and through the
/// failure webhook, never on the enqueue response.
pub async fn get_job(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<JobStatus>, ApiError> {
    let status = state
        .extraction_queue
        .get_job(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Job not found".into()))?;
    Ok(Json(status))
}

pub async fn queue_health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let extraction = state.extraction_queue.counts().await?;
    let webhook = state.webhook_queue.counts().await?;
    Ok(Json(json!({
        "extraction": extraction,
        "webhook": webhook,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DlqParams {
    pub start: Option<isize>,
    pub end: Option<isize>,
}

/// Failed extraction jobs, newest first.
pub async fn list_dlq(
    _org: OrgContext,
    Query(params): Query<DlqParams>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<JobStatus>>, ApiError> {
    let start = params.start.unwrap_or(0).max(0);
    let end = params.end.unwrap_or(start + 49);
    let jobs = state.extraction_queue.list_failed(start, end).await?;
    Ok(Json(jobs))
}

/// Re-schedules one dead job in place.
pub async fn retry_dlq_job(
    _org: OrgContext,
    Path(job_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let retried = state.extraction_queue.retry_failed(&job_id).await?;
    if !retried {
        return Err(ApiError::NotFound("Job not found in dead-letter queue".into()));
    }
    Ok(Json(json!({ "retried": true, "jobId": job_id })))
}

pub async fn retry_all_dlq(
    _org: OrgContext,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let retried = state.extraction_queue.retry_all_failed().await?;
    Ok(Json(json!({ "retried": retried })))
}
