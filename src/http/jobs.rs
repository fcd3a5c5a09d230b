//! Job control and event stream routes.

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    http::{HeaderMap, HeaderName, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::sse::{self, SseStream};
use crate::http::response::ApiError;
use crate::http::server::AppState;
use crate::jobs::types::{
    EnqueueOptions, EnqueueReceipt, JobFilter, JobId, JobKind, JobMetadata, JobPage, JobStatus, Priority, RunId,
};

pub const IDEMPOTENCY_KEY: HeaderName = HeaderName::from_static("idempotency-key");
pub const KB_MOCK: HeaderName = HeaderName::from_static("kb-mock");

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub kind: JobKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: Priority,
    pub max_retries: Option<u32>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub job_id: JobId,
    pub cancelled: bool,
    pub status: JobStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    pub run_id: Option<RunId>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// `KB-Mock: true` or `KB-Mock: 1`.
pub fn mock_requested(headers: &HeaderMap) -> bool {
    header_str(headers, &KB_MOCK).is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid job id: {raw}")))
}

pub async fn enqueue_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<EnqueueRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let options = EnqueueOptions {
        priority: body.priority,
        idempotency_key: header_str(&headers, &IDEMPOTENCY_KEY).map(str::to_string),
        max_retries: body.max_retries,
        timeout_ms: body.timeout_ms,
        mock: mock_requested(&headers),
    };
    let receipt: EnqueueReceipt = state.queue.enqueue(body.kind, body.payload, options)?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    filter: Result<Query<JobFilter>, QueryRejection>,
) -> Result<Json<JobPage>, ApiError> {
    let Query(filter) = filter.map_err(|e| ApiError::bad_request(e.body_text()))?;
    Ok(Json(state.queue.list(&filter)?))
}

pub async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<JobMetadata>, ApiError> {
    let job_id = parse_job_id(&id)?;
    state
        .queue
        .get(job_id)
        .map(Json)
        .ok_or_else(|| ApiError::job_not_found(job_id))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let job_id = parse_job_id(&id)?;
    let cancelled = state.queue.cancel(job_id);
    let job = state.queue.get(job_id).ok_or_else(|| ApiError::job_not_found(job_id))?;
    Ok(Json(CancelResponse {
        job_id,
        cancelled,
        status: job.status,
    }))
}

/// History for the job's run, then live events.
pub async fn job_events(State(state): State<AppState>, Path(id): Path<String>) -> Result<SseStream, ApiError> {
    let job_id = parse_job_id(&id)?;
    let job = state.queue.get(job_id).ok_or_else(|| ApiError::job_not_found(job_id))?;
    sse::subscribe(state.events.clone(), Some(job.run_id), state.keep_alive).map_err(|e| {
        tracing::warn!(job_id = %job_id, error = %e, "Failed to attach event stream");
        ApiError::internal()
    })
}

/// One run when `runId` is given, otherwise every run.
pub async fn events(
    State(state): State<AppState>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> Result<SseStream, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    sse::subscribe(state.events.clone(), query.run_id, state.keep_alive).map_err(|e| {
        tracing::warn!(error = %e, "Failed to attach event stream");
        ApiError::internal()
    })
}
