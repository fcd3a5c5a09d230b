use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::headers::state::DebugEntry;
use crate::headers::EnforcementMode;
use crate::health::RoleHealth;
use crate::http::response::ApiError;
use crate::http::server::AppState;
use crate::jobs::QueueStats;
use crate::observability::metrics::MetricsSnapshot;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub jobs: QueueStats,
    pub event_clients: usize,
    pub event_runs: usize,
    pub header_mode: EnforcementMode,
    pub header_policies: usize,
    pub startup_in_flight: usize,
    pub startup_queued: usize,
    pub dependencies: Vec<RoleHealth>,
}

#[derive(Debug, Deserialize)]
pub struct DebugQuery {
    pub limit: Option<usize>,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    let ready = state.startup.readiness().is_ready();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: if ready { "operational" } else { "initializing" },
        uptime_secs: state.started_at.elapsed().as_secs(),
        jobs: state.queue.stats(),
        event_clients: state.events.client_count(),
        event_runs: state.events.run_count(),
        header_mode: state.headers.mode(),
        header_policies: state.headers.registry().len(),
        startup_in_flight: state.startup.in_flight(),
        startup_queued: state.startup.queued(),
        dependencies: state.dependencies.roles(),
    })
}

pub async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

pub async fn reset_metrics(State(state): State<AppState>) -> StatusCode {
    state.metrics.reset();
    tracing::info!("Metrics reset via admin API");
    StatusCode::NO_CONTENT
}

/// Most recent header decisions, newest first.
pub async fn get_header_debug(
    State(state): State<AppState>,
    query: Result<Query<DebugQuery>, QueryRejection>,
) -> Result<Json<Vec<DebugEntry>>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    Ok(Json(state.headers.debug_ring().snapshot(query.limit)))
}

pub async fn clear_header_debug(State(state): State<AppState>) -> StatusCode {
    state.headers.debug_ring().clear();
    StatusCode::NO_CONTENT
}
