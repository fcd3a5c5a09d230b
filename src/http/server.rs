//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router with job, event, and health handlers
//! - Wire up middleware (tracing, request id, panic boundary, metrics,
//!   admission control, header policy)
//! - Serve until the shutdown signal fires
//!
//! # Layer order (outermost first)
//! ```text
//! Trace → SetRequestId → PropagateRequestId → body limit → metrics
//!     → CatchPanic → [startup guard → rate limit → header policy] → handler
//! ```
//! `/health` sits outside the bracketed gates so probes always answer.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::{
    catch_panic::CatchPanicLayer,
    limit::RequestBodyLimitLayer,
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::backpressure::{rate_limit_middleware, startup_guard_middleware, StartupGuard, TenantRateLimiter};
use crate::config::schema::GatewayConfig;
use crate::events::EventBridge;
use crate::headers::middleware::header_policy_middleware;
use crate::headers::transform::TransformCatalog;
use crate::headers::HeaderPolicyEngine;
use crate::health::DependencyMonitor;
use crate::http::jobs;
use crate::http::middleware::metrics_middleware;
use crate::http::request::{UuidRequestId, X_REQUEST_ID};
use crate::http::response::ApiError;
use crate::jobs::queue::{JobQueue, QueueStats};
use crate::lifecycle::Shutdown;
use crate::observability::metrics::MetricsCollector;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub queue: Arc<JobQueue>,
    pub events: Arc<EventBridge>,
    pub metrics: Arc<MetricsCollector>,
    pub headers: Arc<HeaderPolicyEngine>,
    pub transforms: Arc<TransformCatalog>,
    pub startup: Arc<StartupGuard>,
    pub rate_limiter: Arc<TenantRateLimiter>,
    pub dependencies: Arc<DependencyMonitor>,
    pub keep_alive: Duration,
    pub started_at: Instant,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub ready: bool,
    pub jobs: QueueStats,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let ready = state.startup.readiness().is_ready();
    Json(HealthResponse {
        status: if ready { "ok" } else { "initializing" },
        ready,
        jobs: state.queue.stats(),
    })
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = %detail, "Request handler panicked");
    ApiError::internal().into_response()
}

/// Build the Axum router with all middleware layers.
pub fn build_router(state: AppState) -> Router {
    let gated = Router::new()
        .route("/jobs", post(jobs::enqueue_job).get(jobs::list_jobs))
        .route("/jobs/{id}", get(jobs::get_job))
        .route("/jobs/{id}/cancel", post(jobs::cancel_job))
        .route("/jobs/{id}/events", get(jobs::job_events))
        .route("/events", get(jobs::events))
        .with_state(state.clone())
        .layer(from_fn_with_state(state.headers.clone(), header_policy_middleware))
        .layer(from_fn_with_state(state.rate_limiter.clone(), rate_limit_middleware))
        .layer(from_fn_with_state(state.startup.clone(), startup_guard_middleware));

    Router::new()
        .route("/health", get(health))
        .with_state(state.clone())
        .merge(gated)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(from_fn_with_state(state.metrics.clone(), metrics_middleware))
        .layer(RequestBodyLimitLayer::new(state.config.listener.max_body_bytes))
        .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
        .layer(SetRequestIdLayer::new(X_REQUEST_ID, UuidRequestId))
        .layer(TraceLayer::new_for_http())
}

/// HTTP server for the gateway.
pub struct GatewayServer {
    router: Router,
}

impl GatewayServer {
    pub fn new(state: AppState) -> Self {
        Self {
            router: build_router(state),
        }
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server, accepting connections until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
