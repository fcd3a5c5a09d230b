//! Startup guard: hold or shed requests until infrastructure is ready.
//!
//! # Design Decisions
//! - Readiness is a `watch` channel; once ready the guard is a pass-through
//! - A request may wait only while both `in_flight < max_concurrent` and
//!   `queued < queue_limit`; anything beyond is shed with 503
//! - Waiting requests hold a permit that releases `in_flight` exactly once,
//!   when the response is produced or the request future is dropped

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tokio::sync::watch;

use crate::config::schema::StartupConfig;
use crate::http::response::ErrorCode;
use crate::observability::metrics::MetricsCollector;

pub const STARTUP_SCHEMA: &str = "kb.startup/1";

/// Shared readiness flag for downstream infrastructure.
#[derive(Debug, Clone)]
pub struct Readiness {
    tx: Arc<watch::Sender<bool>>,
}

impl Readiness {
    pub fn new(ready: bool) -> Self {
        let (tx, _) = watch::channel(ready);
        Self { tx: Arc::new(tx) }
    }

    pub fn mark_ready(&self) {
        self.tx.send_if_modified(|ready| !std::mem::replace(ready, true));
    }

    pub fn mark_not_ready(&self) {
        self.tx.send_if_modified(|ready| std::mem::replace(ready, false));
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once ready.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only errors if it is gone.
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StartupStatus {
    Initializing,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupBody {
    pub schema: &'static str,
    pub status: StartupStatus,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Ready; no accounting.
    Pass,
    /// Must wait for readiness.
    Wait,
    /// Shed immediately.
    Reject,
}

pub struct StartupGuard {
    config: StartupConfig,
    readiness: Readiness,
    in_flight: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
    metrics: Option<Arc<MetricsCollector>>,
}

/// Decrements a gauge once, on drop.
struct GaugePermit {
    gauge: Arc<AtomicUsize>,
}

impl GaugePermit {
    fn acquire(gauge: &Arc<AtomicUsize>) -> Self {
        gauge.fetch_add(1, Ordering::AcqRel);
        Self { gauge: gauge.clone() }
    }
}

impl Drop for GaugePermit {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::AcqRel);
    }
}

impl StartupGuard {
    pub fn new(config: StartupConfig, readiness: Readiness) -> Self {
        Self {
            config,
            readiness,
            in_flight: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    fn admit(&self) -> Admission {
        if !self.config.enabled || self.readiness.is_ready() {
            return Admission::Pass;
        }
        if self.in_flight() < self.config.max_concurrent && self.queued() < self.config.queue_limit {
            Admission::Wait
        } else {
            Admission::Reject
        }
    }

    fn record(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_admission(outcome);
        }
    }

    fn respond(&self, status: StatusCode, body: StartupBody, code: &'static str) -> Response {
        let mut response = (status, Json(body)).into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(self.config.retry_after_secs));
        response.extensions_mut().insert(ErrorCode(code));
        response
    }

    fn unavailable(&self) -> Response {
        self.respond(
            StatusCode::SERVICE_UNAVAILABLE,
            StartupBody {
                schema: STARTUP_SCHEMA,
                status: StartupStatus::Initializing,
                reason: "gateway is starting; startup queue is full".into(),
                max_concurrent: Some(self.config.max_concurrent),
                queue_limit: Some(self.config.queue_limit),
                timeout_ms: None,
            },
            "E_STARTUP_UNAVAILABLE",
        )
    }

    fn timed_out(&self) -> Response {
        self.respond(
            StatusCode::GATEWAY_TIMEOUT,
            StartupBody {
                schema: STARTUP_SCHEMA,
                status: StartupStatus::Timeout,
                reason: "infrastructure did not become ready in time".into(),
                max_concurrent: None,
                queue_limit: None,
                timeout_ms: Some(self.config.timeout_ms),
            },
            "E_STARTUP_TIMEOUT",
        )
    }
}

/// Middleware function for the startup guard.
pub async fn startup_guard_middleware(
    State(guard): State<Arc<StartupGuard>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match guard.admit() {
        Admission::Pass => next.run(request).await,
        Admission::Reject => {
            tracing::warn!(
                in_flight = guard.in_flight(),
                queued = guard.queued(),
                "Startup queue full, shedding request"
            );
            guard.record("startup_rejected");
            guard.unavailable()
        }
        Admission::Wait => {
            let _in_flight = GaugePermit::acquire(&guard.in_flight);
            let ready = {
                let _queued = GaugePermit::acquire(&guard.queued);
                let timeout = Duration::from_millis(guard.config.timeout_ms);
                tokio::time::timeout(timeout, guard.readiness.wait()).await.is_ok()
            };

            if !ready {
                tracing::warn!(timeout_ms = guard.config.timeout_ms, "Request timed out waiting for readiness");
                guard.record("startup_timeout");
                return guard.timed_out();
            }
            guard.record("startup_released");
            next.run(request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use tower::ServiceExt;

    fn app(guard: Arc<StartupGuard>) -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(guard, startup_guard_middleware))
    }

    fn config(max_concurrent: usize, queue_limit: usize, timeout_ms: u64) -> StartupConfig {
        StartupConfig {
            enabled: true,
            max_concurrent,
            queue_limit,
            timeout_ms,
            retry_after_secs: 2,
        }
    }

    fn request() -> Request<Body> {
        Request::builder().uri("/").body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn zero_queue_limit_sheds_everything_until_ready() {
        let readiness = Readiness::new(false);
        let guard = Arc::new(StartupGuard::new(config(8, 0, 1_000), readiness.clone()));

        let response = app(guard.clone()).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["schema"], "kb.startup/1");
        assert_eq!(body["status"], "initializing");
        assert_eq!(body["queueLimit"], 0);

        readiness.mark_ready();
        let response = app(guard).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn waiting_request_times_out_with_504() {
        let guard = Arc::new(StartupGuard::new(config(4, 4, 30), Readiness::new(false)));
        let response = app(guard.clone()).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
        assert_eq!(guard.in_flight(), 0);
        assert_eq!(guard.queued(), 0);
    }

    #[tokio::test]
    async fn waiting_request_is_released_on_ready() {
        let readiness = Readiness::new(false);
        let guard = Arc::new(StartupGuard::new(config(4, 4, 5_000), readiness.clone()));

        let pending = tokio::spawn(app(guard.clone()).oneshot(request()));
        while guard.queued() == 0 {
            tokio::task::yield_now().await;
        }
        readiness.mark_ready();

        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(guard.in_flight(), 0);
    }

    #[tokio::test]
    async fn disabled_guard_passes_through() {
        let mut cfg = config(0, 0, 10);
        cfg.enabled = false;
        let guard = Arc::new(StartupGuard::new(cfg, Readiness::new(false)));
        let response = app(guard).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
