//! Tenant-scoped rate limiting middleware.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use crate::config::schema::RateLimitConfig;
use crate::http::response::ApiError;
use crate::observability::metrics::MetricsCollector;

pub const X_TENANT_ID: HeaderName = HeaderName::from_static("x-tenant-id");
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Tenant used when nothing else names one.
pub const FALLBACK_TENANT: &str = "default";
pub const DEFAULT_CLASS: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch milliseconds at which the window resets.
    pub reset_at_ms: u64,
}

impl RateLimitDecision {
    /// Whole seconds until reset, rounded up, never negative.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_at_ms.saturating_sub(now_ms).div_ceil(1000)
    }
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limiter unavailable: {0}")]
    Unavailable(String),
}

/// Decides whether a tenant may make one more request of a class.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, tenant: &str, class: &str) -> Result<RateLimitDecision, RateLimitError>;
}

/// Resolved identity, attached to request and response extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant: String,
    pub class: String,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct Window {
    started_ms: u64,
    count: u32,
}

#[derive(Default)]
struct WindowTable {
    windows: HashMap<(String, String), Window>,
    /// Window start at which expired entries were last dropped.
    swept_ms: u64,
}

/// Fixed windows per `(tenant, class)`, aligned to the epoch.
///
/// Tenants come from a client header, so the table only keeps windows that
/// are still current; older ones are dropped on the first request of each
/// new window.
pub struct FixedWindowLimiter {
    table: Mutex<WindowTable>,
    default_limit: u32,
    overrides: HashMap<String, u32>,
    window_ms: u64,
}

impl FixedWindowLimiter {
    pub fn new(default_limit: u32, window_secs: u64) -> Self {
        Self {
            table: Mutex::new(WindowTable::default()),
            default_limit,
            overrides: HashMap::new(),
            window_ms: window_secs.max(1) * 1000,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        let mut limiter = Self::new(config.requests_per_window, config.window_secs);
        limiter.overrides = config.tenants.clone();
        limiter
    }

    pub fn with_override(mut self, tenant: impl Into<String>, limit: u32) -> Self {
        self.overrides.insert(tenant.into(), limit);
        self
    }

    fn limit_for(&self, tenant: &str) -> u32 {
        self.overrides.get(tenant).copied().unwrap_or(self.default_limit)
    }

    fn decide(&self, tenant: &str, class: &str, now: u64) -> RateLimitDecision {
        let limit = self.limit_for(tenant);
        let started_ms = now - now % self.window_ms;

        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if table.swept_ms < started_ms {
            table.windows.retain(|_, w| w.started_ms >= started_ms);
            table.swept_ms = started_ms;
        }
        let window = table
            .windows
            .entry((tenant.to_string(), class.to_string()))
            .or_insert(Window { started_ms, count: 0 });
        if window.started_ms != started_ms {
            *window = Window { started_ms, count: 0 };
        }

        let allowed = window.count < limit;
        if allowed {
            window.count += 1;
        }
        RateLimitDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(window.count),
            reset_at_ms: started_ms + self.window_ms,
        }
    }

    /// Number of `(tenant, class)` windows currently held.
    pub fn tracked_windows(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).windows.len()
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn check(&self, tenant: &str, class: &str) -> Result<RateLimitDecision, RateLimitError> {
        Ok(self.decide(tenant, class, now_ms()))
    }
}

/// Middleware state: tenant resolution, classification, and the limiter.
pub struct TenantRateLimiter {
    /// When off, tenants are still resolved for attribution.
    enabled: bool,
    limiter: Arc<dyn RateLimiter>,
    default_tenant: String,
    /// Longest prefix first.
    classes: Vec<(String, String)>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl TenantRateLimiter {
    pub fn new(limiter: Arc<dyn RateLimiter>, config: &RateLimitConfig) -> Self {
        let mut classes: Vec<(String, String)> = config
            .classes
            .iter()
            .map(|rule| (rule.path_prefix.clone(), rule.class.clone()))
            .collect();
        classes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Self {
            enabled: config.enabled,
            limiter,
            default_tenant: config.default_tenant.trim().to_string(),
            classes,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// `X-Tenant-ID`, then the configured default, then the fallback.
    pub fn resolve_tenant(&self, headers: &HeaderMap) -> String {
        headers
            .get(X_TENANT_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or_else(|| (!self.default_tenant.is_empty()).then(|| self.default_tenant.clone()))
            .unwrap_or_else(|| FALLBACK_TENANT.to_string())
    }

    pub fn classify(&self, path: &str) -> &str {
        self.classes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, class)| class.as_str())
            .unwrap_or(DEFAULT_CLASS)
    }
}

fn apply_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at_ms));
}

fn rejection(tenant: &str, decision: &RateLimitDecision) -> Response {
    let retry_after = decision.retry_after_secs(now_ms());
    let reset_at = DateTime::<Utc>::from_timestamp_millis(decision.reset_at_ms as i64)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default();

    let mut response = ApiError::new(
        StatusCode::TOO_MANY_REQUESTS,
        "RATE_LIMIT_EXCEEDED",
        format!("rate limit exceeded for tenant {tenant}"),
    )
    .with_detail("retryAfter", retry_after)
    .with_detail("limit", decision.limit)
    .with_detail("resetAt", reset_at)
    .with_retry_after(retry_after)
    .into_response();
    apply_headers(response.headers_mut(), decision);
    response
}

/// Middleware function for tenant rate limiting.
pub async fn rate_limit_middleware(
    State(state): State<Arc<TenantRateLimiter>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let tenant = state.resolve_tenant(request.headers());
    let class = state.classify(request.uri().path()).to_string();
    let context = TenantContext {
        tenant: tenant.clone(),
        class: class.clone(),
    };
    request.extensions_mut().insert(context.clone());

    if !state.enabled {
        let mut response = next.run(request).await;
        response.extensions_mut().insert(context);
        return response;
    }

    let decision = match state.limiter.check(&tenant, &class).await {
        Ok(decision) => Some(decision),
        Err(e) => {
            tracing::warn!(tenant = %tenant, class = %class, error = %e, "Rate limiter failed, allowing request");
            None
        }
    };

    if let Some(decision) = decision.filter(|d| !d.allowed) {
        tracing::warn!(tenant = %tenant, class = %class, limit = decision.limit, "Rate limit exceeded");
        if let Some(metrics) = &state.metrics {
            metrics.record_admission("rate_limited");
        }
        let mut response = rejection(&tenant, &decision);
        response.extensions_mut().insert(context);
        return response;
    }

    let mut response = next.run(request).await;
    if let Some(decision) = decision {
        apply_headers(response.headers_mut(), &decision);
    }
    response.extensions_mut().insert(context);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ResourceClassRule;

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            default_tenant: "acme".into(),
            classes: vec![
                ResourceClassRule {
                    path_prefix: "/jobs".into(),
                    class: "jobs".into(),
                },
                ResourceClassRule {
                    path_prefix: "/jobs/".into(),
                    class: "job-detail".into(),
                },
            ],
            ..RateLimitConfig::default()
        }
    }

    #[test]
    fn window_counts_and_resets() {
        let limiter = FixedWindowLimiter::new(2, 60).with_override("vip", 3);
        let t0 = 120_000;

        assert!(limiter.decide("a", "c", t0).allowed);
        let second = limiter.decide("a", "c", t0 + 1);
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);
        let third = limiter.decide("a", "c", t0 + 2);
        assert!(!third.allowed);
        assert_eq!(third.reset_at_ms, 180_000);

        // Separate budget per class and per tenant override.
        assert!(limiter.decide("a", "other", t0).allowed);
        assert_eq!(limiter.decide("vip", "c", t0).limit, 3);

        assert!(limiter.decide("a", "c", 180_000).allowed);
    }

    #[test]
    fn expired_windows_are_dropped() {
        let limiter = FixedWindowLimiter::new(1, 1);
        for i in 0..10_000u64 {
            limiter.decide(&format!("tenant-{i}"), "c", i * 1_000);
        }
        assert_eq!(limiter.tracked_windows(), 1);

        // Tenants sharing the current window are all kept.
        let now = 20_000_000;
        limiter.decide("a", "c", now);
        limiter.decide("b", "c", now + 10);
        assert_eq!(limiter.tracked_windows(), 2);
        assert!(!limiter.decide("a", "c", now + 20).allowed);
    }

    #[test]
    fn retry_after_rounds_up() {
        let decision = RateLimitDecision {
            allowed: false,
            limit: 1,
            remaining: 0,
            reset_at_ms: 10_001,
        };
        assert_eq!(decision.retry_after_secs(9_000), 2);
        assert_eq!(decision.retry_after_secs(10_001), 0);
        assert_eq!(decision.retry_after_secs(20_000), 0);
    }

    #[test]
    fn tenant_resolution_order() {
        let limiter = TenantRateLimiter::new(Arc::new(FixedWindowLimiter::new(1, 1)), &config());
        let mut headers = HeaderMap::new();
        assert_eq!(limiter.resolve_tenant(&headers), "acme");
        headers.insert(X_TENANT_ID, HeaderValue::from_static("globex"));
        assert_eq!(limiter.resolve_tenant(&headers), "globex");

        let fallback = TenantRateLimiter::new(
            Arc::new(FixedWindowLimiter::new(1, 1)),
            &RateLimitConfig {
                default_tenant: String::new(),
                ..RateLimitConfig::default()
            },
        );
        assert_eq!(fallback.resolve_tenant(&HeaderMap::new()), FALLBACK_TENANT);
    }

    #[test]
    fn longest_prefix_class() {
        let limiter = TenantRateLimiter::new(Arc::new(FixedWindowLimiter::new(1, 1)), &config());
        assert_eq!(limiter.classify("/jobs/123"), "job-detail");
        assert_eq!(limiter.classify("/jobs"), "jobs");
        assert_eq!(limiter.classify("/events"), DEFAULT_CLASS);
    }

    struct Deny {
        reset_in_ms: u64,
    }

    #[async_trait]
    impl RateLimiter for Deny {
        async fn check(&self, _: &str, _: &str) -> Result<RateLimitDecision, RateLimitError> {
            Ok(RateLimitDecision {
                allowed: false,
                limit: 5,
                remaining: 0,
                reset_at_ms: now_ms() + self.reset_in_ms,
            })
        }
    }

    struct Broken;

    #[async_trait]
    impl RateLimiter for Broken {
        async fn check(&self, _: &str, _: &str) -> Result<RateLimitDecision, RateLimitError> {
            Err(RateLimitError::Unavailable("redis down".into()))
        }
    }

    fn app(limiter: Arc<dyn RateLimiter>) -> axum::Router {
        let state = Arc::new(TenantRateLimiter::new(limiter, &config()));
        axum::Router::new()
            .route("/jobs", axum::routing::post(|| async { "queued" }))
            .layer(axum::middleware::from_fn_with_state(state, rate_limit_middleware))
    }

    fn post_jobs() -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/jobs")
            .header("x-tenant-id", "globex")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn denied_request_gets_429_with_retry_guidance() {
        use tower::ServiceExt;

        let response = app(Arc::new(Deny { reset_in_ms: 2_500 })).oneshot(post_jobs()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = response.headers()["retry-after"].to_str().unwrap().parse().unwrap();
        assert!((2..=3).contains(&retry_after));
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "5");
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "0");
        assert_eq!(
            response.extensions().get::<TenantContext>().map(|c| c.tenant.as_str()),
            Some("globex")
        );

        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["limit"], 5);
        assert_eq!(body["retryAfter"], retry_after);
        assert!(body["resetAt"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn limiter_failure_fails_open() {
        use tower::ServiceExt;

        let response = app(Arc::new(Broken)).oneshot(post_jobs()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(X_RATELIMIT_LIMIT));
    }

    #[tokio::test]
    async fn allowed_request_carries_headers() {
        use tower::ServiceExt;

        let response = app(Arc::new(FixedWindowLimiter::new(10, 60)))
            .oneshot(post_jobs())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "9");
        assert!(response.headers().contains_key(X_RATELIMIT_RESET));
    }
}
