//! Request accounting: counts, latency, and error codes per response.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::Request,
    middleware::Next,
    response::Response,
};

use crate::backpressure::rate_limit::{TenantContext, FALLBACK_TENANT};
use crate::http::response::ErrorCode;
use crate::observability::metrics::{MetricsCollector, UNMATCHED_ROUTE};

pub async fn metrics_middleware(
    State(metrics): State<Arc<MetricsCollector>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    // Unrouted paths are arbitrary client input; keep them out of labels.
    let path = match request.extensions().get::<MatchedPath>() {
        Some(_) => request.uri().path().to_string(),
        None => UNMATCHED_ROUTE.to_string(),
    };

    let response = next.run(request).await;

    let tenant = response
        .extensions()
        .get::<TenantContext>()
        .map(|ctx| ctx.tenant.as_str())
        .unwrap_or(FALLBACK_TENANT);
    metrics.record_request(&method, response.status().as_u16(), &path, tenant, start.elapsed());
    if let Some(ErrorCode(code)) = response.extensions().get::<ErrorCode>() {
        metrics.record_error(code);
    }
    response
}
