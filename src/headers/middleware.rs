//! Axum middleware running the header policy engine around a handler.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::headers::engine::{strip_hop_by_hop, HeaderPolicyEngine, RequestInfo};
use crate::http::request::request_id;
use crate::http::response::ApiError;

/// Values of `rateLimitKey` headers, for downstream limiting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitKeys(pub BTreeMap<String, String>);

pub async fn header_policy_middleware(
    State(engine): State<Arc<HeaderPolicyEngine>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(policy) = engine.resolve(request.uri().path()) else {
        strip_hop_by_hop(request.headers_mut());
        let mut response = next.run(request).await;
        let mut state = engine.new_state();
        engine.enforce_outbound(None, response.headers_mut(), &mut state);
        return response;
    };

    let info = RequestInfo {
        request_id: request_id(request.headers()),
        method: request.method().to_string(),
        path: request.uri().path().to_string(),
    };
    let mut state = engine.new_state();

    if let Err(err) = engine.enforce_inbound(&policy, request.headers(), &mut state) {
        tracing::info!(
            plugin = %policy.plugin_id,
            code = err.code(),
            header = %err.header(),
            path = %info.path,
            "Request rejected by header policy"
        );
        engine.finish(&policy.plugin_id, &mut state, info);
        return ApiError::from(err).into_response();
    }

    if engine.mode().is_dry_run() {
        strip_hop_by_hop(request.headers_mut());
    } else {
        *request.headers_mut() = std::mem::take(&mut state.sanitized);
    }
    request
        .extensions_mut()
        .insert(RateLimitKeys(state.rate_limit_keys.clone()));

    let mut response = next.run(request).await;

    engine.enforce_outbound(Some(&policy), response.headers_mut(), &mut state);
    engine.finish(&policy.plugin_id, &mut state, info);
    response
}
