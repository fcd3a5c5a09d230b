//! Operator API, served on its own listener behind a bearer key.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn setup_admin_router(state: AppState) -> Router {
    let api_key: Arc<str> = Arc::from(state.config.admin.api_key.as_str());
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/metrics", get(get_metrics))
        .route("/admin/metrics/reset", post(reset_metrics))
        .route("/admin/headers/debug", get(get_header_debug).delete(clear_header_debug))
        .layer(middleware::from_fn_with_state(api_key, admin_auth_middleware))
        .with_state(state)
}
