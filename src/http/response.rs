//! API error envelope.
//!
//! # Responsibilities
//! - Map subsystem errors onto HTTP status + stable machine-readable code
//! - Render `{error, message, ...details}` JSON bodies
//! - Tag responses with their error code for the metrics layer
//!
//! # Design Decisions
//! - Internal errors never leak their source text to clients
//! - Retry guidance travels as `Retry-After` whenever an error has it

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{Map, Value};

use crate::headers::HeaderPolicyError;
use crate::jobs::queue::QueueError;

/// Error code attached to response extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub &'static str);

#[derive(Debug, Clone)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Map<String, Value>,
    retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: Map::new(),
            retry_after: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "E_BAD_REQUEST", message)
    }

    pub fn job_not_found(id: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::NOT_FOUND, "JOB_NOT_FOUND", format!("job {id} not found"))
    }

    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "E_INTERNAL", "internal server error")
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<HeaderPolicyError> for ApiError {
    fn from(err: HeaderPolicyError) -> Self {
        ApiError::new(err.status(), err.code(), err.to_string()).with_detail("header", err.header())
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(id) => ApiError::job_not_found(id),
            QueueError::InvalidTransition { .. } => {
                ApiError::new(StatusCode::CONFLICT, "E_JOB_STATE", err.to_string())
            }
            QueueError::CursorExpired(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "E_CURSOR_EXPIRED", err.to_string())
            }
            QueueError::Closed => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "E_QUEUE_CLOSED", err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = Map::new();
        body.insert("error".into(), Value::from(self.code));
        body.insert("message".into(), Value::from(self.message));
        body.extend(self.details);

        let mut response = (self.status, Json(Value::Object(body))).into_response();
        if let Some(secs) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response.extensions_mut().insert(ErrorCode(self.code));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn renders_code_and_details() {
        let err: ApiError = HeaderPolicyError::Required {
            header: "x-api-key".into(),
        }
        .into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.extensions().get::<ErrorCode>(),
            Some(&ErrorCode("E_HEADER_REQUIRED"))
        );

        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "E_HEADER_REQUIRED");
        assert_eq!(body["header"], "x-api-key");
    }

    #[test]
    fn retry_after_header() {
        let response = ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "X", "m")
            .with_retry_after(3)
            .into_response();
        assert_eq!(response.headers()[header::RETRY_AFTER], "3");
    }
}
