//! Shared API error type: RFC 9457 `application/problem+json` bodies with
//! stable machine `code` fields (§7).

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::streams::StoreError;
use crate::subscriptions::SubscriptionError;
use crate::subscriptions::token::TokenError;

#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub detail: String,
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, detail: impl Into<String>) -> Self {
        Self { status, code, detail: detail.into(), retry_after_secs: None }
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    pub fn bad_request(code: &'static str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", detail)
    }

    pub fn conflict(code: &'static str, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", detail)
    }
}

#[derive(Debug, Serialize)]
struct ProblemBody {
    #[serde(rename = "type")]
    type_: String,
    title: String,
    status: u16,
    code: String,
    detail: String,
    instance: String,
}

/// Render with the request path as the problem's `instance`. Handlers call
/// this from an `axum::extract::OriginalUri`-derived string, or pass `""`
/// when no request path is in scope (e.g. background-task errors).
pub fn into_response_for_path(err: ApiError, instance: &str) -> Response {
    let slug = err.code.to_ascii_lowercase().replace('_', "-");
    let body = ProblemBody {
        type_: format!("/errors/{slug}"),
        title: err.status.canonical_reason().unwrap_or("Error").to_string(),
        status: err.status.as_u16(),
        code: err.code.to_string(),
        detail: err.detail.clone(),
        instance: instance.to_string(),
    };

    let mut response = (err.status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/problem+json"),
    );
    if let Some(secs) = err.retry_after_secs {
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        into_response_for_path(self, "")
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => ApiError::not_found(e.to_string()),
            StoreError::StreamConflict => ApiError::conflict("STREAM_CONFLICT", e.to_string()),
            StoreError::ContentTypeMismatch { .. } => ApiError::conflict("CONTENT_TYPE_MISMATCH", e.to_string()),
            StoreError::SequenceConflict(_) => ApiError::conflict("SEQUENCE_CONFLICT", e.to_string()),
            StoreError::InvalidOffset(_) => ApiError::bad_request("INVALID_OFFSET", e.to_string()),
            StoreError::EmptyBody => ApiError::bad_request("EMPTY_BODY", e.to_string()),
            StoreError::TtlConflict => ApiError::bad_request("BAD_REQUEST", e.to_string()),
            StoreError::InvalidJson(_) => ApiError::bad_request("INVALID_JSON", e.to_string()),
            StoreError::EmptyArrayNotAllowed => ApiError::bad_request("EMPTY_ARRAY", e.to_string()),
            StoreError::StreamClosed => ApiError::new(StatusCode::GONE, "STREAM_CLOSED", e.to_string()),
            StoreError::OffsetExpired(_) => ApiError::new(StatusCode::GONE, "OFFSET_EXPIRED", e.to_string()),
        }
    }
}

impl From<SubscriptionError> for ApiError {
    fn from(e: SubscriptionError) -> Self {
        match e {
            SubscriptionError::NotFound | SubscriptionError::ConsumerNotFound => ApiError::not_found(e.to_string()),
            SubscriptionError::Conflict => ApiError::conflict("STREAM_CONFLICT", e.to_string()),
            SubscriptionError::AlreadyClaimed => ApiError::conflict("ALREADY_CLAIMED", e.to_string()),
            SubscriptionError::StaleEpoch { .. } => ApiError::conflict("STALE_EPOCH", e.to_string()),
            SubscriptionError::ConsumerGone => ApiError::new(StatusCode::GONE, "CONSUMER_GONE", e.to_string()),
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Invalid => ApiError::new(StatusCode::UNAUTHORIZED, "TOKEN_INVALID", e.to_string()),
            TokenError::Expired => ApiError::new(StatusCode::UNAUTHORIZED, "TOKEN_EXPIRED", e.to_string()),
        }
    }
}
