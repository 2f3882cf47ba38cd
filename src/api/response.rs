use axum::extract::FromRequestParts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;

use crate::store::StoreError;

// ============================================================================
// Plain-text responses
// ============================================================================

/// A short `text/plain` body, newline terminated, as every endpoint speaks.
pub fn plain_text(status: StatusCode, message: impl Into<String>) -> Response {
    let mut body = message.into();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    let mut response = (status, body).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

// ============================================================================
// Unified error type for handlers
// ============================================================================

/// A handler failure: a client error (4xx) or a server error (5xx).
#[derive(Debug)]
pub enum ApiError {
    Fail(StatusCode, String),
    Error(StatusCode, String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Fail(code, msg) => plain_text(code, msg),
            ApiError::Error(code, msg) => {
                tracing::error!(status = code.as_u16(), error = %msg, "Request failed");
                plain_text(code, msg)
            }
        }
    }
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::BAD_REQUEST, message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::NOT_FOUND, message.into())
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::PAYLOAD_TOO_LARGE, message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::CONFLICT, message.into())
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::UNPROCESSABLE_ENTITY, message.into())
    }

    pub fn unsupported_encoding(encoding: &str) -> Self {
        ApiError::Fail(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("Unsupported content encoding: {encoding}"),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Error(StatusCode::INTERNAL_SERVER_ERROR, message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Fail(code, _) | ApiError::Error(code, _) => *code,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::WrongLocation(_) => ApiError::unprocessable(e.to_string()),
            StoreError::SlotConflict(_) => ApiError::conflict(e.to_string()),
            StoreError::UnsupportedEncoding(encoding) => ApiError::unsupported_encoding(&encoding),
            StoreError::PayloadTooLarge(_) => ApiError::payload_too_large(e.to_string()),
            StoreError::Decompression(_) | StoreError::Body(_) => ApiError::bad_request(e.to_string()),
            StoreError::InvalidPath(_) => ApiError::bad_request(e.to_string()),
            StoreError::Io(_) => ApiError::internal(e.to_string()),
        }
    }
}

// ============================================================================
// Query extraction
// ============================================================================

/// Drop-in replacement for `axum::extract::Query` that rejects with a plain-text 400.
pub struct AppQuery<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequestParts<S> for AppQuery<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, ApiError> {
        let query = parts.uri.query().unwrap_or_default();
        serde_qs::from_str(query)
            .map(AppQuery)
            .map_err(|e| ApiError::bad_request(format!("Invalid query string: {e}")))
    }
}
