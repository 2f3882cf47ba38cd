use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::api::response::ApiError;
use crate::codec::gzip::{self, ContentEncoding};
use crate::statistics::{Counter, StatisticsSink};
use crate::AppState;

/// PUT/POST `/_missing`: echo back the listed paths that are not stored here.
///
/// The body is a newline-separated path list, optionally gzip encoded. Lines are
/// returned byte for byte, in order, including their terminators.
pub async fn missing_objects(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if method == Method::POST {
        state.statistics.increment(Counter::PostRequests);
    } else {
        state.statistics.increment(Counter::PutRequests);
    }

    let encoding = ContentEncoding::parse(
        headers
            .get(header::CONTENT_ENCODING)
            .map(|v| v.to_str().unwrap_or("invalid")),
    )
    .map_err(|e| ApiError::unsupported_encoding(&e))?;

    let list = match encoding {
        ContentEncoding::Identity => body.to_vec(),
        ContentEncoding::Gzip => gzip::decompress(&body)
            .map_err(|e| ApiError::bad_request(format!("Failed to decompress path list: {e}")))?,
    };

    let store = state.store.clone();
    let missing = tokio::task::spawn_blocking(move || store.missing_lines(&list))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    state.statistics.increment(Counter::PutRequestsMissingFileChecks);

    let accepts_gzip = gzip::accepts_gzip(
        headers
            .get(header::ACCEPT_ENCODING)
            .and_then(|v| v.to_str().ok()),
    );

    let mut response = if accepts_gzip {
        let compressed = gzip::compress(&missing)
            .map_err(|e| ApiError::internal(format!("Failed to compress response: {e}")))?;
        let mut response = (StatusCode::OK, compressed).into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        response
    } else {
        (StatusCode::OK, missing).into_response()
    };
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    Ok(response)
}
