use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Path, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

use crate::api::response::{ApiError, AppQuery};
use crate::codec::gzip::{self, ContentEncoding};
use crate::codec::hash;
use crate::mime;
use crate::statistics::{Counter, StatisticsSink};
use crate::store::{clean_path, Found, StoreError, Stored, UploadRequest, UploadTarget};
use crate::AppState;

/// Form field holding the file in browser uploads.
const UPLOAD_FIELD: &str = "uploaded_file";

/// Stored objects never change, so caches may keep them indefinitely.
const IMMUTABLE: &str = "public, max-age=31536000, immutable";

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Query parameters the object endpoints understand; anything else is ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ObjectParams {
    forward: Option<QueryValue>,
    redirect: Option<QueryValue>,
}

/// A parameter given once or several times. The last occurrence wins.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QueryValue {
    One(String),
    Many(Vec<String>),
}

impl QueryValue {
    fn last(&self) -> Option<&str> {
        match self {
            QueryValue::One(value) => Some(value.as_str()),
            QueryValue::Many(values) => values.last().map(String::as_str),
        }
    }
}

impl ObjectParams {
    /// `forward=0` turns read-forwarding off.
    fn forwarding_allowed(&self) -> bool {
        self.forward.as_ref().and_then(QueryValue::last) != Some("0")
    }

    fn redirect(&self) -> bool {
        self.redirect.as_ref().and_then(QueryValue::last) == Some("1")
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// GET/HEAD a stored object, falling back to peers on a local miss.
pub async fn get_object(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    AppQuery(params): AppQuery<ObjectParams>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state.statistics.increment(Counter::GetRequests);
    let path = clean_path(&path);

    if let Some(found) = state.store.lookup(&path).await? {
        return serve_found(&state, found, &method, &headers).await;
    }

    if params.forwarding_allowed() && hash::is_location_shaped(&path) && state.forwarder.is_enabled() {
        if let Some(response) = state.forwarder.fetch(uri.path(), &headers).await {
            state.statistics.increment(Counter::GetRequestsFoundOnReplica);
            return Ok(response);
        }
    }

    state.statistics.increment(Counter::GetRequestsNotFound);
    Err(ApiError::not_found("Not found"))
}

/// POST a new object under a directory, as a raw body or a browser form.
pub async fn create_object(
    State(state): State<Arc<AppState>>,
    path: Option<Path<String>>,
    AppQuery(params): AppQuery<ObjectParams>,
    request: Request,
) -> Result<Response, ApiError> {
    state.statistics.increment(Counter::PostRequests);
    let path = path.map(|Path(p)| p).unwrap_or_default();

    let redirect = params.redirect();
    let result = match UploadTarget::directory(&path) {
        Ok(target) => receive_upload(&state, target, request).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok((stored, form_redirect)) => {
            if stored.new_object {
                state.statistics.increment(Counter::PostRequestsNewFileStored);
            }
            let status = if redirect || form_redirect {
                StatusCode::SEE_OTHER
            } else {
                StatusCode::CREATED
            };
            Ok(created(status, &stored.location))
        }
        Err(e) => {
            state.statistics.increment(Counter::PostRequestsFailed);
            tracing::warn!(path = %path, error = ?e, "POST failed");
            Err(e)
        }
    }
}

/// PUT an object at an exact location, as replication does.
pub async fn place_object(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    state.statistics.increment(Counter::PutRequests);

    let result = async {
        let target = UploadTarget::exact(&path)?;
        let encoding = content_encoding(request.headers())?;
        let upload = UploadRequest {
            target,
            content_type: declared_type(request.headers()),
            encoding,
        };
        let body = request.into_body().into_data_stream();
        Ok::<_, StoreError>(state.store.store(upload, body).await?)
    }
    .await;

    match result {
        Ok(stored) => {
            if stored.new_object {
                state.statistics.increment(Counter::PutRequestsNewFileStored);
            }
            Ok(created(StatusCode::CREATED, &stored.location))
        }
        Err(e) => {
            state.statistics.increment(Counter::PutRequestsFailed);
            tracing::warn!(path = %path, error = %e, "PUT failed");
            Err(e.into())
        }
    }
}

// ============================================================================
// Upload decoding
// ============================================================================

/// Canonicalise a raw or multipart POST and hand it to the store. Also reports
/// whether the form asked for a redirect.
async fn receive_upload(
    state: &Arc<AppState>,
    target: UploadTarget,
    request: Request,
) -> Result<(Stored, bool), ApiError> {
    let encoding = content_encoding(request.headers())?;
    let declared = declared_type(request.headers());

    if declared.as_deref() != Some("multipart/form-data") {
        let upload = UploadRequest {
            target,
            content_type: declared,
            encoding,
        };
        let body = request.into_body().into_data_stream();
        return Ok((state.store.store(upload, body).await?, false));
    }

    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart data: {e}")))?;

    let mut stored = None;
    let mut redirect = false;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart data: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            UPLOAD_FIELD if stored.is_none() => {
                let upload = UploadRequest {
                    target: target.clone(),
                    content_type: Some(
                        field
                            .content_type()
                            .and_then(mime::media_type)
                            .unwrap_or_else(|| "application/octet-stream".to_string()),
                    ),
                    encoding: ContentEncoding::Identity,
                };
                stored = Some(state.store.store(upload, Box::pin(field)).await?);
            }
            "redirect" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Invalid redirect field: {e}")))?;
                redirect = value.trim() == "1";
            }
            _ => {}
        }
    }

    let stored = stored.ok_or_else(|| ApiError::bad_request(format!("Missing {UPLOAD_FIELD} field")))?;
    Ok((stored, redirect))
}

fn content_encoding(headers: &HeaderMap) -> Result<ContentEncoding, StoreError> {
    let value = headers
        .get(header::CONTENT_ENCODING)
        .map(|v| v.to_str().unwrap_or("invalid"));
    ContentEncoding::parse(value).map_err(StoreError::UnsupportedEncoding)
}

/// Media type of the request body, `application/octet-stream` if absent or unparseable.
fn declared_type(headers: &HeaderMap) -> Option<String> {
    let media_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(mime::media_type)
        .unwrap_or_else(|| "application/octet-stream".to_string());
    Some(media_type)
}

fn created(status: StatusCode, location: &str) -> Response {
    let mut response = status.into_response();
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}

// ============================================================================
// Serving
// ============================================================================

async fn serve_found(
    state: &AppState,
    found: Found,
    method: &Method,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let last_modified = found.modified.map(http_date);

    let send_compressed = found.is_storage_compressed()
        && gzip::accepts_gzip(
            headers
                .get(header::ACCEPT_ENCODING)
                .and_then(|v| v.to_str().ok()),
        );
    let etag = if send_compressed {
        gzip_entity_tag(&found.etag)
    } else {
        found.etag.clone()
    };

    if not_modified(headers, &etag, found.modified) {
        let mut response = StatusCode::NOT_MODIFIED.into_response();
        insert_header(response.headers_mut(), header::ETAG, &etag);
        if let Some(date) = &last_modified {
            insert_header(response.headers_mut(), header::LAST_MODIFIED, date);
        }
        if found.is_storage_compressed() {
            response
                .headers_mut()
                .insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
        }
        return Ok(response);
    }

    let content_type = found
        .extension
        .as_deref()
        .and_then(|ext| state.mime.type_by_extension(ext))
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let body = if method == Method::HEAD {
        Body::empty()
    } else if found.is_storage_compressed() && !send_compressed {
        decompressed_body(found.disk_path.clone())
    } else {
        let file = tokio::fs::File::open(&found.disk_path)
            .await
            .map_err(|e| ApiError::internal(format!("Failed to open stored object: {e}")))?;
        Body::from_stream(ReaderStream::new(file))
    };

    let mut response = Response::new(body);
    let response_headers = response.headers_mut();
    insert_header(response_headers, header::CONTENT_TYPE, &content_type);
    insert_header(response_headers, header::ETAG, &etag);
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(IMMUTABLE));
    if let Some(date) = &last_modified {
        insert_header(response_headers, header::LAST_MODIFIED, date);
    }
    if found.is_storage_compressed() {
        response_headers.insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
    }
    if !found.is_storage_compressed() || send_compressed {
        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(found.len));
    }
    if send_compressed {
        response_headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }
    Ok(response)
}

/// Stream a storage-compressed file's logical bytes, decoding on a blocking thread.
fn decompressed_body(path: PathBuf) -> Body {
    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(4);
    tokio::task::spawn_blocking(move || {
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };
        let mut decoder = gzip::decoder(file);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match decoder.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    // the client went away
                    if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Failed to decompress stored object");
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    });

    Body::from_stream(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    }))
}

/// The tag of the gzip-encoded representation of a storage-compressed object,
/// kept apart from the decoded one: `"VKabc"` becomes `"VKabc-gzip"`.
fn gzip_entity_tag(etag: &str) -> String {
    match etag.strip_suffix('"') {
        Some(open) => format!("{open}-gzip\""),
        None => format!("{etag}-gzip"),
    }
}

fn not_modified(headers: &HeaderMap, etag: &str, modified: Option<SystemTime>) -> bool {
    if let Some(value) = headers.get(header::IF_NONE_MATCH) {
        let Ok(value) = value.to_str() else {
            return false;
        };
        return value
            .split(',')
            .map(str::trim)
            .any(|tag| tag == "*" || tag.trim_start_matches("W/") == etag);
    }

    let since = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok());
    match (since, modified) {
        (Some(since), Some(modified)) => {
            DateTime::<Utc>::from(modified).timestamp() <= since.timestamp()
        }
        _ => false,
    }
}

fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).format(HTTP_DATE).to_string()
}

fn insert_header(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
