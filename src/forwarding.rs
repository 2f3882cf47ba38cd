//! Serving reads for objects held only by a peer.

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;

/// Response headers passed back from the peer that served the object.
const FORWARDED_HEADERS: [header::HeaderName; 5] = [
    header::CONTENT_TYPE,
    header::CONTENT_ENCODING,
    header::CONTENT_LENGTH,
    header::LAST_MODIFIED,
    header::ETAG,
];

/// Asks peers, in configuration order, for objects missing locally.
///
/// Forwarded requests carry `forward=0`, so the peer answers only from its own
/// storage and never forwards again.
pub struct ReadForwarder {
    peers: Vec<String>,
    client: reqwest::Client,
}

impl ReadForwarder {
    pub fn new(peers: Vec<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { peers, client })
    }

    pub fn is_enabled(&self) -> bool {
        !self.peers.is_empty()
    }

    /// The first peer's successful response, streamed through unchanged.
    pub async fn fetch(&self, path: &str, request_headers: &HeaderMap) -> Option<Response> {
        for peer in &self.peers {
            let url = format!("http://{peer}{path}?forward=0");
            let mut request = self.client.get(&url);
            if let Some(accept) = request_headers.get(header::ACCEPT_ENCODING) {
                request = request.header(header::ACCEPT_ENCODING, accept.clone());
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(peer = %peer, path = %path, error = %e, "Error forwarding read to peer");
                    continue;
                }
            };

            match response.status() {
                StatusCode::OK => return Some(relay(response)),
                StatusCode::NOT_FOUND => continue,
                status => {
                    tracing::warn!(peer = %peer, path = %path, status = status.as_u16(), "Unexpected status forwarding read");
                }
            }
        }
        None
    }
}

fn relay(upstream: reqwest::Response) -> Response {
    let mut headers = HeaderMap::new();
    for name in FORWARDED_HEADERS {
        if let Some(value) = upstream.headers().get(&name) {
            headers.insert(name, value.clone());
        }
    }
    if !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
    }

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.headers_mut() = headers;
    response
}
