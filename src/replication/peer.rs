use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::sync::Notify;
use tokio_util::io::ReaderStream;

use super::ReplicationError;
use crate::codec::gzip;

/// Path of the bulk presence check on every node.
pub const MISSING_PATH: &str = "/_missing";

struct Queued {
    path: String,
    queued_at: Instant,
}

/// One replication target and its outbound queue.
pub struct Peer {
    address: String,
    queue: Mutex<VecDeque<Queued>>,
    pending: Notify,
    resync: Notify,
    push_attempts: AtomicU64,
    push_failures: AtomicU64,
}

/// A snapshot of a peer's replication progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub address: String,
    pub queue_length: usize,
    pub seconds_behind: u64,
    pub push_attempts: u64,
    pub push_failures: u64,
}

impl Peer {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            queue: Mutex::new(VecDeque::new()),
            pending: Notify::new(),
            resync: Notify::new(),
            push_attempts: AtomicU64::new(0),
            push_failures: AtomicU64::new(0),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn enqueue(&self, path: impl Into<String>) {
        self.lock_queue().push_back(Queued {
            path: path.into(),
            queued_at: Instant::now(),
        });
        self.pending.notify_one();
    }

    /// The item at the head of the queue, left in place until [`Peer::complete`].
    pub(super) fn front(&self) -> Option<String> {
        self.lock_queue().front().map(|item| item.path.clone())
    }

    /// Remove the head item once it has been dealt with.
    pub(super) fn complete(&self) {
        self.lock_queue().pop_front();
    }

    /// Wait until something is enqueued.
    pub(super) async fn wait_for_work(&self) {
        self.pending.notified().await;
    }

    /// Ask for a reconciliation pass. Requests made while one is already pending
    /// collapse into it.
    pub(super) fn request_resync(&self) {
        self.resync.notify_one();
    }

    pub(super) async fn wait_for_resync(&self) {
        self.resync.notified().await;
    }

    pub(super) fn record_attempt(&self, success: bool) {
        self.push_attempts.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.push_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn queue_length(&self) -> usize {
        self.lock_queue().len()
    }

    /// Age of the oldest queued item.
    pub fn behind(&self) -> Duration {
        self.lock_queue()
            .front()
            .map(|item| item.queued_at.elapsed())
            .unwrap_or_default()
    }

    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            address: self.address.clone(),
            queue_length: self.queue_length(),
            seconds_behind: self.behind().as_secs(),
            push_attempts: self.push_attempts.load(Ordering::Relaxed),
            push_failures: self.push_failures.load(Ordering::Relaxed),
        }
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Queued>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Outcome of a push the peer answered.
#[derive(Debug)]
pub enum PushError {
    /// The peer refused the object; trying again cannot help.
    Rejected(StatusCode, String),
    /// Anything worth retrying: connection failures, timeouts, 5xx.
    Failed(String),
}

impl std::fmt::Display for PushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushError::Rejected(status, body) => write!(f, "rejected with {status}: {body}"),
            PushError::Failed(reason) => f.write_str(reason),
        }
    }
}

/// Network operations against a peer node.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// PUT an object's stored bytes to the same path on the peer.
    async fn push(&self, peer: &str, path: &str, file: tokio::fs::File) -> Result<(), PushError>;

    /// Send a gzip-compressed path list to the peer's `/_missing` endpoint and
    /// return the (decoded) list of paths it lacks.
    async fn missing(&self, peer: &str, compressed_list: Bytes) -> Result<Vec<String>, ReplicationError>;
}

/// [`PeerClient`] speaking plain HTTP.
pub struct HttpPeerClient {
    client: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> Result<Self, ReplicationError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn push(&self, peer: &str, path: &str, file: tokio::fs::File) -> Result<(), PushError> {
        let url = format!("http://{peer}{path}");
        let response = self
            .client
            .put(&url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(|e| PushError::Failed(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::CREATED {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let body = body.trim().to_string();
        if status == StatusCode::CONFLICT || status == StatusCode::UNPROCESSABLE_ENTITY {
            Err(PushError::Rejected(status, body))
        } else {
            Err(PushError::Failed(format!("HTTP {status}: {body}")))
        }
    }

    async fn missing(&self, peer: &str, compressed_list: Bytes) -> Result<Vec<String>, ReplicationError> {
        let url = format!("http://{peer}{MISSING_PATH}");
        let response = self
            .client
            .put(&url)
            .header(CONTENT_TYPE, "text/plain")
            .header(CONTENT_ENCODING, "gzip")
            .header(ACCEPT_ENCODING, "gzip")
            .body(compressed_list)
            .send()
            .await?;

        let status = response.status();
        let compressed = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
        // read everything first so a truncated response is an error, not a short list
        let body = response.bytes().await?;

        if status != StatusCode::OK {
            return Err(ReplicationError::Status(
                status.as_u16(),
                String::from_utf8_lossy(&body).trim().to_string(),
            ));
        }

        let list = if compressed {
            gzip::decompress(&body)?
        } else {
            body.to_vec()
        };

        Ok(String::from_utf8_lossy(&list)
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}
