//! Asynchronous push replication.
//!
//! Each peer has its own FIFO queue drained by one worker task, so pushes to a
//! peer happen in order while peers make progress independently. Failed pushes
//! stay at the head of the queue and are retried with exponential backoff.
//! Reconciliation diffs the local store against a peer via `/_missing` and feeds
//! the difference into the same queue.

mod backoff;
mod peer;
mod reconcile;

pub use backoff::Backoff;
pub use peer::{HttpPeerClient, Peer, PeerClient, PeerStatus, PushError, MISSING_PATH};

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::statistics::{Counter, PeerMetric, StatisticsSink};
use crate::store::{ContentStore, ObjectListener};

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Peer answered {0}: {1}")]
    Status(u16, String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct ReplicationSettings {
    pub backoff: Backoff,
    /// Approximate uncompressed bytes of paths per `/_missing` request.
    pub missing_batch_size: usize,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            missing_batch_size: 256 * 1024,
        }
    }
}

/// Owns every peer's queue and the tasks that drain them.
pub struct ReplicationManager {
    peers: Vec<Arc<Peer>>,
    store: ContentStore,
    client: Arc<dyn PeerClient>,
    statistics: Arc<dyn StatisticsSink>,
    settings: ReplicationSettings,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicationManager {
    /// `store` must not itself report to this manager.
    pub fn new(
        addresses: &[String],
        store: ContentStore,
        client: Arc<dyn PeerClient>,
        statistics: Arc<dyn StatisticsSink>,
        settings: ReplicationSettings,
    ) -> Self {
        Self {
            peers: addresses.iter().map(|a| Arc::new(Peer::new(a.clone()))).collect(),
            store,
            client,
            statistics,
            settings,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn peers(&self) -> &[Arc<Peer>] {
        &self.peers
    }

    pub fn has_peers(&self) -> bool {
        !self.peers.is_empty()
    }

    /// Spawn the push worker and reconciliation loop for every peer.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for peer in &self.peers {
            tasks.push(tokio::spawn(push_worker(
                Arc::clone(peer),
                self.store.clone(),
                Arc::clone(&self.client),
                Arc::clone(&self.statistics),
                self.settings.backoff,
                self.cancel.clone(),
            )));
            tasks.push(tokio::spawn(resync_loop(
                Arc::clone(peer),
                self.store.clone(),
                Arc::clone(&self.client),
                self.settings,
                self.cancel.clone(),
            )));
        }
    }

    /// Queue a stored object for every peer.
    pub fn enqueue(&self, stored_path: &str) {
        for peer in &self.peers {
            peer.enqueue(stored_path);
        }
    }

    /// Reconcile with every peer. A pass already waiting to run absorbs the request.
    pub fn reconcile_all(&self) {
        for peer in &self.peers {
            peer.request_resync();
        }
    }

    pub fn status(&self) -> Vec<PeerStatus> {
        self.peers.iter().map(|p| p.status()).collect()
    }

    /// Publish each peer's queue gauges.
    pub fn report_metrics(&self, sink: &dyn StatisticsSink) {
        for peer in &self.peers {
            sink.peer_metric(peer.address(), PeerMetric::QueueLength, peer.queue_length() as u64);
            sink.peer_metric(peer.address(), PeerMetric::SecondsBehind, peer.behind().as_secs());
        }
    }

    /// Stop all workers. Queued items are abandoned; reconciliation on the next
    /// start finds them again.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl ObjectListener for ReplicationManager {
    fn object_stored(&self, stored_path: &str) {
        self.enqueue(stored_path);
    }
}

async fn push_worker(
    peer: Arc<Peer>,
    store: ContentStore,
    client: Arc<dyn PeerClient>,
    statistics: Arc<dyn StatisticsSink>,
    backoff: Backoff,
    cancel: CancellationToken,
) {
    let mut failures = 0u32;
    loop {
        let Some(path) = peer.front() else {
            tokio::select! {
                _ = peer.wait_for_work() => {}
                _ = cancel.cancelled() => return,
            }
            continue;
        };

        let file = match tokio::fs::File::open(store.disk_path(&path)).await {
            Ok(file) => file,
            Err(e) => {
                tracing::error!(peer = %peer.address(), path = %path, error = %e, "Cannot open object for replication, dropping it");
                peer.complete();
                continue;
            }
        };

        statistics.increment(Counter::ReplicationPushAttempts);
        let result = tokio::select! {
            result = client.push(peer.address(), &path, file) => result,
            _ = cancel.cancelled() => return,
        };

        match result {
            Ok(()) => {
                peer.record_attempt(true);
                peer.complete();
                failures = 0;
                tracing::debug!(peer = %peer.address(), path = %path, "Replicated object");
            }
            Err(PushError::Rejected(status, body)) => {
                peer.record_attempt(false);
                statistics.increment(Counter::ReplicationPushAttemptsFailed);
                tracing::error!(
                    peer = %peer.address(),
                    path = %path,
                    status = status.as_u16(),
                    body = %body,
                    "Peer rejected object, dropping it"
                );
                peer.complete();
            }
            Err(PushError::Failed(reason)) => {
                peer.record_attempt(false);
                statistics.increment(Counter::ReplicationPushAttemptsFailed);
                failures += 1;
                let delay = backoff.delay(failures);
                tracing::warn!(
                    peer = %peer.address(),
                    path = %path,
                    error = %reason,
                    attempts = failures,
                    queued = peer.queue_length(),
                    "Replication push failed, retrying in {:?}",
                    delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }
}

async fn resync_loop(
    peer: Arc<Peer>,
    store: ContentStore,
    client: Arc<dyn PeerClient>,
    settings: ReplicationSettings,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = peer.wait_for_resync() => {}
            _ = cancel.cancelled() => return,
        }
        reconcile::reconcile(
            Arc::clone(&peer),
            store.clone(),
            Arc::clone(&client),
            settings.missing_batch_size,
            settings.backoff,
            cancel.clone(),
        )
        .await;
    }
}
