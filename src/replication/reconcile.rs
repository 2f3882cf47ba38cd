use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::peer::{Peer, PeerClient};
use super::Backoff;
use crate::codec::gzip;
use crate::store::ContentStore;

/// Paths buffered between the directory walk and the batch sender.
const ENUMERATION_BUFFER: usize = 1000;

/// Compare everything stored locally against one peer and queue what it lacks.
///
/// The directory walk runs on a blocking thread and feeds a bounded channel, so a
/// slow peer throttles the walk instead of the walk filling memory.
pub(super) async fn reconcile(
    peer: Arc<Peer>,
    store: ContentStore,
    client: Arc<dyn PeerClient>,
    batch_size: usize,
    backoff: Backoff,
    cancel: CancellationToken,
) {
    tracing::info!(peer = %peer.address(), "Reconciling with peer");

    let (tx, mut rx) = mpsc::channel::<String>(ENUMERATION_BUFFER);
    let walker = tokio::task::spawn_blocking(move || {
        let mut sent = 0usize;
        for item in store.enumerate() {
            match item {
                Ok(path) => {
                    if tx.blocking_send(path).is_err() {
                        break;
                    }
                    sent += 1;
                }
                Err(e) => tracing::warn!(error = %e, "Error enumerating stored objects"),
            }
        }
        sent
    });

    let mut batch = Vec::with_capacity(batch_size);
    let mut queued = 0usize;
    loop {
        let next = tokio::select! {
            next = rx.recv() => next,
            _ = cancel.cancelled() => return,
        };
        let Some(path) = next else {
            break;
        };

        batch.extend_from_slice(path.as_bytes());
        batch.extend_from_slice(b"\r\n");
        if batch.len() >= batch_size {
            match send_batch(&peer, client.as_ref(), &batch, backoff, &cancel).await {
                Some(n) => queued += n,
                None => return,
            }
            batch.clear();
        }
    }

    if !batch.is_empty() {
        match send_batch(&peer, client.as_ref(), &batch, backoff, &cancel).await {
            Some(n) => queued += n,
            None => return,
        }
    }

    let checked = walker.await.unwrap_or_default();
    tracing::info!(peer = %peer.address(), checked, queued, "Reconciliation complete");
}

/// Send one batch until the peer answers, queueing whatever it reports missing.
/// Returns `None` if cancelled first.
async fn send_batch(
    peer: &Peer,
    client: &dyn PeerClient,
    batch: &[u8],
    backoff: Backoff,
    cancel: &CancellationToken,
) -> Option<usize> {
    let compressed = match gzip::compress(batch) {
        Ok(data) => Bytes::from(data),
        Err(e) => {
            tracing::error!(error = %e, "Failed to compress path list");
            return Some(0);
        }
    };

    let mut failures = 0;
    loop {
        match client.missing(peer.address(), compressed.clone()).await {
            Ok(missing) => {
                let n = missing.len();
                for path in missing {
                    peer.enqueue(path);
                }
                return Some(n);
            }
            Err(e) => {
                failures += 1;
                let delay = backoff.delay(failures);
                tracing::warn!(
                    peer = %peer.address(),
                    error = %e,
                    attempts = failures,
                    "Missing-object check failed, retrying in {:?}",
                    delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return None,
                }
            }
        }
    }
}
