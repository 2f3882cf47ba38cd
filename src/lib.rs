//! content-store - A content-addressable object store over HTTP
//!
//! This crate provides:
//! - Hash-named, deduplicated, immutable object storage on a local filesystem
//! - Transparent gzip storage compression and content negotiation
//! - Asynchronous push replication to peers, with startup reconciliation
//! - Read forwarding to peers for objects not held locally

pub mod api;
pub mod codec;
pub mod config;
pub mod forwarding;
pub mod health;
pub mod mime;
pub mod replication;
pub mod server;
pub mod statistics;
pub mod store;
#[cfg(test)]
pub mod testutil;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use config::Config;
use forwarding::ReadForwarder;
use health::HealthCheck;
use mime::MimeRegistry;
use replication::{Backoff, HttpPeerClient, ReplicationManager, ReplicationSettings};
use statistics::Statistics;
use store::ContentStore;

/// Shared application state
pub struct AppState {
    pub config: Config,
    /// Reports new objects to `replication`
    pub store: ContentStore,
    pub mime: Arc<MimeRegistry>,
    pub replication: Arc<ReplicationManager>,
    pub forwarder: ReadForwarder,
    pub statistics: Arc<Statistics>,
    pub health: HealthCheck,
}

/// Wire up every component from configuration. Background tasks are not started.
pub fn build_state(config: Config) -> anyhow::Result<Arc<AppState>> {
    let mime = Arc::new(
        MimeRegistry::load(config.mime.types_file.as_deref().map(Path::new), config.mime.no_defaults)
            .context("Failed to load MIME types")?,
    );

    let store = ContentStore::open(config.data_path(), Arc::clone(&mime))
        .with_context(|| format!("Failed to open data directory {}", config.node.data_dir))?
        .with_max_upload_size(config.max_upload_size);

    let statistics = Arc::new(Statistics::new());

    let client = HttpPeerClient::new(config.http_timeout()).context("Failed to build HTTP client")?;
    let replication = Arc::new(ReplicationManager::new(
        &config.replication.peers,
        store.clone(),
        Arc::new(client),
        statistics.clone(),
        ReplicationSettings {
            backoff: Backoff::new(config.backoff_base(), config.backoff_max()),
            missing_batch_size: config.replication.missing_batch_size,
        },
    ));
    let store = store.with_listener(replication.clone());

    let forwarder = ReadForwarder::new(config.replication.peers.clone(), config.http_timeout())
        .context("Failed to build HTTP client")?;

    let health = HealthCheck::new(
        config.health.healthy_if_file.as_ref().map(Into::into),
        config.health.healthy_unless_file.as_ref().map(Into::into),
    );

    Ok(Arc::new(AppState {
        config,
        store,
        mime,
        replication,
        forwarder,
        statistics,
        health,
    }))
}
